//! Outgoing message construction.

use crate::address::{Mailbox, format_list};
use crate::content_type::{ContentDisposition, ContentType};
use crate::encoding::{encode_base64_wrapped, encode_quoted_printable, encode_rfc2047};
use crate::error::{Error, Result};
use crate::header::Headers;
use chrono::{DateTime, Utc};

/// A file attached to an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// File name shown to the recipient.
    pub filename: String,
    /// Content type of the file.
    pub content_type: ContentType,
    /// Raw bytes.
    pub content: Vec<u8>,
    /// `Content-ID` for inline references (`cid:`), without brackets.
    pub content_id: Option<String>,
}

impl Attachment {
    /// Creates an attachment.
    #[must_use]
    pub fn new(filename: impl Into<String>, content_type: ContentType, content: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            content_type,
            content,
            content_id: None,
        }
    }
}

/// A rendered message ready for SMTP `DATA`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltMessage {
    /// `Message-ID` without angle brackets.
    pub message_id: String,
    /// Envelope recipients: To, Cc and Bcc addresses.
    pub recipients: Vec<String>,
    /// RFC 5322 bytes with CRLF line endings.
    pub bytes: Vec<u8>,
}

/// Builds RFC 5322 messages.
///
/// Bcc recipients are part of the envelope but never written as a header.
#[derive(Debug, Clone, Default)]
pub struct MessageBuilder {
    from: Option<Mailbox>,
    to: Vec<Mailbox>,
    cc: Vec<Mailbox>,
    bcc: Vec<Mailbox>,
    reply_to: Option<Mailbox>,
    subject: Option<String>,
    date: Option<DateTime<Utc>>,
    message_id: Option<String>,
    in_reply_to: Option<String>,
    references: Vec<String>,
    text: Option<String>,
    html: Option<String>,
    attachments: Vec<Attachment>,
    extra: Headers,
}

impl MessageBuilder {
    /// Creates an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the author.
    #[must_use]
    pub fn from(mut self, mailbox: Mailbox) -> Self {
        self.from = Some(mailbox);
        self
    }

    /// Adds a To recipient.
    #[must_use]
    pub fn to(mut self, mailbox: Mailbox) -> Self {
        self.to.push(mailbox);
        self
    }

    /// Adds a Cc recipient.
    #[must_use]
    pub fn cc(mut self, mailbox: Mailbox) -> Self {
        self.cc.push(mailbox);
        self
    }

    /// Adds a Bcc recipient.
    #[must_use]
    pub fn bcc(mut self, mailbox: Mailbox) -> Self {
        self.bcc.push(mailbox);
        self
    }

    /// Sets Reply-To.
    #[must_use]
    pub fn reply_to(mut self, mailbox: Mailbox) -> Self {
        self.reply_to = Some(mailbox);
        self
    }

    /// Sets the subject.
    #[must_use]
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// Sets the Date header; defaults to now.
    #[must_use]
    pub const fn date(mut self, date: DateTime<Utc>) -> Self {
        self.date = Some(date);
        self
    }

    /// Sets the Message-ID (without brackets); defaults to a random id at
    /// the author's domain.
    #[must_use]
    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(strip_brackets(&id.into()));
        self
    }

    /// Sets In-Reply-To.
    #[must_use]
    pub fn in_reply_to(mut self, id: impl Into<String>) -> Self {
        self.in_reply_to = Some(strip_brackets(&id.into()));
        self
    }

    /// Sets References, oldest first.
    #[must_use]
    pub fn references<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.references = ids
            .into_iter()
            .map(|id| strip_brackets(id.as_ref()))
            .filter(|id| !id.is_empty())
            .collect();
        self
    }

    /// Sets the plain text body.
    #[must_use]
    pub fn text_body(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Sets the HTML body.
    #[must_use]
    pub fn html_body(mut self, html: impl Into<String>) -> Self {
        self.html = Some(html.into());
        self
    }

    /// Adds an attachment.
    #[must_use]
    pub fn attach(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    /// Adds an extra header, written after the standard ones.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.add(name, value);
        self
    }

    /// Renders the message.
    ///
    /// # Errors
    ///
    /// Returns an error if there is no author or no recipient.
    pub fn build(self) -> Result<BuiltMessage> {
        let from = self
            .from
            .ok_or_else(|| Error::MissingHeader("From".to_string()))?;
        if self.to.is_empty() && self.cc.is_empty() && self.bcc.is_empty() {
            return Err(Error::MissingHeader("To".to_string()));
        }

        let message_id = self
            .message_id
            .unwrap_or_else(|| new_message_id(&from.domain()));

        let mut headers = Headers::new();
        headers.add("From", from.to_header());
        if !self.to.is_empty() {
            headers.add("To", format_list(&self.to));
        }
        if !self.cc.is_empty() {
            headers.add("Cc", format_list(&self.cc));
        }
        if let Some(reply_to) = &self.reply_to {
            headers.add("Reply-To", reply_to.to_header());
        }
        headers.add("Subject", encode_rfc2047(self.subject.as_deref().unwrap_or("")));
        headers.add("Date", self.date.unwrap_or_else(Utc::now).to_rfc2822());
        headers.add("Message-ID", format!("<{message_id}>"));
        if let Some(parent) = &self.in_reply_to {
            headers.add("In-Reply-To", format!("<{parent}>"));
        }
        if !self.references.is_empty() {
            let refs: Vec<String> = self.references.iter().map(|r| format!("<{r}>")).collect();
            headers.add("References", refs.join(" "));
        }
        for (name, value) in self.extra.iter() {
            headers.add(name, value);
        }
        headers.add("MIME-Version", "1.0");

        let body = match (self.text, self.html) {
            (Some(text), Some(html)) => Entity::multipart(
                "alternative",
                vec![
                    Entity::text(&text, ContentType::text_plain()),
                    Entity::text(&html, ContentType::text_html()),
                ],
            ),
            (None, Some(html)) => Entity::text(&html, ContentType::text_html()),
            (text, None) => Entity::text(&text.unwrap_or_default(), ContentType::text_plain()),
        };

        let root = if self.attachments.is_empty() {
            body
        } else {
            let mut parts = vec![body];
            parts.extend(self.attachments.iter().map(Entity::attachment));
            Entity::multipart("mixed", parts)
        };

        let mut bytes = headers.to_string().into_bytes();
        root.write(&mut bytes);

        let recipients = self
            .to
            .iter()
            .chain(&self.cc)
            .chain(&self.bcc)
            .map(|m| m.address.clone())
            .collect();

        Ok(BuiltMessage {
            message_id,
            recipients,
            bytes,
        })
    }
}

/// One MIME entity: headers plus an encoded body or child entities.
struct Entity {
    headers: Headers,
    body: EntityBody,
}

enum EntityBody {
    Leaf(String),
    Multipart { boundary: String, parts: Vec<Entity> },
}

impl Entity {
    fn text(text: &str, content_type: ContentType) -> Self {
        let mut headers = Headers::new();
        headers.add("Content-Type", content_type.to_string());

        let normalized = text.replace("\r\n", "\n");
        let plain = normalized.is_ascii() && normalized.lines().all(|l| l.len() <= 998);
        let body = if plain {
            headers.add("Content-Transfer-Encoding", "7bit");
            normalized.replace('\n', "\r\n")
        } else {
            headers.add("Content-Transfer-Encoding", "quoted-printable");
            encode_quoted_printable(normalized.as_bytes())
        };

        Self {
            headers,
            body: EntityBody::Leaf(body),
        }
    }

    fn attachment(attachment: &Attachment) -> Self {
        let mut headers = Headers::new();
        let content_type = attachment
            .content_type
            .clone()
            .with_parameter("name", attachment.filename.clone());
        headers.add("Content-Type", content_type.to_string());
        let disposition = match &attachment.content_id {
            Some(cid) => {
                headers.add("Content-ID", format!("<{cid}>"));
                ContentDisposition::inline(Some(&attachment.filename))
            }
            None => ContentDisposition::attachment(&attachment.filename),
        };
        headers.add("Content-Disposition", disposition.to_string());
        headers.add("Content-Transfer-Encoding", "base64");

        Self {
            headers,
            body: EntityBody::Leaf(encode_base64_wrapped(&attachment.content)),
        }
    }

    fn multipart(sub_type: &str, parts: Vec<Self>) -> Self {
        let boundary = generate_boundary();
        let mut headers = Headers::new();
        headers.add(
            "Content-Type",
            ContentType::multipart(sub_type, boundary.clone()).to_string(),
        );
        Self {
            headers,
            body: EntityBody::Multipart { boundary, parts },
        }
    }

    /// Appends the entity headers, the blank line and the body to `out`.
    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.headers.to_string().as_bytes());
        out.extend_from_slice(b"\r\n");
        match &self.body {
            EntityBody::Leaf(body) => {
                out.extend_from_slice(body.as_bytes());
                if !body.ends_with("\r\n") {
                    out.extend_from_slice(b"\r\n");
                }
            }
            EntityBody::Multipart { boundary, parts } => {
                out.extend_from_slice(b"This is a multi-part message in MIME format.\r\n");
                for part in parts {
                    out.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
                    part.write(out);
                }
                out.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
            }
        }
    }
}

fn generate_boundary() -> String {
    format!("=_mr_{:032x}", rand::random::<u128>())
}

/// A fresh Message-ID (without brackets) at `domain`.
#[must_use]
pub fn new_message_id(domain: &str) -> String {
    let domain = if domain.is_empty() { "localhost" } else { domain };
    format!(
        "{}.{:016x}@{domain}",
        Utc::now().timestamp_millis(),
        rand::random::<u64>()
    )
}

fn strip_brackets(id: &str) -> String {
    id.trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn mb(s: &str) -> Mailbox {
        Mailbox::parse(s).unwrap()
    }

    fn render(builder: MessageBuilder) -> String {
        String::from_utf8(builder.build().unwrap().bytes).unwrap()
    }

    #[test]
    fn requires_author_and_recipient() {
        assert!(matches!(
            MessageBuilder::new().to(mb("a@example.com")).build(),
            Err(Error::MissingHeader(h)) if h == "From"
        ));
        assert!(matches!(
            MessageBuilder::new().from(mb("a@example.com")).build(),
            Err(Error::MissingHeader(h)) if h == "To"
        ));
    }

    #[test]
    fn plain_text_message() {
        let built = MessageBuilder::new()
            .from(mb("Ada <ada@example.com>"))
            .to(mb("bob@example.org"))
            .subject("Hello")
            .text_body("line one\nline two")
            .build()
            .unwrap();
        let raw = String::from_utf8(built.bytes).unwrap();

        assert!(raw.starts_with("From: Ada <ada@example.com>\r\n"));
        assert!(raw.contains("Subject: Hello\r\n"));
        assert!(raw.contains("MIME-Version: 1.0\r\n"));
        assert!(raw.contains("Content-Type: text/plain; charset=utf-8\r\n"));
        assert!(raw.ends_with("\r\n\r\nline one\r\nline two\r\n"));
        assert!(built.message_id.ends_with("@example.com"));
        assert!(raw.contains(&format!("Message-ID: <{}>", built.message_id)));
    }

    #[test]
    fn bcc_is_envelope_only() {
        let built = MessageBuilder::new()
            .from(mb("ada@example.com"))
            .to(mb("to@example.org"))
            .cc(mb("cc@example.org"))
            .bcc(mb("hidden@example.org"))
            .build()
            .unwrap();
        let raw = String::from_utf8(built.bytes).unwrap();

        assert!(!raw.contains("hidden@example.org"));
        assert!(!raw.to_ascii_lowercase().contains("bcc:"));
        assert_eq!(
            built.recipients,
            vec!["to@example.org", "cc@example.org", "hidden@example.org"]
        );
    }

    #[test]
    fn non_ascii_subject_and_body_are_encoded() {
        let raw = render(
            MessageBuilder::new()
                .from(mb("ada@example.com"))
                .to(mb("bob@example.org"))
                .subject("Café")
                .text_body("crème brûlée"),
        );
        assert!(raw.contains("Subject: =?utf-8?B?"));
        assert!(raw.contains("Content-Transfer-Encoding: quoted-printable"));
        assert!(raw.is_ascii());
    }

    #[test]
    fn text_and_html_become_alternative() {
        let raw = render(
            MessageBuilder::new()
                .from(mb("ada@example.com"))
                .to(mb("bob@example.org"))
                .text_body("hi")
                .html_body("<p>hi</p>"),
        );
        assert!(raw.contains("Content-Type: multipart/alternative;"));
        assert!(raw.contains("boundary=\"=_mr_"));
        assert!(raw.find("text/plain").unwrap() < raw.find("text/html").unwrap());
    }

    #[test]
    fn attachments_wrap_in_mixed() {
        let raw = render(
            MessageBuilder::new()
                .from(mb("ada@example.com"))
                .to(mb("bob@example.org"))
                .text_body("see attached")
                .attach(Attachment::new(
                    "data.bin",
                    ContentType::octet_stream(),
                    vec![0, 1, 2, 3],
                )),
        );
        assert!(raw.contains("Content-Type: multipart/mixed;"));
        assert!(raw.contains("Content-Disposition: attachment; filename=data.bin"));
        assert!(raw.contains("Content-Transfer-Encoding: base64\r\n\r\nAAECAw==\r\n"));
    }

    #[test]
    fn threading_headers() {
        let raw = render(
            MessageBuilder::new()
                .from(mb("ada@example.com"))
                .to(mb("bob@example.org"))
                .in_reply_to("<b@example.org>")
                .references(["a@example.org", "<b@example.org>"]),
        );
        assert!(raw.contains("In-Reply-To: <b@example.org>\r\n"));
        assert!(raw.contains("References: <a@example.org> <b@example.org>\r\n"));
    }
}
