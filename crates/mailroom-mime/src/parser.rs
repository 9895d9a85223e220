//! Incoming message parsing.

use crate::address::Mailbox;
use crate::content_type::{ContentDisposition, ContentType};
use crate::encoding::{decode_base64, decode_charset, decode_quoted_printable, decode_rfc2047};
use crate::error::{Error, Result};
use crate::header::Headers;
use chrono::{DateTime, Utc};
use tracing::debug;

/// Multipart nesting deeper than this is treated as opaque data.
const MAX_DEPTH: usize = 16;

/// Content transfer encoding of a body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEncoding {
    /// 7-bit ASCII.
    SevenBit,
    /// 8-bit data.
    EightBit,
    /// Base64.
    Base64,
    /// Quoted-Printable.
    QuotedPrintable,
    /// Binary.
    Binary,
}

impl TransferEncoding {
    /// Parses a `Content-Transfer-Encoding` value; unknown values are 7bit.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "8bit" => Self::EightBit,
            "base64" => Self::Base64,
            "quoted-printable" => Self::QuotedPrintable,
            "binary" => Self::Binary,
            _ => Self::SevenBit,
        }
    }

    /// Decodes a body. Malformed encodings fall back to the raw bytes.
    #[must_use]
    pub fn decode(self, body: &[u8]) -> Vec<u8> {
        let decoded = match self {
            Self::Base64 => decode_base64(&String::from_utf8_lossy(body)),
            Self::QuotedPrintable => decode_quoted_printable(&String::from_utf8_lossy(body)),
            Self::SevenBit | Self::EightBit | Self::Binary => return body.to_vec(),
        };
        decoded.unwrap_or_else(|e| {
            debug!(error = %e, "undecodable body, keeping raw bytes");
            body.to_vec()
        })
    }
}

/// An attachment found in a parsed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAttachment {
    /// File name, or a generated `part-N` name when absent.
    pub filename: String,
    /// Content type of the part.
    pub content_type: ContentType,
    /// Decoded bytes.
    pub content: Vec<u8>,
    /// `Content-ID` without brackets.
    pub content_id: Option<String>,
}

/// A parsed RFC 5322 message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMessage {
    /// Top-level headers.
    pub headers: Headers,
    /// First `text/plain` body, decoded.
    pub text: Option<String>,
    /// First `text/html` body, decoded.
    pub html: Option<String>,
    /// Attachments in document order.
    pub attachments: Vec<ParsedAttachment>,
}

impl ParsedMessage {
    /// Parses raw message bytes.
    ///
    /// Multipart bodies are walked recursively. Text is decoded from its
    /// declared charset, replacing invalid sequences.
    ///
    /// # Errors
    ///
    /// Returns an error if the input has no header section.
    pub fn parse(raw: &[u8]) -> Result<Self> {
        let (header_bytes, body) = split_header_body(raw);
        let headers = Headers::parse(&String::from_utf8_lossy(header_bytes));
        if headers.is_empty() {
            return Err(Error::Parse("message has no header section".to_string()));
        }

        let mut message = Self {
            headers: headers.clone(),
            text: None,
            html: None,
            attachments: Vec::new(),
        };
        message.walk(&headers, body, 0);
        Ok(message)
    }

    fn walk(&mut self, headers: &Headers, body: &[u8], depth: usize) {
        let content_type = headers
            .get("content-type")
            .and_then(|v| ContentType::parse(v).ok())
            .unwrap_or_else(ContentType::text_plain);
        let disposition = headers.get("content-disposition").map(ContentDisposition::parse);

        if content_type.is_multipart() && depth < MAX_DEPTH {
            if let Some(boundary) = content_type.boundary() {
                for part in split_multipart(body, boundary) {
                    let (part_headers, part_body) = split_header_body(part);
                    let part_headers = Headers::parse(&String::from_utf8_lossy(part_headers));
                    self.walk(&part_headers, part_body, depth + 1);
                }
                return;
            }
            debug!("multipart without boundary, treating as text");
        }

        let encoding = headers
            .get("content-transfer-encoding")
            .map_or(TransferEncoding::SevenBit, TransferEncoding::parse);
        let decoded = encoding.decode(body);

        let filename = disposition
            .as_ref()
            .and_then(|d| d.filename().map(str::to_string))
            .or_else(|| content_type.parameter("name").map(str::to_string));
        let is_attachment = disposition.as_ref().is_some_and(ContentDisposition::is_attachment)
            || (!content_type.is_text() && !content_type.is_multipart())
            || (content_type.is_text() && filename.is_some());

        if !is_attachment {
            let charset = content_type.charset().unwrap_or("utf-8");
            let text = decode_charset(&decoded, charset);
            if content_type.is("text", "html") {
                if self.html.is_none() {
                    self.html = Some(text);
                    return;
                }
            } else if self.text.is_none() {
                self.text = Some(text);
                return;
            }
        }

        let filename = filename.unwrap_or_else(|| format!("part-{}", self.attachments.len() + 1));
        let content_id = headers
            .get("content-id")
            .map(|id| id.trim().trim_start_matches('<').trim_end_matches('>').to_string());
        self.attachments.push(ParsedAttachment {
            filename: decode_rfc2047(&filename),
            content_type,
            content: decoded,
            content_id,
        });
    }

    /// Decoded Subject, empty when absent.
    #[must_use]
    pub fn subject(&self) -> String {
        self.headers.get_decoded("subject").unwrap_or_default()
    }

    /// First mailbox of the From header.
    #[must_use]
    pub fn from(&self) -> Option<Mailbox> {
        self.headers
            .get("from")
            .and_then(|v| Mailbox::parse_list_lenient(v).into_iter().next())
    }

    /// To mailboxes; unparseable entries are dropped.
    #[must_use]
    pub fn to(&self) -> Vec<Mailbox> {
        self.mailboxes("to")
    }

    /// Cc mailboxes; unparseable entries are dropped.
    #[must_use]
    pub fn cc(&self) -> Vec<Mailbox> {
        self.mailboxes("cc")
    }

    fn mailboxes(&self, name: &str) -> Vec<Mailbox> {
        self.headers
            .get_all(name)
            .into_iter()
            .flat_map(Mailbox::parse_list_lenient)
            .collect()
    }

    /// Message-ID without brackets.
    #[must_use]
    pub fn message_id(&self) -> Option<String> {
        self.headers
            .get("message-id")
            .and_then(|v| msg_ids(v).into_iter().next())
    }

    /// In-Reply-To without brackets.
    #[must_use]
    pub fn in_reply_to(&self) -> Option<String> {
        self.headers
            .get("in-reply-to")
            .and_then(|v| msg_ids(v).into_iter().next())
    }

    /// References without brackets, oldest first.
    #[must_use]
    pub fn references(&self) -> Vec<String> {
        self.headers.get("references").map(msg_ids).unwrap_or_default()
    }

    /// The Date header, when it parses as RFC 2822.
    #[must_use]
    pub fn date(&self) -> Option<DateTime<Utc>> {
        let value = self.headers.get("date")?;
        // Drop trailing comments such as "(UTC)".
        let value = value.split('(').next().unwrap_or(value).trim();
        DateTime::parse_from_rfc2822(value)
            .ok()
            .map(|d| d.with_timezone(&Utc))
    }
}

/// Extracts `<id>` tokens; a bare value without brackets is taken whole.
fn msg_ids(value: &str) -> Vec<String> {
    let mut ids = Vec::new();
    let mut rest = value;
    while let Some(start) = rest.find('<') {
        let Some(len) = rest[start..].find('>') else {
            break;
        };
        let id = rest[start + 1..start + len].trim();
        if !id.is_empty() {
            ids.push(id.to_string());
        }
        rest = &rest[start + len + 1..];
    }
    if ids.is_empty() {
        let bare = value.trim();
        if !bare.is_empty() && !bare.contains(char::is_whitespace) {
            ids.push(bare.to_string());
        }
    }
    ids
}

/// Splits at the first blank line (CRLF CRLF or LF LF).
fn split_header_body(raw: &[u8]) -> (&[u8], &[u8]) {
    let crlf = find(raw, b"\r\n\r\n").map(|i| (i, i + 4));
    let lf = find(raw, b"\n\n").map(|i| (i, i + 2));
    let split = match (crlf, lf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    };
    match split {
        Some((end, start)) => (&raw[..end], &raw[start..]),
        // A body-less message, or a part that starts with its blank line.
        None if raw.starts_with(b"\r\n") => (&[], &raw[2..]),
        None if raw.starts_with(b"\n") => (&[], &raw[1..]),
        None => (raw, &[]),
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Splits a multipart body into its parts; the preamble and epilogue are
/// dropped. A missing close delimiter ends the last part at end of input.
fn split_multipart<'a>(body: &'a [u8], boundary: &str) -> Vec<&'a [u8]> {
    let delimiter = format!("--{boundary}");
    let close = format!("--{boundary}--");
    let mut parts = Vec::new();
    let mut current: Option<usize> = None;
    let mut pos = 0;

    while pos < body.len() {
        let line_end = body[pos..]
            .iter()
            .position(|&b| b == b'\n')
            .map_or(body.len(), |i| pos + i + 1);
        let line = trim_line(&body[pos..line_end]);

        let is_close = line == close.as_bytes();
        if is_close || line == delimiter.as_bytes() {
            if let Some(start) = current.take() {
                parts.push(strip_trailing_newline(&body[start..pos]));
            }
            if is_close {
                return parts;
            }
            current = Some(line_end);
        }
        pos = line_end;
    }

    if let Some(start) = current {
        if start < body.len() {
            parts.push(&body[start..]);
        }
    }
    parts
}

fn trim_line(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\r' | b'\n' | b' ' | b'\t') {
        end -= 1;
    }
    &line[..end]
}

/// The CRLF before a delimiter belongs to the delimiter.
fn strip_trailing_newline(part: &[u8]) -> &[u8] {
    part.strip_suffix(b"\r\n")
        .or_else(|| part.strip_suffix(b"\n"))
        .unwrap_or(part)
}
