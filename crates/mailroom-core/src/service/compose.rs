//! Text and recipient rules for replies and forwards.

use mailroom_mime::Mailbox;

use crate::mail::{DeliveryStatus, Email, NewRecipient, RecipientKind};
use crate::{Error, Result};

/// Most distinct recipients of one email.
pub const MAX_RECIPIENTS: usize = 100;

/// Largest combined attachment size of one email.
pub const MAX_ATTACHMENT_BYTES: usize = 25 * 1024 * 1024;

/// Parses `To`, `Cc` and `Bcc` entries into recipient rows. Each entry may
/// hold one mailbox or a comma-separated list. Repeated addresses keep
/// their first occurrence.
///
/// # Errors
///
/// Returns [`Error::Validation`] naming the first malformed entry, or if
/// there are more than [`MAX_RECIPIENTS`] recipients.
pub fn parse_recipients(to: &[String], cc: &[String], bcc: &[String]) -> Result<Vec<NewRecipient>> {
    let mut out: Vec<NewRecipient> = Vec::new();
    for (kind, entries) in [
        (RecipientKind::To, to),
        (RecipientKind::Cc, cc),
        (RecipientKind::Bcc, bcc),
    ] {
        for entry in entries {
            let mailboxes = Mailbox::parse_list(entry)
                .map_err(|_| Error::Validation(format!("invalid recipient {entry:?}")))?;
            for mailbox in mailboxes {
                push_unique(&mut out, kind, mailbox);
            }
        }
    }
    if out.len() > MAX_RECIPIENTS {
        return Err(Error::Validation(format!(
            "at most {MAX_RECIPIENTS} recipients are allowed"
        )));
    }
    Ok(out)
}

fn push_unique(out: &mut Vec<NewRecipient>, kind: RecipientKind, mailbox: Mailbox) {
    if out
        .iter()
        .any(|r| r.address.eq_ignore_ascii_case(&mailbox.address))
    {
        return;
    }
    out.push(NewRecipient {
        kind,
        address: mailbox.address,
        name: mailbox.name,
        delivery_status: DeliveryStatus::Pending,
    });
}

/// Recipients of a reply to `original` written by `me`.
///
/// Replying to someone else's message addresses its author; replying to
/// one's own sent message addresses its original `To`. Reply-all adds the
/// remaining `To` and `Cc` recipients as `Cc`. `me` is never included.
#[must_use]
pub fn reply_recipients(original: &Email, me: &str, all: bool) -> Vec<NewRecipient> {
    let mut out = Vec::new();
    let is_mine = original.from_address.eq_ignore_ascii_case(me);
    let mailbox = |address: &str, name: Option<&String>| Mailbox {
        name: name.cloned(),
        address: address.to_string(),
    };

    if is_mine {
        for r in original.recipients_of(RecipientKind::To) {
            push_unique(&mut out, RecipientKind::To, mailbox(&r.address, r.name.as_ref()));
        }
    } else {
        push_unique(
            &mut out,
            RecipientKind::To,
            mailbox(&original.from_address, original.from_name.as_ref()),
        );
    }

    if all {
        let others = original
            .recipients_of(RecipientKind::To)
            .chain(original.recipients_of(RecipientKind::Cc));
        for r in others {
            push_unique(&mut out, RecipientKind::Cc, mailbox(&r.address, r.name.as_ref()));
        }
    }

    out.retain(|r| !r.address.eq_ignore_ascii_case(me));
    out
}

/// `Name <address>` or the bare address.
fn author(email: &Email) -> String {
    match &email.from_name {
        Some(name) => format!("{name} <{}>", email.from_address),
        None => email.from_address.clone(),
    }
}

/// Reply body: the new text followed by the quoted original.
#[must_use]
pub fn quote_reply(text: &str, original: &Email) -> String {
    let mut out = String::new();
    if !text.trim().is_empty() {
        out.push_str(text.trim_end());
        out.push_str("\n\n");
    }
    out.push_str(&format!(
        "On {}, {} wrote:\n",
        original.date().format("%a, %-d %b %Y at %H:%M UTC"),
        author(original)
    ));
    for line in original.body_text.lines() {
        if line.is_empty() {
            out.push_str(">\n");
        } else {
            out.push_str("> ");
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

/// Forward body: the new text followed by the original's headers and body.
#[must_use]
pub fn forward_body(text: &str, original: &Email) -> String {
    let mut out = String::new();
    if !text.trim().is_empty() {
        out.push_str(text.trim_end());
        out.push_str("\n\n");
    }
    out.push_str("---------- Forwarded message ----------\n");
    out.push_str(&format!("From: {}\n", author(original)));
    out.push_str(&format!("Date: {}\n", original.date().to_rfc2822()));
    out.push_str(&format!("Subject: {}\n", original.subject));
    let to: Vec<&str> = original
        .recipients_of(RecipientKind::To)
        .map(|r| r.address.as_str())
        .collect();
    if !to.is_empty() {
        out.push_str(&format!("To: {}\n", to.join(", ")));
    }
    out.push('\n');
    out.push_str(&original.body_text);
    out
}

/// References of a reply or forward: the original's chain plus itself.
#[must_use]
pub fn thread_references(original: &Email) -> Vec<String> {
    let mut refs = original.references.clone();
    if !refs.contains(&original.message_id) {
        refs.push(original.message_id.clone());
    }
    refs
}

/// Appends a signature block unless the body already ends with it.
#[must_use]
pub fn with_signature(body: &str, signature: Option<&str>) -> String {
    match signature.map(str::trim).filter(|s| !s.is_empty()) {
        Some(sig) if !body.trim_end().ends_with(sig) => {
            format!("{}\n\n-- \n{sig}", body.trim_end())
        }
        _ => body.to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::ids::{EmailId, ThreadId, UserId};
    use crate::mail::{EmailStatus, Folder, Recipient};
    use chrono::{TimeZone, Utc};

    fn recipient(kind: RecipientKind, address: &str) -> Recipient {
        Recipient {
            kind,
            address: address.into(),
            name: None,
            delivery_status: DeliveryStatus::Delivered,
            attempts: 1,
            last_error: None,
        }
    }

    fn original(from: &str) -> Email {
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 14, 30, 0).unwrap();
        Email {
            id: EmailId(1),
            user_id: UserId(1),
            thread_id: ThreadId(1),
            message_id: "m2@x".into(),
            in_reply_to: Some("m1@x".into()),
            references: vec!["m1@x".into()],
            from_address: from.into(),
            from_name: Some("Carol".into()),
            subject: "Plan".into(),
            body_text: "line one\n\nline two".into(),
            body_html: None,
            folder: Folder::Inbox,
            status: EmailStatus::Received,
            is_read: true,
            is_starred: false,
            size_bytes: 10,
            sent_at: None,
            received_at: Some(at),
            created_at: at,
            updated_at: at,
            recipients: vec![
                recipient(RecipientKind::To, "ada@example.com"),
                recipient(RecipientKind::To, "dan@example.org"),
                recipient(RecipientKind::Cc, "eve@example.org"),
            ],
            attachments: Vec::new(),
            labels: Vec::new(),
        }
    }

    #[test]
    fn parses_and_dedups_recipients() {
        let to = vec!["Bob <bob@example.org>, carol@example.org".to_string()];
        let cc = vec!["BOB@example.org".to_string()];
        let bcc = vec!["dan@example.org".to_string()];
        let parsed = parse_recipients(&to, &cc, &bcc).unwrap();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0].name.as_deref(), Some("Bob"));
        assert_eq!(parsed[2].kind, RecipientKind::Bcc);

        let bad = vec!["not an address".to_string()];
        assert!(matches!(
            parse_recipients(&bad, &[], &[]),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn reply_addresses_the_author() {
        let email = original("carol@example.org");
        let one = reply_recipients(&email, "ada@example.com", false);
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].address, "carol@example.org");

        let all = reply_recipients(&email, "ADA@example.com", true);
        let addresses: Vec<_> = all.iter().map(|r| r.address.as_str()).collect();
        assert_eq!(addresses, vec!["carol@example.org", "dan@example.org", "eve@example.org"]);
        assert_eq!(all[1].kind, RecipientKind::Cc);
    }

    #[test]
    fn reply_to_own_message_addresses_its_recipients() {
        let email = original("ada@example.com");
        let one = reply_recipients(&email, "ada@example.com", false);
        let addresses: Vec<_> = one.iter().map(|r| r.address.as_str()).collect();
        assert_eq!(addresses, vec!["dan@example.org"]);
    }

    #[test]
    fn quoting() {
        let email = original("carol@example.org");
        let body = quote_reply("Sounds good.", &email);
        assert_eq!(
            body,
            "Sounds good.\n\nOn Tue, 5 Mar 2024 at 14:30 UTC, Carol <carol@example.org> wrote:\n\
             > line one\n>\n> line two\n"
        );
    }

    #[test]
    fn forward_block() {
        let email = original("carol@example.org");
        let body = forward_body("", &email);
        assert!(body.starts_with("---------- Forwarded message ----------\nFrom: Carol"));
        assert!(body.contains("Subject: Plan\n"));
        assert!(body.contains("To: ada@example.com, dan@example.org\n"));
        assert!(body.ends_with("line one\n\nline two"));
    }

    #[test]
    fn references_extend_the_chain() {
        let email = original("carol@example.org");
        assert_eq!(thread_references(&email), vec!["m1@x", "m2@x"]);
    }

    #[test]
    fn signatures_are_appended_once() {
        assert_eq!(with_signature("Hi", Some("Ada")), "Hi\n\n-- \nAda");
        assert_eq!(with_signature("Hi\n\n-- \nAda", Some("Ada")), "Hi\n\n-- \nAda");
        assert_eq!(with_signature("Hi", Some("  ")), "Hi");
        assert_eq!(with_signature("Hi", None), "Hi");
    }
}
