//! Consumes `email-receive`: files raw messages into recipients' inboxes.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use mailroom_mime::ParsedMessage;
use mailroom_queue::{HandlerOutcome, Record, RecordHandler};
use sha2::{Digest, Sha256};
use std::fmt::Write;
use tracing::{debug, info, warn};

use super::{MAIL_FROM_HEADER, RCPT_TO_HEADER};
use crate::analytics::{AnalyticsEvent, AnalyticsRepository};
use crate::db::Database;
use crate::ids::ThreadId;
use crate::mail::{
    DeliveryStatus, EmailStatus, Folder, MailRepository, NewAttachment, NewEmail, NewRecipient,
    RecipientKind, normalize_subject,
};
use crate::notify::{MailEvent, Notifier};
use crate::user::{User, UserRepository};
use crate::{Error, Result};

/// How far back a subject match may join an existing thread.
pub const THREAD_WINDOW_DAYS: i64 = 30;

/// Sender shown when a message carries neither `From` nor a reverse path.
const UNKNOWN_SENDER: &str = "mailer-daemon@localhost";

/// Handler of the `email-receive` topic.
#[derive(Debug)]
pub struct ReceiveWorker {
    mail: MailRepository,
    users: UserRepository,
    analytics: AnalyticsRepository,
    notifier: Notifier,
}

impl ReceiveWorker {
    /// Creates the worker.
    #[must_use]
    pub fn new(db: &Database, notifier: Notifier) -> Self {
        Self {
            mail: MailRepository::new(db),
            users: UserRepository::new(db),
            analytics: AnalyticsRepository::new(db),
            notifier,
        }
    }

    /// Files the message for every known recipient. Returns how many
    /// mailboxes got a new copy, or `None` if no recipient has a mailbox.
    async fn file(&self, record: &Record, parsed: &ParsedMessage) -> Result<Option<usize>> {
        let rcpts: Vec<&str> = record
            .header(RCPT_TO_HEADER)
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .collect();

        let message_id = parsed
            .message_id()
            .unwrap_or_else(|| synthetic_message_id(&record.payload));

        let mut known = 0;
        let mut filed = 0;
        for rcpt in rcpts {
            let Some(user) = self.users.find_by_email(rcpt).await? else {
                debug!(rcpt, "no mailbox for recipient");
                continue;
            };
            known += 1;
            if self.mail.has_message(user.id, &message_id).await? {
                debug!(rcpt, %message_id, "already delivered");
                continue;
            }
            if self.file_for(&user, record, parsed, &message_id).await? {
                filed += 1;
            }
        }
        Ok((known > 0).then_some(filed))
    }

    async fn file_for(
        &self,
        user: &User,
        record: &Record,
        parsed: &ParsedMessage,
        message_id: &str,
    ) -> Result<bool> {
        let subject = parsed.subject();
        let thread_id = self.find_thread(user, parsed, &subject).await?;

        let (from_address, from_name) = match parsed.from() {
            Some(from) => (from.address, from.name),
            None => (
                record
                    .header(MAIL_FROM_HEADER)
                    .filter(|f| !f.is_empty())
                    .unwrap_or(UNKNOWN_SENDER)
                    .to_string(),
                None,
            ),
        };

        let mut recipients: Vec<NewRecipient> = parsed
            .to()
            .into_iter()
            .map(|m| (RecipientKind::To, m))
            .chain(parsed.cc().into_iter().map(|m| (RecipientKind::Cc, m)))
            .map(|(kind, m)| NewRecipient {
                kind,
                address: m.address,
                name: m.name,
                delivery_status: DeliveryStatus::Delivered,
            })
            .collect();
        if !recipients
            .iter()
            .any(|r| r.address.eq_ignore_ascii_case(&user.email))
        {
            // Not in the headers: the user was a blind copy.
            recipients.push(NewRecipient {
                kind: RecipientKind::Bcc,
                address: user.email.clone(),
                name: None,
                delivery_status: DeliveryStatus::Delivered,
            });
        }

        let attachments = parsed
            .attachments
            .iter()
            .map(|a| NewAttachment {
                filename: a.filename.clone(),
                content_type: Some(a.content_type.essence()),
                content_id: a.content_id.clone(),
                content: a.content.clone(),
            })
            .collect();

        let email = NewEmail {
            user_id: user.id,
            thread_id,
            message_id: message_id.to_string(),
            in_reply_to: parsed.in_reply_to(),
            references: parsed.references(),
            from_address,
            from_name,
            subject,
            body_text: parsed.text.clone().unwrap_or_default(),
            body_html: parsed.html.clone(),
            folder: Folder::Inbox,
            status: EmailStatus::Received,
            is_read: false,
            size_bytes: i64::try_from(record.payload.len()).unwrap_or(i64::MAX),
            sent_at: parsed.date(),
            received_at: Some(Utc::now()),
            recipients,
            attachments,
        };

        let id = match self.mail.insert(&email).await {
            Ok(id) => id,
            // A concurrent copy of the same message won the race.
            Err(Error::Conflict(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        self.analytics
            .record(
                user.id,
                Some(id),
                AnalyticsEvent::Received,
                Some(&user.email),
                Some(&email.from_address),
            )
            .await?;
        self.notifier.publish(MailEvent::new_mail(user.id, id));
        info!(user_id = %user.id, email_id = %id, from = %email.from_address, "mail received");
        Ok(true)
    }

    /// Thread by `References`/`In-Reply-To`, then by subject within
    /// [`THREAD_WINDOW_DAYS`]. `None` starts a new thread.
    async fn find_thread(
        &self,
        user: &User,
        parsed: &ParsedMessage,
        subject: &str,
    ) -> Result<Option<ThreadId>> {
        let mut ids = parsed.references();
        if let Some(parent) = parsed.in_reply_to() {
            ids.push(parent);
        }
        if let Some(thread) = self.mail.thread_by_message_ids(user.id, &ids).await? {
            return Ok(Some(thread));
        }
        let since = Utc::now() - Duration::days(THREAD_WINDOW_DAYS);
        self.mail
            .thread_by_subject(user.id, &normalize_subject(subject), since)
            .await
    }
}

#[async_trait]
impl RecordHandler for ReceiveWorker {
    async fn handle(&self, record: &Record) -> HandlerOutcome {
        let parsed = match ParsedMessage::parse(&record.payload) {
            Ok(parsed) => parsed,
            Err(e) => return HandlerOutcome::Reject(format!("unparseable message: {e}")),
        };
        match self.file(record, &parsed).await {
            Ok(Some(_)) => HandlerOutcome::Done,
            Ok(None) => HandlerOutcome::Reject("no local recipient".into()),
            Err(e) => {
                warn!(position = %record.position(), error = %e, "filing failed");
                HandlerOutcome::Retry(e.to_string())
            }
        }
    }
}

/// Stable id for messages without a `Message-ID` header, so redelivery of
/// the same bytes is still recognized.
fn synthetic_message_id(payload: &[u8]) -> String {
    let digest = Sha256::digest(payload);
    let mut id = String::with_capacity(80);
    for byte in &digest[..16] {
        let _ = write!(id, "{byte:02x}");
    }
    id.push_str("@mailroom.invalid");
    id
}
