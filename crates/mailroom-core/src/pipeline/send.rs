//! Consumes `email-send`: builds the message and delivers it to every open
//! recipient, locally or through the relay.

use async_trait::async_trait;
use chrono::Utc;
use mailroom_mime::{Attachment, BuiltMessage, ContentType, Mailbox, MessageBuilder};
use mailroom_queue::{Broker, HandlerOutcome, ProducerRecord, Record, RecordHandler};
use mailroom_smtp::{Address, Envelope, RecipientOutcome};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::transport::MailTransport;
use super::{LocalDomains, MAIL_FROM_HEADER, RCPT_TO_HEADER, RECEIVE_TOPIC, SendJob};
use crate::analytics::{AnalyticsEvent, AnalyticsRepository};
use crate::db::Database;
use crate::mail::{
    AttachmentData, DeliveryStatus, Email, EmailStatus, Folder, MailRepository, RecipientKind,
};
use crate::notify::{MailEvent, Notifier};
use crate::user::UserRepository;
use crate::Result;

/// Result of one delivery attempt for one recipient.
struct Attempt {
    address: String,
    status: DeliveryStatus,
    detail: Option<String>,
}

impl Attempt {
    fn delivered(address: &str, detail: Option<String>) -> Self {
        Self {
            address: address.to_string(),
            status: DeliveryStatus::Delivered,
            detail,
        }
    }

    fn deferred(address: &str, detail: String) -> Self {
        Self {
            address: address.to_string(),
            status: DeliveryStatus::Deferred,
            detail: Some(detail),
        }
    }

    fn bounced(address: &str, detail: String) -> Self {
        Self {
            address: address.to_string(),
            status: DeliveryStatus::Bounced,
            detail: Some(detail),
        }
    }
}

/// Handler of the `email-send` topic.
pub struct SendWorker {
    mail: MailRepository,
    users: UserRepository,
    analytics: AnalyticsRepository,
    broker: Broker,
    notifier: Notifier,
    transport: Arc<dyn MailTransport>,
    local: LocalDomains,
    max_attempts: u32,
}

impl std::fmt::Debug for SendWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendWorker")
            .field("local", &self.local)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl SendWorker {
    /// Creates the worker. `max_attempts` must match the retry policy the
    /// worker runs under: on the last attempt, recipients still deferred
    /// are bounced and the email is finalized.
    #[must_use]
    pub fn new(
        db: &Database,
        broker: Broker,
        notifier: Notifier,
        transport: Arc<dyn MailTransport>,
        local: LocalDomains,
        max_attempts: u32,
    ) -> Self {
        Self {
            mail: MailRepository::new(db),
            users: UserRepository::new(db),
            analytics: AnalyticsRepository::new(db),
            broker,
            notifier,
            transport,
            local,
            max_attempts,
        }
    }

    async fn process(&self, job: SendJob, attempt: u32) -> Result<HandlerOutcome> {
        let id = job.email_id;
        let Some(email) = self.mail.get(id).await? else {
            warn!(email_id = %id, "email vanished before delivery");
            return Ok(HandlerOutcome::Done);
        };
        match email.status {
            EmailStatus::Queued => {
                if self
                    .mail
                    .transition(id, EmailStatus::Queued, EmailStatus::Sending)
                    .await?
                {
                    self.notifier
                        .publish(MailEvent::status(email.user_id, id, EmailStatus::Sending));
                }
            }
            EmailStatus::Sending => {}
            status => {
                info!(email_id = %id, %status, "nothing to deliver");
                return Ok(HandlerOutcome::Done);
            }
        }

        let attachments = self.mail.attachments(id).await?;
        let message = match build_message(&email, attachments) {
            Ok(message) => message,
            Err(e) => {
                let reason = format!("message could not be built: {e}");
                for r in email.recipients.iter().filter(|r| r.delivery_status.is_open()) {
                    self.settle(&email, &Attempt::bounced(&r.address, reason.clone()))
                        .await?;
                }
                self.finalize(&email, 0).await?;
                return Ok(HandlerOutcome::Reject(reason));
            }
        };

        let open: Vec<&str> = email
            .recipients
            .iter()
            .filter(|r| r.delivery_status.is_open())
            .map(|r| r.address.as_str())
            .collect();
        let (local, remote): (Vec<&str>, Vec<&str>) =
            open.into_iter().partition(|a| self.local.contains(a));

        let mut attempts = Vec::new();
        for address in local {
            attempts.push(self.deliver_local(&email, address, &message.bytes).await?);
        }
        if !remote.is_empty() {
            attempts.extend(self.deliver_remote(&email, &remote, &message.bytes).await);
        }
        for outcome in &attempts {
            self.settle(&email, outcome).await?;
        }

        let deferred: Vec<String> = self
            .mail
            .recipients(id)
            .await?
            .into_iter()
            .filter(|r| r.delivery_status == DeliveryStatus::Deferred)
            .map(|r| r.address)
            .collect();
        if !deferred.is_empty() {
            if attempt < self.max_attempts {
                return Ok(HandlerOutcome::Retry(format!(
                    "{} recipient(s) deferred",
                    deferred.len()
                )));
            }
            let reason = format!("still deferred after {attempt} attempts");
            for address in &deferred {
                self.mail
                    .update_recipient(id, address, DeliveryStatus::Bounced, Some(&reason))
                    .await?;
                self.analytics
                    .record(
                        email.user_id,
                        Some(id),
                        AnalyticsEvent::Bounced,
                        Some(address),
                        Some(&reason),
                    )
                    .await?;
            }
            self.finalize(&email, message.bytes.len()).await?;
            return Ok(HandlerOutcome::Reject(format!(
                "{} recipient(s) {reason}",
                deferred.len()
            )));
        }

        self.finalize(&email, message.bytes.len()).await?;
        Ok(HandlerOutcome::Done)
    }

    /// Hands the message to a mailbox in this store.
    async fn deliver_local(&self, email: &Email, address: &str, bytes: &[u8]) -> Result<Attempt> {
        if self.users.find_by_email(address).await?.is_none() {
            return Ok(Attempt::bounced(address, "550 no such user here".into()));
        }
        let rcpt = address.to_ascii_lowercase();
        let record = ProducerRecord::new(RECEIVE_TOPIC, bytes.to_vec())
            .with_key(rcpt.clone())
            .with_header(MAIL_FROM_HEADER, email.from_address.clone())
            .with_header(RCPT_TO_HEADER, rcpt.clone())
            .with_idempotency_key(format!("local:{}:{rcpt}", email.message_id));
        let meta = self.broker.produce(record).await?;
        Ok(Attempt::delivered(
            address,
            Some(format!("local delivery {}/{}", meta.partition, meta.offset)),
        ))
    }

    /// Delivers through the relay. Never fails as a whole: session errors
    /// are reported against every recipient.
    async fn deliver_remote(&self, email: &Email, remote: &[&str], bytes: &[u8]) -> Vec<Attempt> {
        let from = match Address::new(email.from_address.clone()) {
            Ok(from) => from,
            Err(e) => {
                return remote
                    .iter()
                    .map(|a| Attempt::bounced(a, format!("bad sender: {e}")))
                    .collect();
            }
        };

        let mut attempts = Vec::new();
        let mut envelope_rcpts = Vec::new();
        for address in remote {
            match Address::new(*address) {
                Ok(rcpt) => envelope_rcpts.push(rcpt),
                Err(e) => attempts.push(Attempt::bounced(address, e.to_string())),
            }
        }
        if envelope_rcpts.is_empty() {
            return attempts;
        }

        let envelope = Envelope::new(from, envelope_rcpts);
        match self.transport.deliver(&envelope, bytes).await {
            Ok(report) => {
                for (rcpt, outcome) in report.recipients {
                    attempts.push(match outcome {
                        RecipientOutcome::Accepted => {
                            Attempt::delivered(rcpt.as_str(), report.queue_reply.clone())
                        }
                        RecipientOutcome::Rejected { code, message } if code < 500 => {
                            Attempt::deferred(rcpt.as_str(), format!("{code} {message}"))
                        }
                        RecipientOutcome::Rejected { code, message } => {
                            Attempt::bounced(rcpt.as_str(), format!("{code} {message}"))
                        }
                    });
                }
            }
            Err(e) => {
                let transient = e.is_transient();
                warn!(email_id = %email.id, error = %e, transient, "relay session failed");
                for rcpt in &envelope.recipients {
                    attempts.push(if transient {
                        Attempt::deferred(rcpt.as_str(), e.to_string())
                    } else {
                        Attempt::bounced(rcpt.as_str(), e.to_string())
                    });
                }
            }
        }
        attempts
    }

    async fn settle(&self, email: &Email, attempt: &Attempt) -> Result<()> {
        self.mail
            .update_recipient(email.id, &attempt.address, attempt.status, attempt.detail.as_deref())
            .await?;
        let event = match attempt.status {
            DeliveryStatus::Delivered => AnalyticsEvent::Delivered,
            DeliveryStatus::Deferred => AnalyticsEvent::Deferred,
            DeliveryStatus::Bounced | DeliveryStatus::Pending => AnalyticsEvent::Bounced,
        };
        self.analytics
            .record(
                email.user_id,
                Some(email.id),
                event,
                Some(&attempt.address),
                attempt.detail.as_deref(),
            )
            .await
    }

    /// Sets the final status from the recipients' outcomes.
    async fn finalize(&self, email: &Email, size: usize) -> Result<()> {
        let recipients = self.mail.recipients(email.id).await?;
        let delivered = recipients
            .iter()
            .filter(|r| r.delivery_status == DeliveryStatus::Delivered)
            .count();
        let (status, folder, event) = if delivered == recipients.len() {
            (EmailStatus::Sent, Folder::Sent, AnalyticsEvent::Sent)
        } else if delivered > 0 {
            (EmailStatus::PartiallySent, Folder::Sent, AnalyticsEvent::Sent)
        } else {
            (EmailStatus::Failed, Folder::Outbox, AnalyticsEvent::Failed)
        };
        let sent_at = (delivered > 0).then(Utc::now);
        let size = i64::try_from(size).unwrap_or(i64::MAX);
        self.mail
            .finish_send(email.id, status, folder, sent_at, size)
            .await?;
        self.analytics
            .record(email.user_id, Some(email.id), event, None, None)
            .await?;
        self.notifier
            .publish(MailEvent::status(email.user_id, email.id, status));

        if status == EmailStatus::Failed {
            error!(email_id = %email.id, "no recipient accepted the email");
        } else {
            info!(email_id = %email.id, %status, delivered, total = recipients.len(), "email sent");
        }
        Ok(())
    }
}

#[async_trait]
impl RecordHandler for SendWorker {
    async fn handle(&self, record: &Record) -> HandlerOutcome {
        let job: SendJob = match record.json() {
            Ok(job) => job,
            Err(e) => return HandlerOutcome::Reject(format!("malformed send job: {e}")),
        };
        match self.process(job, record.attempt()).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(email_id = %job.email_id, error = %e, "send attempt failed");
                HandlerOutcome::Retry(e.to_string())
            }
        }
    }
}

/// Renders a stored email as an RFC 5322 message. Bcc recipients are left
/// out of the headers.
fn build_message(email: &Email, attachments: Vec<AttachmentData>) -> Result<BuiltMessage> {
    let from = Mailbox::new(email.from_name.clone(), email.from_address.clone())?;
    let mut builder = MessageBuilder::new()
        .from(from)
        .subject(email.subject.clone())
        .message_id(email.message_id.clone())
        .text_body(email.body_text.clone())
        .references(&email.references);
    if let Some(html) = &email.body_html {
        builder = builder.html_body(html.clone());
    }
    if let Some(parent) = &email.in_reply_to {
        builder = builder.in_reply_to(parent.clone());
    }
    for r in &email.recipients {
        let mailbox = Mailbox::new(r.name.clone(), r.address.clone())?;
        builder = match r.kind {
            RecipientKind::To => builder.to(mailbox),
            RecipientKind::Cc => builder.cc(mailbox),
            RecipientKind::Bcc => builder.bcc(mailbox),
        };
    }
    for a in attachments {
        let content_type =
            ContentType::parse(&a.meta.content_type).unwrap_or_else(|_| ContentType::octet_stream());
        let mut attachment = Attachment::new(a.meta.filename, content_type, a.content);
        attachment.content_id = a.meta.content_id;
        builder = builder.attach(attachment);
    }
    Ok(builder.build()?)
}
