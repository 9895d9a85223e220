//! Mailbox operations for an authenticated user.

use chrono::{DateTime, Utc};
use mailroom_mime::new_message_id;
use mailroom_queue::{Broker, ProducerRecord};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

use super::compose::{
    MAX_ATTACHMENT_BYTES, forward_body, parse_recipients, quote_reply, reply_recipients,
    thread_references, with_signature,
};
use crate::analytics::{AnalyticsEvent, AnalyticsRepository};
use crate::db::Database;
use crate::ids::{AttachmentId, EmailId, LabelId, TemplateId, ThreadId, UserId};
use crate::mail::{
    AttachmentData, Compose, DraftContent, Email, EmailStatus, EmailSummary, Folder, Label,
    LabelRepository, ListQuery, MailRepository, NewAttachment, NewEmail, NewRecipient, Page,
    ThreadView, forward_subject, reply_subject,
};
use crate::notify::{MailEvent, Notifier};
use crate::pipeline::{SEND_TOPIC, SendJob};
use crate::schedule::{Schedule, ScheduleRepository};
use crate::template::{Template, TemplateInput, TemplateRepository};
use crate::user::{MAX_PAGE_SIZE, User, UserRepository};
use crate::{Error, Result};

/// Options of a reply.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ReplyRequest {
    /// New text above the quote.
    #[serde(default)]
    pub body_text: String,
    /// HTML version of the new text.
    #[serde(default)]
    pub body_html: Option<String>,
    /// Reply to every recipient, not just the author.
    #[serde(default)]
    pub all: bool,
    /// Send right away instead of keeping a draft.
    #[serde(default)]
    pub send: bool,
}

/// Options of a forward.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ForwardRequest {
    /// `To` addresses.
    #[serde(default)]
    pub to: Vec<String>,
    /// `Cc` addresses.
    #[serde(default)]
    pub cc: Vec<String>,
    /// `Bcc` addresses.
    #[serde(default)]
    pub bcc: Vec<String>,
    /// New text above the forwarded message.
    #[serde(default)]
    pub body_text: String,
    /// Send right away instead of keeping a draft.
    #[serde(default)]
    pub send: bool,
}

/// Recipients and values for composing from a template.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TemplateCompose {
    /// `To` addresses.
    #[serde(default)]
    pub to: Vec<String>,
    /// `Cc` addresses.
    #[serde(default)]
    pub cc: Vec<String>,
    /// `Bcc` addresses.
    #[serde(default)]
    pub bcc: Vec<String>,
    /// Placeholder values.
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

/// Everything a new draft row needs beyond its owner.
struct DraftParts {
    thread_id: Option<ThreadId>,
    in_reply_to: Option<String>,
    references: Vec<String>,
    recipients: Vec<NewRecipient>,
    subject: String,
    body_text: String,
    body_html: Option<String>,
    attachments: Vec<NewAttachment>,
}

/// Mailbox operations. Every method takes the acting user and refuses to
/// touch another user's mail.
#[derive(Debug, Clone)]
pub struct MailService {
    users: UserRepository,
    mail: MailRepository,
    labels: LabelRepository,
    templates: TemplateRepository,
    schedules: ScheduleRepository,
    analytics: AnalyticsRepository,
    broker: Broker,
    notifier: Notifier,
}

impl MailService {
    /// Creates the service over the shared store and topic log.
    #[must_use]
    pub fn new(db: &Database, broker: Broker, notifier: Notifier) -> Self {
        Self {
            users: UserRepository::new(db),
            mail: MailRepository::new(db),
            labels: LabelRepository::new(db),
            templates: TemplateRepository::new(db),
            schedules: ScheduleRepository::new(db),
            analytics: AnalyticsRepository::new(db),
            broker,
            notifier,
        }
    }

    // Drafts

    /// Saves a new draft. The user's signature is appended to the body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for malformed recipients or oversized
    /// attachments.
    pub async fn create_draft(&self, user: UserId, compose: &Compose) -> Result<Email> {
        let recipients = parse_recipients(&compose.to, &compose.cc, &compose.bcc)?;
        check_attachments(&compose.attachments, 0)?;
        let settings = self.users.settings(user).await?;
        let parts = DraftParts {
            thread_id: None,
            in_reply_to: None,
            references: Vec::new(),
            recipients,
            subject: compose.subject.trim().to_string(),
            body_text: with_signature(&compose.body_text, settings.signature.as_deref()),
            body_html: compose.body_html.clone(),
            attachments: compose.attachments.clone(),
        };
        self.insert_draft(user, parts).await
    }

    /// Replaces a draft's content. New attachments are added to the
    /// existing ones.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflict`] once the email has left the drafts.
    pub async fn update_draft(&self, user: UserId, id: EmailId, compose: &Compose) -> Result<Email> {
        let email = self.owned(user, id).await?;
        if email.status != EmailStatus::Draft {
            return Err(Error::Conflict(format!("email {id} is no longer a draft")));
        }
        let existing: i64 = email.attachments.iter().map(|a| a.size_bytes).sum();
        check_attachments(&compose.attachments, usize::try_from(existing).unwrap_or(0))?;

        let content = DraftContent {
            subject: compose.subject.trim().to_string(),
            body_text: compose.body_text.clone(),
            body_html: compose.body_html.clone(),
            recipients: parse_recipients(&compose.to, &compose.cc, &compose.bcc)?,
            attachments: compose.attachments.clone(),
        };
        if !self.mail.update_draft(id, &content).await? {
            return Err(Error::Conflict(format!("email {id} is no longer a draft")));
        }
        self.owned(user, id).await
    }

    /// Deletes an email: drafts and trashed mail go for good, anything else
    /// moves to the trash.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflict`] while the email is being sent.
    pub async fn delete(&self, user: UserId, id: EmailId) -> Result<Option<Email>> {
        let email = self.owned(user, id).await?;
        if email.status.is_in_flight() {
            return Err(Error::Conflict(format!("email {id} is being sent")));
        }
        if email.status == EmailStatus::Draft || email.folder == Folder::Trash {
            self.mail.delete(id).await?;
            debug!(email_id = %id, "email deleted");
            return Ok(None);
        }
        self.mail.set_folder(id, Folder::Trash).await?;
        self.owned(user, id).await.map(Some)
    }

    // Sending

    /// Composes and sends in one step.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the message has no valid recipient.
    pub async fn send_new(&self, user: UserId, compose: &Compose) -> Result<Email> {
        let recipients = parse_recipients(&compose.to, &compose.cc, &compose.bcc)?;
        if recipients.is_empty() {
            return Err(Error::Validation("at least one recipient is required".into()));
        }
        let draft = self.create_draft(user, compose).await?;
        self.send(user, draft.id).await
    }

    /// Queues a draft for delivery.
    ///
    /// Sending an email that is already queued re-announces it to the send
    /// worker, which the topic log deduplicates. Emails already being sent
    /// or finished are returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the draft has no recipient and
    /// [`Error::Conflict`] for received mail.
    pub async fn send(&self, user: UserId, id: EmailId) -> Result<Email> {
        let email = self.owned(user, id).await?;
        match email.status {
            EmailStatus::Draft => {}
            EmailStatus::Queued => {
                self.enqueue(user, id).await?;
                return Ok(email);
            }
            EmailStatus::Received => {
                return Err(Error::Conflict(format!("email {id} was received, not composed")));
            }
            EmailStatus::Sending
            | EmailStatus::Sent
            | EmailStatus::PartiallySent
            | EmailStatus::Failed => return Ok(email),
        }
        if email.recipients.is_empty() {
            return Err(Error::Validation("at least one recipient is required".into()));
        }

        let domain = email
            .from_address
            .rsplit_once('@')
            .map(|(_, d)| d.to_ascii_lowercase())
            .unwrap_or_default();
        if !self.mail.mark_queued(id, &new_message_id(&domain)).await? {
            // Lost a race with another send of the same draft.
            return self.owned(user, id).await;
        }
        if let Some(schedule) = self.schedules.pending_for(id).await? {
            self.schedules.mark_dispatched(schedule.id).await?;
        }
        self.analytics
            .record(user, Some(id), AnalyticsEvent::Queued, None, None)
            .await?;
        self.enqueue(user, id).await?;
        self.notifier
            .publish(MailEvent::status(user, id, EmailStatus::Queued));
        info!(email_id = %id, recipients = email.recipients.len(), "email queued");

        self.owned(user, id).await
    }

    async fn enqueue(&self, user: UserId, id: EmailId) -> Result<()> {
        let job = SendJob {
            email_id: id,
            user_id: user,
        };
        let record = ProducerRecord::json(SEND_TOPIC, &job)?
            .with_key(id.to_string())
            .with_idempotency_key(format!("send:{id}"));
        let meta = self.broker.produce(record).await?;
        debug!(
            email_id = %id,
            partition = meta.partition,
            offset = meta.offset,
            duplicate = meta.duplicate,
            "send job produced"
        );
        Ok(())
    }

    /// Schedules a draft to be sent at `send_at`. Scheduling again moves
    /// the time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for a time in the past or a draft
    /// without recipients, and [`Error::Conflict`] if it is not a draft.
    pub async fn schedule(&self, user: UserId, id: EmailId, send_at: DateTime<Utc>) -> Result<Schedule> {
        let email = self.owned(user, id).await?;
        if email.status != EmailStatus::Draft {
            return Err(Error::Conflict(format!("email {id} is not a draft")));
        }
        if email.recipients.is_empty() {
            return Err(Error::Validation("at least one recipient is required".into()));
        }
        if send_at <= Utc::now() {
            return Err(Error::Validation("send_at must be in the future".into()));
        }
        let schedule = self.schedules.schedule(user, id, send_at).await?;
        info!(email_id = %id, %send_at, "send scheduled");
        Ok(schedule)
    }

    /// Withdraws a pending scheduled send.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if nothing is scheduled.
    pub async fn cancel_schedule(&self, user: UserId, id: EmailId) -> Result<Schedule> {
        self.owned(user, id).await?;
        let schedule = self
            .schedules
            .pending_for(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("no pending schedule for email {id}")))?;
        self.schedules.cancel(schedule.id).await?;
        self.schedules
            .get(schedule.id)
            .await?
            .ok_or_else(|| Error::not_found("schedule", schedule.id))
    }

    /// Sends a due schedule through the normal send path.
    ///
    /// # Errors
    ///
    /// Returns the error of [`MailService::send`].
    pub async fn dispatch(&self, schedule: &Schedule) -> Result<Email> {
        let email = self.send(schedule.user_id, schedule.email_id).await?;
        self.schedules.mark_dispatched(schedule.id).await?;
        Ok(email)
    }

    /// Cancels a schedule that can never be sent.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn abandon(&self, schedule: &Schedule) -> Result<()> {
        self.schedules.cancel(schedule.id).await.map(|_| ())
    }

    /// Schedules due at `now`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn due_schedules(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Schedule>> {
        self.schedules.due(now, limit).await
    }

    // Reply and forward

    /// Drafts (or sends) a reply in the original's thread.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if nobody is left to reply to.
    pub async fn reply(&self, user: UserId, id: EmailId, request: &ReplyRequest) -> Result<Email> {
        let original = self.owned(user, id).await?;
        let me = self.me(user).await?;
        let recipients = reply_recipients(&original, &me.email, request.all);
        if recipients.is_empty() {
            return Err(Error::Validation("no one to reply to".into()));
        }

        let parts = DraftParts {
            thread_id: Some(original.thread_id),
            in_reply_to: Some(original.message_id.clone()),
            references: thread_references(&original),
            recipients,
            subject: reply_subject(&original.subject),
            body_text: quote_reply(&request.body_text, &original),
            body_html: request.body_html.clone(),
            attachments: Vec::new(),
        };
        let draft = self.insert_draft(user, parts).await?;
        if request.send {
            self.send(user, draft.id).await
        } else {
            Ok(draft)
        }
    }

    /// Drafts (or sends) a forward carrying the original's attachments.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for malformed recipients, or no
    /// recipient when sending.
    pub async fn forward(&self, user: UserId, id: EmailId, request: &ForwardRequest) -> Result<Email> {
        let original = self.owned(user, id).await?;
        let recipients = parse_recipients(&request.to, &request.cc, &request.bcc)?;
        if request.send && recipients.is_empty() {
            return Err(Error::Validation("at least one recipient is required".into()));
        }
        let attachments = self
            .mail
            .attachments(id)
            .await?
            .into_iter()
            .map(|a| NewAttachment {
                filename: a.meta.filename,
                content_type: Some(a.meta.content_type),
                content_id: a.meta.content_id,
                content: a.content,
            })
            .collect();

        let parts = DraftParts {
            thread_id: Some(original.thread_id),
            in_reply_to: None,
            references: thread_references(&original),
            recipients,
            subject: forward_subject(&original.subject),
            body_text: forward_body(&request.body_text, &original),
            body_html: None,
            attachments,
        };
        let draft = self.insert_draft(user, parts).await?;
        if request.send {
            self.send(user, draft.id).await
        } else {
            Ok(draft)
        }
    }

    // Reading

    /// A page of the user's mail. A zero page size means the user's setting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Forbidden`] for another user's label.
    pub async fn list(&self, user: UserId, query: &ListQuery) -> Result<Page<EmailSummary>> {
        if let Some(label) = query.label {
            self.owned_label(user, label).await?;
        }
        let mut query = query.clone();
        query.page = query.page.max(1);
        if query.per_page == 0 {
            query.per_page = self.users.settings(user).await?.page_size;
        }
        query.per_page = query.per_page.clamp(1, MAX_PAGE_SIZE);
        self.mail.list(user, &query).await
    }

    /// Opens an email, marking it read. The first read of received mail is
    /// recorded as `opened`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] or [`Error::Forbidden`].
    pub async fn open(&self, user: UserId, id: EmailId) -> Result<Email> {
        let mut email = self.owned(user, id).await?;
        if self.mail.set_read(id, true).await? {
            email.is_read = true;
            if email.status == EmailStatus::Received {
                self.analytics
                    .record(user, Some(id), AnalyticsEvent::Opened, None, None)
                    .await?;
            }
        }
        Ok(email)
    }

    /// Sets or clears the read flag.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] or [`Error::Forbidden`].
    pub async fn set_read(&self, user: UserId, id: EmailId, read: bool) -> Result<Email> {
        self.owned(user, id).await?;
        self.mail.set_read(id, read).await?;
        self.owned(user, id).await
    }

    /// Sets or clears the star.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] or [`Error::Forbidden`].
    pub async fn set_starred(&self, user: UserId, id: EmailId, starred: bool) -> Result<Email> {
        self.owned(user, id).await?;
        self.mail.set_starred(id, starred).await?;
        self.owned(user, id).await
    }

    /// Moves an email to a folder.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for the drafts and outbox folders and
    /// [`Error::Conflict`] for drafts and mail being sent.
    pub async fn move_to(&self, user: UserId, id: EmailId, folder: Folder) -> Result<Email> {
        if !folder.is_user_selectable() {
            return Err(Error::Validation(format!("cannot move mail into {folder}")));
        }
        let email = self.owned(user, id).await?;
        if email.status == EmailStatus::Draft || email.status.is_in_flight() {
            return Err(Error::Conflict(format!(
                "email {id} is {} and cannot be moved",
                email.status
            )));
        }
        self.mail.set_folder(id, folder).await?;
        self.owned(user, id).await
    }

    /// A thread with its emails, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] or [`Error::Forbidden`].
    pub async fn thread(&self, user: UserId, id: ThreadId) -> Result<ThreadView> {
        let thread = self
            .mail
            .thread(id)
            .await?
            .ok_or_else(|| Error::not_found("thread", id))?;
        if thread.user_id != user {
            return Err(Error::Forbidden(format!("thread {id} belongs to another user")));
        }
        let emails = self.mail.thread_emails(id).await?;
        Ok(ThreadView { thread, emails })
    }

    /// One attachment with its bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] or [`Error::Forbidden`].
    pub async fn attachment(
        &self,
        user: UserId,
        id: EmailId,
        attachment: AttachmentId,
    ) -> Result<AttachmentData> {
        self.owned(user, id).await?;
        self.mail
            .attachment(id, attachment)
            .await?
            .ok_or_else(|| Error::not_found("attachment", attachment))
    }

    // Labels

    /// Creates a label.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] or [`Error::Conflict`].
    pub async fn create_label(&self, user: UserId, name: &str, color: Option<&str>) -> Result<Label> {
        self.labels.create(user, name, color).await
    }

    /// The user's labels.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn labels(&self, user: UserId) -> Result<Vec<Label>> {
        self.labels.list(user).await
    }

    /// Deletes a label.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] or [`Error::Forbidden`].
    pub async fn delete_label(&self, user: UserId, label: LabelId) -> Result<()> {
        self.owned_label(user, label).await?;
        self.labels.delete(label).await
    }

    /// Applies a label to an email.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] or [`Error::Forbidden`].
    pub async fn apply_label(&self, user: UserId, id: EmailId, label: LabelId) -> Result<Email> {
        self.owned(user, id).await?;
        self.owned_label(user, label).await?;
        self.labels.apply(id, label).await?;
        self.owned(user, id).await
    }

    /// Removes a label from an email.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] or [`Error::Forbidden`].
    pub async fn remove_label(&self, user: UserId, id: EmailId, label: LabelId) -> Result<Email> {
        self.owned(user, id).await?;
        self.owned_label(user, label).await?;
        self.labels.remove(id, label).await?;
        self.owned(user, id).await
    }

    // Templates

    /// Saves a template.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] or [`Error::Conflict`].
    pub async fn create_template(&self, user: UserId, input: &TemplateInput) -> Result<Template> {
        self.templates.create(user, input).await
    }

    /// The user's templates.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn templates(&self, user: UserId) -> Result<Vec<Template>> {
        self.templates.list(user).await
    }

    /// Replaces a template.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`], [`Error::Forbidden`],
    /// [`Error::Validation`] or [`Error::Conflict`].
    pub async fn update_template(
        &self,
        user: UserId,
        id: TemplateId,
        input: &TemplateInput,
    ) -> Result<Template> {
        self.owned_template(user, id).await?;
        self.templates.update(id, input).await
    }

    /// Deletes a template.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] or [`Error::Forbidden`].
    pub async fn delete_template(&self, user: UserId, id: TemplateId) -> Result<()> {
        self.owned_template(user, id).await?;
        self.templates.delete(id).await
    }

    /// Renders a template into a new draft.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for a missing placeholder value or a
    /// malformed recipient.
    pub async fn compose_from_template(
        &self,
        user: UserId,
        id: TemplateId,
        request: &TemplateCompose,
    ) -> Result<Email> {
        let template = self.owned_template(user, id).await?;
        let rendered = template.render(&request.vars)?;
        let compose = Compose {
            to: request.to.clone(),
            cc: request.cc.clone(),
            bcc: request.bcc.clone(),
            subject: rendered.subject,
            body_text: rendered.body_text,
            body_html: rendered.body_html,
            attachments: Vec::new(),
        };
        self.create_draft(user, &compose).await
    }

    // Helpers

    /// Loads an email owned by `user`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] or [`Error::Forbidden`].
    pub async fn owned(&self, user: UserId, id: EmailId) -> Result<Email> {
        let email = self
            .mail
            .get(id)
            .await?
            .ok_or_else(|| Error::not_found("email", id))?;
        if email.user_id != user {
            return Err(Error::Forbidden(format!("email {id} belongs to another user")));
        }
        Ok(email)
    }

    async fn owned_label(&self, user: UserId, id: LabelId) -> Result<Label> {
        let (owner, label) = self
            .labels
            .get(id)
            .await?
            .ok_or_else(|| Error::not_found("label", id))?;
        if owner != user {
            return Err(Error::Forbidden(format!("label {id} belongs to another user")));
        }
        Ok(label)
    }

    async fn owned_template(&self, user: UserId, id: TemplateId) -> Result<Template> {
        let template = self
            .templates
            .get(id)
            .await?
            .ok_or_else(|| Error::not_found("template", id))?;
        if template.user_id != user {
            return Err(Error::Forbidden(format!("template {id} belongs to another user")));
        }
        Ok(template)
    }

    async fn me(&self, user: UserId) -> Result<User> {
        self.users
            .get(user)
            .await?
            .ok_or_else(|| Error::not_found("user", user))
    }

    async fn insert_draft(&self, user: UserId, parts: DraftParts) -> Result<Email> {
        let me = self.me(user).await?;
        let domain = me
            .email
            .rsplit_once('@')
            .map(|(_, d)| d.to_ascii_lowercase())
            .unwrap_or_default();
        let draft = NewEmail {
            user_id: user,
            thread_id: parts.thread_id,
            message_id: new_message_id(&domain),
            in_reply_to: parts.in_reply_to,
            references: parts.references,
            from_address: me.email.clone(),
            from_name: Some(me.display_name.clone()).filter(|n| !n.is_empty()),
            subject: parts.subject,
            body_text: parts.body_text,
            body_html: parts.body_html,
            folder: Folder::Drafts,
            status: EmailStatus::Draft,
            is_read: true,
            size_bytes: 0,
            sent_at: None,
            received_at: None,
            recipients: parts.recipients,
            attachments: parts.attachments,
        };
        let id = self.mail.insert(&draft).await?;
        debug!(email_id = %id, "draft saved");
        self.owned(user, id).await
    }
}

fn check_attachments(attachments: &[NewAttachment], existing: usize) -> Result<()> {
    let total = attachments
        .iter()
        .map(|a| a.content.len())
        .fold(existing, usize::saturating_add);
    if total > MAX_ATTACHMENT_BYTES {
        return Err(Error::Validation(format!(
            "attachments exceed {} MiB",
            MAX_ATTACHMENT_BYTES / (1024 * 1024)
        )));
    }
    if attachments.iter().any(|a| a.filename.trim().is_empty()) {
        return Err(Error::Validation("attachment filename is required".into()));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::mail::{DeliveryStatus, RecipientKind};
    use crate::pipeline::create_topics;
    use crate::user::SettingsUpdate;
    use mailroom_queue::{Consumer, ConsumerConfig};

    struct Fixture {
        service: MailService,
        broker: Broker,
        notifier: Notifier,
        mail: MailRepository,
        analytics: AnalyticsRepository,
        ada: UserId,
        bob: UserId,
    }

    async fn fixture() -> Fixture {
        let db = Database::in_memory().await.unwrap();
        let broker = Broker::in_memory().await.unwrap();
        create_topics(&broker, 2).await.unwrap();
        let users = UserRepository::new(&db);
        let ada = users.create("ada@example.com", "Ada", "h").await.unwrap().id;
        let bob = users.create("bob@example.com", "Bob", "h").await.unwrap().id;
        let notifier = Notifier::new();
        Fixture {
            service: MailService::new(&db, broker.clone(), notifier.clone()),
            broker,
            notifier,
            mail: MailRepository::new(&db),
            analytics: AnalyticsRepository::new(&db),
            ada,
            bob,
        }
    }

    fn compose(to: &str, subject: &str) -> Compose {
        Compose {
            to: vec![to.to_string()],
            subject: subject.into(),
            body_text: "Hello".into(),
            ..Compose::default()
        }
    }

    async fn received(f: &Fixture, user: UserId, message_id: &str) -> EmailId {
        f.mail
            .insert(&NewEmail {
                user_id: user,
                thread_id: None,
                message_id: message_id.into(),
                in_reply_to: None,
                references: Vec::new(),
                from_address: "carol@example.org".into(),
                from_name: Some("Carol".into()),
                subject: "Question".into(),
                body_text: "Are you there?".into(),
                body_html: None,
                folder: Folder::Inbox,
                status: EmailStatus::Received,
                is_read: false,
                size_bytes: 42,
                sent_at: None,
                received_at: Some(Utc::now()),
                recipients: vec![NewRecipient {
                    kind: RecipientKind::To,
                    address: "ada@example.com".into(),
                    name: None,
                    delivery_status: DeliveryStatus::Delivered,
                }],
                attachments: vec![NewAttachment {
                    filename: "q.txt".into(),
                    content_type: None,
                    content_id: None,
                    content: b"?".to_vec(),
                }],
            })
            .await
            .unwrap()
    }

    async fn send_jobs(broker: &Broker) -> Vec<SendJob> {
        let mut consumer = Consumer::subscribe(
            broker,
            "test",
            "inspector",
            &[SEND_TOPIC],
            ConsumerConfig::default(),
        )
        .await
        .unwrap();
        let records = consumer.poll(100).await.unwrap();
        records.iter().map(|r| r.json().unwrap()).collect()
    }

    #[tokio::test]
    async fn draft_lifecycle() {
        let f = fixture().await;
        f.service
            .users
            .update_settings(f.ada, &SettingsUpdate { signature: Some("Ada".into()), ..SettingsUpdate::default() })
            .await
            .unwrap();

        let draft = f.service.create_draft(f.ada, &compose("bob@example.com", "Hi")).await.unwrap();
        assert_eq!(draft.status, EmailStatus::Draft);
        assert_eq!(draft.folder, Folder::Drafts);
        assert_eq!(draft.body_text, "Hello\n\n-- \nAda");

        let mut edit = compose("Carol <carol@example.org>", "Hi again");
        edit.cc = vec!["dan@example.org".into()];
        let updated = f.service.update_draft(f.ada, draft.id, &edit).await.unwrap();
        assert_eq!(updated.subject, "Hi again");
        assert_eq!(updated.recipients.len(), 2);

        assert!(matches!(
            f.service.update_draft(f.bob, draft.id, &edit).await,
            Err(Error::Forbidden(_))
        ));
        assert!(f.service.delete(f.ada, draft.id).await.unwrap().is_none());
        assert!(matches!(
            f.service.owned(f.ada, draft.id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn send_queues_once() {
        let f = fixture().await;
        let mut events = f.notifier.subscribe();
        let draft = f.service.create_draft(f.ada, &compose("bob@example.com", "Hi")).await.unwrap();

        let queued = f.service.send(f.ada, draft.id).await.unwrap();
        assert_eq!(queued.status, EmailStatus::Queued);
        assert_eq!(queued.folder, Folder::Outbox);
        assert_ne!(queued.message_id, draft.message_id);
        assert!(queued.message_id.ends_with("@example.com"));

        // Re-sending a queued email produces nothing new.
        f.service.send(f.ada, draft.id).await.unwrap();
        let jobs = send_jobs(&f.broker).await;
        assert_eq!(jobs, vec![SendJob { email_id: draft.id, user_id: f.ada }]);

        assert!(matches!(
            f.service.update_draft(f.ada, draft.id, &compose("x@example.com", "x")).await,
            Err(Error::Conflict(_))
        ));
        assert!(matches!(
            f.service.move_to(f.ada, draft.id, Folder::Archive).await,
            Err(Error::Conflict(_))
        ));
        assert!(matches!(
            f.service.delete(f.ada, draft.id).await,
            Err(Error::Conflict(_))
        ));

        let event = events.recv().await.unwrap();
        assert_eq!(event.status, Some(EmailStatus::Queued));
        let history = f.analytics.for_email(draft.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event, AnalyticsEvent::Queued);
    }

    #[tokio::test]
    async fn send_needs_recipients() {
        let f = fixture().await;
        let empty = Compose {
            subject: "Nobody".into(),
            ..Compose::default()
        };
        assert!(matches!(
            f.service.send_new(f.ada, &empty).await,
            Err(Error::Validation(_))
        ));
        let draft = f.service.create_draft(f.ada, &empty).await.unwrap();
        assert!(matches!(
            f.service.send(f.ada, draft.id).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn open_records_first_read() {
        let f = fixture().await;
        let id = received(&f, f.ada, "q@x").await;
        assert!(f.service.open(f.ada, id).await.unwrap().is_read);
        f.service.open(f.ada, id).await.unwrap();
        let opened: Vec<_> = f
            .analytics
            .for_email(id)
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.event == AnalyticsEvent::Opened)
            .collect();
        assert_eq!(opened.len(), 1);

        assert!(matches!(f.service.open(f.bob, id).await, Err(Error::Forbidden(_))));
        assert!(!f.service.set_read(f.ada, id, false).await.unwrap().is_read);
    }

    #[tokio::test]
    async fn reply_stays_in_thread() {
        let f = fixture().await;
        let id = received(&f, f.ada, "q@x").await;
        let original = f.service.owned(f.ada, id).await.unwrap();

        let reply = f
            .service
            .reply(f.ada, id, &ReplyRequest { body_text: "Yes.".into(), ..ReplyRequest::default() })
            .await
            .unwrap();
        assert_eq!(reply.thread_id, original.thread_id);
        assert_eq!(reply.subject, "Re: Question");
        assert_eq!(reply.in_reply_to.as_deref(), Some("q@x"));
        assert_eq!(reply.references, vec!["q@x"]);
        assert_eq!(reply.recipients[0].address, "carol@example.org");
        assert!(reply.body_text.starts_with("Yes.\n\nOn "));
        assert!(reply.body_text.ends_with("> Are you there?\n"));

        let view = f.service.thread(f.ada, original.thread_id).await.unwrap();
        assert_eq!(view.thread.message_count, 2);
        assert!(matches!(
            f.service.thread(f.bob, original.thread_id).await,
            Err(Error::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn forward_copies_attachments() {
        let f = fixture().await;
        let id = received(&f, f.ada, "q@x").await;
        let request = ForwardRequest {
            to: vec!["bob@example.com".into()],
            send: true,
            ..ForwardRequest::default()
        };
        let forward = f.service.forward(f.ada, id, &request).await.unwrap();
        assert_eq!(forward.subject, "Fwd: Question");
        assert_eq!(forward.status, EmailStatus::Queued);
        assert_eq!(forward.attachments.len(), 1);
        let data = f
            .service
            .attachment(f.ada, forward.id, forward.attachments[0].id)
            .await
            .unwrap();
        assert_eq!(data.content, b"?");
    }

    #[tokio::test]
    async fn folders_trash_and_permanent_delete() {
        let f = fixture().await;
        let id = received(&f, f.ada, "q@x").await;
        assert!(matches!(
            f.service.move_to(f.ada, id, Folder::Outbox).await,
            Err(Error::Validation(_))
        ));
        assert_eq!(
            f.service.move_to(f.ada, id, Folder::Archive).await.unwrap().folder,
            Folder::Archive
        );
        assert!(f.service.set_starred(f.ada, id, true).await.unwrap().is_starred);

        let trashed = f.service.delete(f.ada, id).await.unwrap().unwrap();
        assert_eq!(trashed.folder, Folder::Trash);
        assert!(f.service.delete(f.ada, id).await.unwrap().is_none());
        assert!(matches!(f.service.owned(f.ada, id).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn labels_are_per_user() {
        let f = fixture().await;
        let id = received(&f, f.ada, "q@x").await;
        let label = f.service.create_label(f.ada, "Work", None).await.unwrap();
        let other = f.service.create_label(f.bob, "Work", None).await.unwrap();

        let email = f.service.apply_label(f.ada, id, label.id).await.unwrap();
        assert_eq!(email.labels, vec![label.clone()]);
        assert!(matches!(
            f.service.apply_label(f.ada, id, other.id).await,
            Err(Error::Forbidden(_))
        ));

        let query = ListQuery { label: Some(label.id), ..ListQuery::default() };
        assert_eq!(f.service.list(f.ada, &query).await.unwrap().total, 1);
        assert!(matches!(
            f.service.list(f.bob, &query).await,
            Err(Error::Forbidden(_))
        ));

        assert!(f.service.remove_label(f.ada, id, label.id).await.unwrap().labels.is_empty());
        f.service.delete_label(f.ada, label.id).await.unwrap();
        assert_eq!(f.service.labels(f.ada).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn list_uses_page_size_setting() {
        let f = fixture().await;
        for i in 0..3 {
            received(&f, f.ada, &format!("m{i}@x")).await;
        }
        f.service
            .users
            .update_settings(f.ada, &SettingsUpdate { page_size: Some(2), ..SettingsUpdate::default() })
            .await
            .unwrap();
        let page = f.service.list(f.ada, &ListQuery::default()).await.unwrap();
        assert_eq!(page.per_page, 2);
        assert_eq!(page.page, 1);
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.total, 3);
    }

    #[tokio::test]
    async fn scheduling() {
        let f = fixture().await;
        let draft = f.service.create_draft(f.ada, &compose("bob@example.com", "Later")).await.unwrap();
        assert!(matches!(
            f.service.schedule(f.ada, draft.id, Utc::now() - chrono::Duration::minutes(1)).await,
            Err(Error::Validation(_))
        ));
        let at = Utc::now() + chrono::Duration::hours(1);
        f.service.schedule(f.ada, draft.id, at).await.unwrap();
        let cancelled = f.service.cancel_schedule(f.ada, draft.id).await.unwrap();
        assert_eq!(cancelled.status, crate::schedule::ScheduleStatus::Cancelled);
        assert!(matches!(
            f.service.cancel_schedule(f.ada, draft.id).await,
            Err(Error::NotFound(_))
        ));

        let schedule = f.service.schedule(f.ada, draft.id, at).await.unwrap();
        let sent = f.service.dispatch(&schedule).await.unwrap();
        assert_eq!(sent.status, EmailStatus::Queued);
        assert!(f.service.due_schedules(at + chrono::Duration::minutes(1), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn templates_render_into_drafts() {
        let f = fixture().await;
        let template = f
            .service
            .create_template(
                f.ada,
                &TemplateInput {
                    name: "Invite".into(),
                    subject: "Dinner on {{ day }}".into(),
                    body_text: "Hi {{name}}, join us on {{day}}.".into(),
                    body_html: None,
                },
            )
            .await
            .unwrap();
        let mut request = TemplateCompose {
            to: vec!["bob@example.com".into()],
            ..TemplateCompose::default()
        };
        assert!(matches!(
            f.service.compose_from_template(f.ada, template.id, &request).await,
            Err(Error::Validation(_))
        ));
        request.vars.insert("day".into(), "Friday".into());
        request.vars.insert("name".into(), "Bob".into());
        let draft = f
            .service
            .compose_from_template(f.ada, template.id, &request)
            .await
            .unwrap();
        assert_eq!(draft.subject, "Dinner on Friday");
        assert_eq!(draft.body_text, "Hi Bob, join us on Friday.");
        assert!(matches!(
            f.service.delete_template(f.bob, template.id).await,
            Err(Error::Forbidden(_))
        ));
        assert_eq!(f.service.templates(f.ada).await.unwrap().len(), 1);
    }
}
