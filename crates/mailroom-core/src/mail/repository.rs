//! Email, recipient, attachment and thread storage.

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, Transaction};
use tracing::debug;

use super::model::{
    AttachmentData, AttachmentMeta, DeliveryStatus, Email, EmailStatus, EmailSummary, Folder,
    Label, ListQuery, NewAttachment, Page, Recipient, RecipientKind, Thread, guess_content_type,
};
use super::subject::normalize_subject;
use crate::db::{Database, begin_write, from_db_time, like_escape, now, to_db_time};
use crate::error::is_unique_violation;
use crate::ids::{AttachmentId, EmailId, LabelId, ThreadId, UserId};
use crate::{Error, Result};

const EMAIL_COLUMNS: &str = r"
    id, user_id, thread_id, message_id, in_reply_to, reference_ids,
    from_address, from_name, subject, body_text, body_html, folder, status,
    is_read, is_starred, size_bytes, sent_at, received_at, created_at, updated_at
";

const SUMMARY_COLUMNS: &str = r"
    e.id, e.thread_id, e.from_address, e.from_name, e.subject,
    substr(e.body_text, 1, 160) AS snippet, e.folder, e.status, e.is_read, e.is_starred,
    EXISTS (SELECT 1 FROM email_attachments a WHERE a.email_id = e.id) AS has_attachments,
    COALESCE(e.sent_at, e.received_at, e.created_at) AS shown_at
";

/// Recipient row to insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRecipient {
    /// Header it appears in.
    pub kind: RecipientKind,
    /// Address.
    pub address: String,
    /// Display name.
    pub name: Option<String>,
    /// Initial delivery state.
    pub delivery_status: DeliveryStatus,
}

/// Email row to insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEmail {
    /// Owner.
    pub user_id: UserId,
    /// Existing thread; a new one is started when absent.
    pub thread_id: Option<ThreadId>,
    /// Message-ID without brackets.
    pub message_id: String,
    /// Parent Message-ID.
    pub in_reply_to: Option<String>,
    /// Ancestor Message-IDs.
    pub references: Vec<String>,
    /// Author address.
    pub from_address: String,
    /// Author name.
    pub from_name: Option<String>,
    /// Subject.
    pub subject: String,
    /// Plain-text body.
    pub body_text: String,
    /// HTML body.
    pub body_html: Option<String>,
    /// Folder.
    pub folder: Folder,
    /// Lifecycle state.
    pub status: EmailStatus,
    /// Read flag.
    pub is_read: bool,
    /// Transmitted size.
    pub size_bytes: i64,
    /// When it was sent.
    pub sent_at: Option<DateTime<Utc>>,
    /// When it arrived.
    pub received_at: Option<DateTime<Utc>>,
    /// Recipients.
    pub recipients: Vec<NewRecipient>,
    /// Attachments.
    pub attachments: Vec<NewAttachment>,
}

/// Editable fields of a draft.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DraftContent {
    /// Subject.
    pub subject: String,
    /// Plain-text body.
    pub body_text: String,
    /// HTML body.
    pub body_html: Option<String>,
    /// Replacement recipient list.
    pub recipients: Vec<NewRecipient>,
    /// Attachments to add.
    pub attachments: Vec<NewAttachment>,
}

/// Repository for emails and threads.
#[derive(Debug, Clone)]
pub struct MailRepository {
    pool: SqlitePool,
}

impl MailRepository {
    /// Creates a repository over the shared store.
    #[must_use]
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Inserts an email, starting a thread if needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflict`] if the owner already has this Message-ID.
    pub async fn insert(&self, email: &NewEmail) -> Result<EmailId> {
        let now = now();
        let mut tx = begin_write(&self.pool).await?;

        let thread_id = match email.thread_id {
            Some(id) => id,
            None => {
                let result = sqlx::query(
                    r"
                    INSERT INTO email_threads
                        (user_id, subject, normalized_subject, message_count, last_message_at)
                    VALUES (?, ?, ?, 0, ?)
                    ",
                )
                .bind(email.user_id.0)
                .bind(&email.subject)
                .bind(normalize_subject(&email.subject))
                .bind(&now)
                .execute(&mut *tx)
                .await?;
                ThreadId(result.last_insert_rowid())
            }
        };

        let result = sqlx::query(
            r"
            INSERT INTO emails
                (user_id, thread_id, message_id, in_reply_to, reference_ids,
                 from_address, from_name, subject, body_text, body_html, folder, status,
                 is_read, is_starred, size_bytes, sent_at, received_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?)
            ",
        )
        .bind(email.user_id.0)
        .bind(thread_id.0)
        .bind(&email.message_id)
        .bind(&email.in_reply_to)
        .bind(email.references.join(" "))
        .bind(&email.from_address)
        .bind(&email.from_name)
        .bind(&email.subject)
        .bind(&email.body_text)
        .bind(&email.body_html)
        .bind(email.folder.as_str())
        .bind(email.status.as_str())
        .bind(email.is_read)
        .bind(email.size_bytes)
        .bind(email.sent_at.map(to_db_time))
        .bind(email.received_at.map(to_db_time))
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                Error::Conflict(format!("message {} already stored", email.message_id))
            } else {
                e.into()
            }
        })?;
        let id = EmailId(result.last_insert_rowid());

        insert_recipients(&mut tx, id, &email.recipients).await?;
        insert_attachments(&mut tx, id, &email.attachments).await?;
        refresh_thread(&mut tx, thread_id).await?;
        tx.commit().await?;

        debug!(email_id = %id, thread_id = %thread_id, "email stored");
        Ok(id)
    }

    /// Gets a full email.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get(&self, id: EmailId) -> Result<Option<Email>> {
        let Some(row) = sqlx::query(&format!("SELECT {EMAIL_COLUMNS} FROM emails WHERE id = ?"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(None);
        };
        let mut email = row_to_email(&row)?;
        email.recipients = self.recipients(id).await?;
        email.attachments = self.attachment_list(id).await?;
        email.labels = self.email_labels(id).await?;
        Ok(Some(email))
    }

    /// Owner of an email.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn owner(&self, id: EmailId) -> Result<Option<UserId>> {
        let row = sqlx::query("SELECT user_id FROM emails WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| UserId(row.get("user_id"))))
    }

    /// True if the user already stores this Message-ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn has_message(&self, user: UserId, message_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM emails WHERE user_id = ? AND message_id = ?")
            .bind(user.0)
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Replaces the editable content of a draft. Has no effect unless the
    /// email is still a draft; returns whether it was changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn update_draft(&self, id: EmailId, content: &DraftContent) -> Result<bool> {
        let mut tx = begin_write(&self.pool).await?;
        let result = sqlx::query(
            r"
            UPDATE emails SET subject = ?, body_text = ?, body_html = ?, updated_at = ?
            WHERE id = ? AND status = 'draft'
            ",
        )
        .bind(&content.subject)
        .bind(&content.body_text)
        .bind(&content.body_html)
        .bind(now())
        .bind(id.0)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query("DELETE FROM email_recipients WHERE email_id = ?")
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        insert_recipients(&mut tx, id, &content.recipients).await?;
        insert_attachments(&mut tx, id, &content.attachments).await?;

        // A draft alone in its thread names the thread.
        sqlx::query(
            r"
            UPDATE email_threads SET subject = ?, normalized_subject = ?
            WHERE id = (SELECT thread_id FROM emails WHERE id = ?) AND message_count = 1
            ",
        )
        .bind(&content.subject)
        .bind(normalize_subject(&content.subject))
        .bind(id.0)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Deletes an email with its recipients, attachments and label links.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn delete(&self, id: EmailId) -> Result<()> {
        let mut tx = begin_write(&self.pool).await?;
        let thread: Option<i64> = sqlx::query("SELECT thread_id FROM emails WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&mut *tx)
            .await?
            .map(|row| row.get("thread_id"));
        sqlx::query("DELETE FROM emails WHERE id = ?")
            .bind(id.0)
            .execute(&mut *tx)
            .await?;
        if let Some(thread) = thread {
            refresh_thread(&mut tx, ThreadId(thread)).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Sets the read flag; returns true if the flag changed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn set_read(&self, id: EmailId, read: bool) -> Result<bool> {
        let result =
            sqlx::query("UPDATE emails SET is_read = ?, updated_at = ? WHERE id = ? AND is_read != ?")
                .bind(read)
                .bind(now())
                .bind(id.0)
                .bind(read)
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Sets the star flag.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn set_starred(&self, id: EmailId, starred: bool) -> Result<()> {
        sqlx::query("UPDATE emails SET is_starred = ?, updated_at = ? WHERE id = ?")
            .bind(starred)
            .bind(now())
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Moves an email.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn set_folder(&self, id: EmailId, folder: Folder) -> Result<()> {
        sqlx::query("UPDATE emails SET folder = ?, updated_at = ? WHERE id = ?")
            .bind(folder.as_str())
            .bind(now())
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Moves a draft to the outbox as `queued` with its final Message-ID.
    /// Returns false if the email was not a draft.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn mark_queued(&self, id: EmailId, message_id: &str) -> Result<bool> {
        let mut tx = begin_write(&self.pool).await?;
        let result = sqlx::query(
            r"
            UPDATE emails SET folder = 'outbox', status = 'queued', message_id = ?, updated_at = ?
            WHERE id = ? AND status = 'draft'
            ",
        )
        .bind(message_id)
        .bind(now())
        .bind(id.0)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(false);
        }
        sqlx::query(
            r"
            UPDATE email_recipients SET delivery_status = 'pending', attempts = 0,
                last_error = NULL, updated_at = ?
            WHERE email_id = ?
            ",
        )
        .bind(now())
        .bind(id.0)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Moves an email from `from` to `to`; returns false if it was not in
    /// state `from`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn transition(&self, id: EmailId, from: EmailStatus, to: EmailStatus) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE emails SET status = ?, updated_at = ? WHERE id = ? AND status = ?",
        )
        .bind(to.as_str())
        .bind(now())
        .bind(id.0)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Records the outcome of a send: final status, folder and send time.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn finish_send(
        &self,
        id: EmailId,
        status: EmailStatus,
        folder: Folder,
        sent_at: Option<DateTime<Utc>>,
        size_bytes: i64,
    ) -> Result<()> {
        let mut tx = begin_write(&self.pool).await?;
        sqlx::query(
            r"
            UPDATE emails SET status = ?, folder = ?, sent_at = COALESCE(?, sent_at),
                size_bytes = ?, updated_at = ?
            WHERE id = ?
            ",
        )
        .bind(status.as_str())
        .bind(folder.as_str())
        .bind(sent_at.map(to_db_time))
        .bind(size_bytes)
        .bind(now())
        .bind(id.0)
        .execute(&mut *tx)
        .await?;
        let thread: i64 = sqlx::query("SELECT thread_id FROM emails WHERE id = ?")
            .bind(id.0)
            .fetch_one(&mut *tx)
            .await?
            .get("thread_id");
        refresh_thread(&mut tx, ThreadId(thread)).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Updates one recipient after a delivery attempt.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn update_recipient(
        &self,
        email: EmailId,
        address: &str,
        status: DeliveryStatus,
        error: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r"
            UPDATE email_recipients SET delivery_status = ?, attempts = attempts + 1,
                last_error = ?, updated_at = ?
            WHERE email_id = ? AND address = ? COLLATE NOCASE
            ",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(now())
        .bind(email.0)
        .bind(address)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Recipients of an email, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn recipients(&self, email: EmailId) -> Result<Vec<Recipient>> {
        let rows = sqlx::query(
            r"
            SELECT kind, address, name, delivery_status, attempts, last_error
            FROM email_recipients WHERE email_id = ? ORDER BY id
            ",
        )
        .bind(email.0)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let kind: String = row.get("kind");
                let status: String = row.get("delivery_status");
                Ok(Recipient {
                    kind: kind.parse()?,
                    address: row.get("address"),
                    name: row.get("name"),
                    delivery_status: status.parse()?,
                    attempts: row.get("attempts"),
                    last_error: row.get("last_error"),
                })
            })
            .collect()
    }

    /// Attachment metadata of an email.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn attachment_list(&self, email: EmailId) -> Result<Vec<AttachmentMeta>> {
        let rows = sqlx::query(
            r"
            SELECT id, filename, content_type, content_id, size_bytes
            FROM email_attachments WHERE email_id = ? ORDER BY id
            ",
        )
        .bind(email.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_attachment_meta).collect())
    }

    /// Attachments of an email with their content.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn attachments(&self, email: EmailId) -> Result<Vec<AttachmentData>> {
        let rows = sqlx::query(
            r"
            SELECT id, filename, content_type, content_id, size_bytes, content
            FROM email_attachments WHERE email_id = ? ORDER BY id
            ",
        )
        .bind(email.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| AttachmentData {
                meta: row_to_attachment_meta(row),
                content: row.get("content"),
            })
            .collect())
    }

    /// One attachment with its content.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn attachment(
        &self,
        email: EmailId,
        attachment: AttachmentId,
    ) -> Result<Option<AttachmentData>> {
        let row = sqlx::query(
            r"
            SELECT id, filename, content_type, content_id, size_bytes, content
            FROM email_attachments WHERE email_id = ? AND id = ?
            ",
        )
        .bind(email.0)
        .bind(attachment.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| AttachmentData {
            meta: row_to_attachment_meta(&row),
            content: row.get("content"),
        }))
    }

    /// A page of a user's emails.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn list(&self, user: UserId, query: &ListQuery) -> Result<Page<EmailSummary>> {
        let page = query.page.max(1);
        let per_page = query.per_page.max(1);

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) AS total FROM emails e");
        push_filters(&mut count, user, query);
        let total: i64 = count.build().fetch_one(&self.pool).await?.get("total");

        let mut select = QueryBuilder::<Sqlite>::new(format!("SELECT {SUMMARY_COLUMNS} FROM emails e"));
        push_filters(&mut select, user, query);
        select.push(" ORDER BY shown_at DESC, e.id DESC LIMIT ");
        select.push_bind(i64::from(per_page));
        select.push(" OFFSET ");
        select.push_bind(i64::from(page - 1) * i64::from(per_page));
        let rows = select.build().fetch_all(&self.pool).await?;

        Ok(Page {
            items: rows.iter().map(row_to_summary).collect::<Result<_>>()?,
            page,
            per_page,
            total,
        })
    }

    /// Gets a thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn thread(&self, id: ThreadId) -> Result<Option<Thread>> {
        let row = sqlx::query(
            r"
            SELECT id, user_id, subject, normalized_subject, message_count, last_message_at
            FROM email_threads WHERE id = ?
            ",
        )
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| Thread {
            id: ThreadId(row.get("id")),
            user_id: UserId(row.get("user_id")),
            subject: row.get("subject"),
            normalized_subject: row.get("normalized_subject"),
            message_count: row.get("message_count"),
            last_message_at: from_db_time(row.get("last_message_at")),
        }))
    }

    /// Emails of a thread, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn thread_emails(&self, thread: ThreadId) -> Result<Vec<EmailSummary>> {
        let rows = sqlx::query(&format!(
            "SELECT {SUMMARY_COLUMNS} FROM emails e WHERE e.thread_id = ? ORDER BY shown_at, e.id"
        ))
        .bind(thread.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_summary).collect()
    }

    /// Thread of the first of the user's emails carrying one of `message_ids`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn thread_by_message_ids(
        &self,
        user: UserId,
        message_ids: &[String],
    ) -> Result<Option<ThreadId>> {
        if message_ids.is_empty() {
            return Ok(None);
        }
        let mut query = QueryBuilder::<Sqlite>::new("SELECT thread_id FROM emails WHERE user_id = ");
        query.push_bind(user.0);
        query.push(" AND message_id IN (");
        let mut ids = query.separated(", ");
        for id in message_ids {
            ids.push_bind(id.as_str());
        }
        query.push(") ORDER BY created_at DESC LIMIT 1");
        let row = query.build().fetch_optional(&self.pool).await?;
        Ok(row.map(|row| ThreadId(row.get("thread_id"))))
    }

    /// Most recent thread of the user with this normalized subject that was
    /// active at or after `since`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn thread_by_subject(
        &self,
        user: UserId,
        normalized_subject: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<ThreadId>> {
        if normalized_subject.is_empty() {
            return Ok(None);
        }
        let row = sqlx::query(
            r"
            SELECT id FROM email_threads
            WHERE user_id = ? AND normalized_subject = ? AND last_message_at >= ?
            ORDER BY last_message_at DESC LIMIT 1
            ",
        )
        .bind(user.0)
        .bind(normalized_subject)
        .bind(to_db_time(since))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| ThreadId(row.get("id"))))
    }

    async fn email_labels(&self, email: EmailId) -> Result<Vec<Label>> {
        let rows = sqlx::query(
            r"
            SELECT l.id, l.name, l.color FROM email_labels l
            JOIN email_label_links k ON k.label_id = l.id
            WHERE k.email_id = ? ORDER BY l.name
            ",
        )
        .bind(email.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|row| Label {
                id: LabelId(row.get("id")),
                name: row.get("name"),
                color: row.get("color"),
            })
            .collect())
    }
}

fn push_filters(query: &mut QueryBuilder<'_, Sqlite>, user: UserId, filter: &ListQuery) {
    query.push(" WHERE e.user_id = ");
    query.push_bind(user.0);
    match filter.folder {
        Some(folder) => {
            query.push(" AND e.folder = ");
            query.push_bind(folder.as_str());
        }
        None => {
            query.push(" AND e.folder NOT IN ('trash', 'spam')");
        }
    }
    if let Some(label) = filter.label {
        query.push(
            " AND EXISTS (SELECT 1 FROM email_label_links k WHERE k.email_id = e.id AND k.label_id = ",
        );
        query.push_bind(label.0);
        query.push(")");
    }
    if filter.unread_only {
        query.push(" AND e.is_read = 0");
    }
    if filter.starred_only {
        query.push(" AND e.is_starred = 1");
    }
    if let Some(term) = filter.search.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        let pattern = format!("%{}%", like_escape(term));
        query.push(" AND (");
        let mut any = query.separated(" OR ");
        for column in ["e.subject", "e.body_text", "e.from_address", "COALESCE(e.from_name, '')"] {
            any.push(format!("{column} LIKE "));
            any.push_bind_unseparated(pattern.clone());
            any.push_unseparated(" ESCAPE '\\'");
        }
        query.push(")");
    }
}

async fn insert_recipients(
    tx: &mut Transaction<'_, Sqlite>,
    email: EmailId,
    recipients: &[NewRecipient],
) -> Result<()> {
    let now = now();
    for recipient in recipients {
        sqlx::query(
            r"
            INSERT INTO email_recipients
                (email_id, kind, address, name, delivery_status, attempts, updated_at)
            VALUES (?, ?, ?, ?, ?, 0, ?)
            ",
        )
        .bind(email.0)
        .bind(recipient.kind.as_str())
        .bind(&recipient.address)
        .bind(&recipient.name)
        .bind(recipient.delivery_status.as_str())
        .bind(&now)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

async fn insert_attachments(
    tx: &mut Transaction<'_, Sqlite>,
    email: EmailId,
    attachments: &[NewAttachment],
) -> Result<()> {
    for attachment in attachments {
        let content_type = attachment
            .content_type
            .clone()
            .unwrap_or_else(|| guess_content_type(&attachment.filename).to_string());
        sqlx::query(
            r"
            INSERT INTO email_attachments
                (email_id, filename, content_type, content_id, size_bytes, content)
            VALUES (?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(email.0)
        .bind(&attachment.filename)
        .bind(content_type)
        .bind(&attachment.content_id)
        .bind(i64::try_from(attachment.content.len()).unwrap_or(i64::MAX))
        .bind(&attachment.content)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

/// Recomputes a thread's counters and removes it once empty.
async fn refresh_thread(tx: &mut Transaction<'_, Sqlite>, thread: ThreadId) -> Result<()> {
    sqlx::query(
        r"
        UPDATE email_threads SET
            message_count = (SELECT COUNT(*) FROM emails WHERE thread_id = ?),
            last_message_at = COALESCE(
                (SELECT MAX(COALESCE(sent_at, received_at, created_at))
                 FROM emails WHERE thread_id = ?),
                last_message_at)
        WHERE id = ?
        ",
    )
    .bind(thread.0)
    .bind(thread.0)
    .bind(thread.0)
    .execute(&mut **tx)
    .await?;
    sqlx::query("DELETE FROM email_threads WHERE id = ? AND message_count = 0")
        .bind(thread.0)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

fn row_to_email(row: &SqliteRow) -> Result<Email> {
    let folder: String = row.get("folder");
    let status: String = row.get("status");
    let references: String = row.get("reference_ids");
    let sent_at: Option<String> = row.get("sent_at");
    let received_at: Option<String> = row.get("received_at");
    Ok(Email {
        id: EmailId(row.get("id")),
        user_id: UserId(row.get("user_id")),
        thread_id: ThreadId(row.get("thread_id")),
        message_id: row.get("message_id"),
        in_reply_to: row.get("in_reply_to"),
        references: references.split_whitespace().map(String::from).collect(),
        from_address: row.get("from_address"),
        from_name: row.get("from_name"),
        subject: row.get("subject"),
        body_text: row.get("body_text"),
        body_html: row.get("body_html"),
        folder: folder.parse()?,
        status: status.parse()?,
        is_read: row.get("is_read"),
        is_starred: row.get("is_starred"),
        size_bytes: row.get("size_bytes"),
        sent_at: sent_at.as_deref().map(from_db_time),
        received_at: received_at.as_deref().map(from_db_time),
        created_at: from_db_time(row.get("created_at")),
        updated_at: from_db_time(row.get("updated_at")),
        recipients: Vec::new(),
        attachments: Vec::new(),
        labels: Vec::new(),
    })
}

fn row_to_summary(row: &SqliteRow) -> Result<EmailSummary> {
    let folder: String = row.get("folder");
    let status: String = row.get("status");
    Ok(EmailSummary {
        id: EmailId(row.get("id")),
        thread_id: ThreadId(row.get("thread_id")),
        from_address: row.get("from_address"),
        from_name: row.get("from_name"),
        subject: row.get("subject"),
        snippet: row.get("snippet"),
        folder: folder.parse()?,
        status: status.parse()?,
        is_read: row.get("is_read"),
        is_starred: row.get("is_starred"),
        has_attachments: row.get("has_attachments"),
        date: from_db_time(row.get("shown_at")),
    })
}

fn row_to_attachment_meta(row: &SqliteRow) -> AttachmentMeta {
    AttachmentMeta {
        id: AttachmentId(row.get("id")),
        filename: row.get("filename"),
        content_type: row.get("content_type"),
        content_id: row.get("content_id"),
        size_bytes: row.get("size_bytes"),
    }
}
