//! Deferred sends.
//!
//! A schedule starts `pending` and moves exactly once, to `dispatched`
//! when the scheduler hands its email to the send path or to `cancelled`
//! when the user withdraws it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqliteRow};

use crate::db::{Database, begin_write, from_db_time, now, to_db_time};
use crate::ids::{EmailId, ScheduleId, UserId};
use crate::{Error, Result};

text_enum!(
    /// State of a scheduled send.
    ScheduleStatus {
        /// Waiting for its time.
        Pending => "pending",
        /// Handed to the send path.
        Dispatched => "dispatched",
        /// Withdrawn.
        Cancelled => "cancelled",
    }
);

/// A scheduled send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Schedule {
    /// Row id.
    pub id: ScheduleId,
    /// The draft to send.
    pub email_id: EmailId,
    /// Owner.
    pub user_id: UserId,
    /// When to send.
    pub send_at: DateTime<Utc>,
    /// State.
    pub status: ScheduleStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
}

const SCHEDULE_COLUMNS: &str = "id, email_id, user_id, send_at, status, created_at, updated_at";

/// Repository for scheduled sends.
#[derive(Debug, Clone)]
pub struct ScheduleRepository {
    pool: SqlitePool,
}

impl ScheduleRepository {
    /// Creates a repository over the shared store.
    #[must_use]
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Schedules an email, or moves its pending schedule to a new time.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn schedule(
        &self,
        user: UserId,
        email: EmailId,
        send_at: DateTime<Utc>,
    ) -> Result<Schedule> {
        let now = now();
        let mut tx = begin_write(&self.pool).await?;
        let moved = sqlx::query(
            r"
            UPDATE email_schedules SET send_at = ?, updated_at = ?
            WHERE email_id = ? AND status = 'pending'
            RETURNING id
            ",
        )
        .bind(to_db_time(send_at))
        .bind(&now)
        .bind(email.0)
        .fetch_optional(&mut *tx)
        .await?;

        let id = if let Some(row) = moved {
            ScheduleId(row.get("id"))
        } else {
            let result = sqlx::query(
                r"
                INSERT INTO email_schedules (email_id, user_id, send_at, status, created_at, updated_at)
                VALUES (?, ?, ?, 'pending', ?, ?)
                ",
            )
            .bind(email.0)
            .bind(user.0)
            .bind(to_db_time(send_at))
            .bind(&now)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
            ScheduleId(result.last_insert_rowid())
        };
        tx.commit().await?;

        self.get(id)
            .await?
            .ok_or_else(|| Error::not_found("schedule", id))
    }

    /// Gets a schedule.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn get(&self, id: ScheduleId) -> Result<Option<Schedule>> {
        let row = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM email_schedules WHERE id = ?"
        ))
        .bind(id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_schedule).transpose()
    }

    /// The pending schedule of an email, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn pending_for(&self, email: EmailId) -> Result<Option<Schedule>> {
        let row = sqlx::query(&format!(
            "SELECT {SCHEDULE_COLUMNS} FROM email_schedules WHERE email_id = ? AND status = 'pending'"
        ))
        .bind(email.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_schedule).transpose()
    }

    /// Pending schedules due at `now`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<Schedule>> {
        let rows = sqlx::query(&format!(
            r"
            SELECT {SCHEDULE_COLUMNS} FROM email_schedules
            WHERE status = 'pending' AND send_at <= ?
            ORDER BY send_at, id LIMIT ?
            "
        ))
        .bind(to_db_time(now))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_schedule).collect()
    }

    /// Marks a pending schedule dispatched; false if it was not pending.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn mark_dispatched(&self, id: ScheduleId) -> Result<bool> {
        self.finish(id, ScheduleStatus::Dispatched).await
    }

    /// Cancels a pending schedule; false if it was not pending.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn cancel(&self, id: ScheduleId) -> Result<bool> {
        self.finish(id, ScheduleStatus::Cancelled).await
    }

    async fn finish(&self, id: ScheduleId, status: ScheduleStatus) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE email_schedules SET status = ?, updated_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(status.as_str())
        .bind(now())
        .bind(id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

fn row_to_schedule(row: &SqliteRow) -> Result<Schedule> {
    let status: String = row.get("status");
    Ok(Schedule {
        id: ScheduleId(row.get("id")),
        email_id: EmailId(row.get("email_id")),
        user_id: UserId(row.get("user_id")),
        send_at: from_db_time(row.get("send_at")),
        status: status.parse()?,
        created_at: from_db_time(row.get("created_at")),
        updated_at: from_db_time(row.get("updated_at")),
    })
}
