//! Per-user mail event log and summaries.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::Row;
use sqlx::sqlite::SqlitePool;
use std::collections::BTreeMap;

use crate::Result;
use crate::db::{Database, from_db_time, now, to_db_time};
use crate::ids::{EmailId, UserId};

text_enum!(
    /// Kind of recorded event.
    AnalyticsEvent {
        /// Handed to the send pipeline.
        Queued => "queued",
        /// Send finished with at least one delivery.
        Sent => "sent",
        /// One recipient accepted the message.
        Delivered => "delivered",
        /// One recipient refused it temporarily.
        Deferred => "deferred",
        /// One recipient refused it for good.
        Bounced => "bounced",
        /// Send finished with no delivery.
        Failed => "failed",
        /// A message arrived.
        Received => "received",
        /// A received message was read for the first time.
        Opened => "opened",
    }
);

/// One recorded event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnalyticsRecord {
    /// Event kind.
    pub event: AnalyticsEvent,
    /// Email concerned, if it still exists.
    pub email_id: Option<EmailId>,
    /// Recipient concerned.
    pub recipient: Option<String>,
    /// Free-form detail, such as a server reply.
    pub detail: Option<String>,
    /// When it happened.
    pub occurred_at: DateTime<Utc>,
}

/// Event counts for a user over a window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnalyticsSummary {
    /// Start of the window.
    pub since: DateTime<Utc>,
    /// Count per event name; every event kind is present.
    pub counts: BTreeMap<String, i64>,
}

impl AnalyticsSummary {
    /// Count for one event kind.
    #[must_use]
    pub fn count(&self, event: AnalyticsEvent) -> i64 {
        self.counts.get(event.as_str()).copied().unwrap_or(0)
    }
}

const ALL_EVENTS: [AnalyticsEvent; 8] = [
    AnalyticsEvent::Queued,
    AnalyticsEvent::Sent,
    AnalyticsEvent::Delivered,
    AnalyticsEvent::Deferred,
    AnalyticsEvent::Bounced,
    AnalyticsEvent::Failed,
    AnalyticsEvent::Received,
    AnalyticsEvent::Opened,
];

/// Repository for analytics events.
#[derive(Debug, Clone)]
pub struct AnalyticsRepository {
    pool: SqlitePool,
}

impl AnalyticsRepository {
    /// Creates a repository over the shared store.
    #[must_use]
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Appends an event.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn record(
        &self,
        user: UserId,
        email: Option<EmailId>,
        event: AnalyticsEvent,
        recipient: Option<&str>,
        detail: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO email_analytics (user_id, email_id, event, recipient, detail, occurred_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(user.0)
        .bind(email.map(|e| e.0))
        .bind(event.as_str())
        .bind(recipient)
        .bind(detail)
        .bind(now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Per-event counts since `since`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn summary(&self, user: UserId, since: DateTime<Utc>) -> Result<AnalyticsSummary> {
        let rows = sqlx::query(
            r"
            SELECT event, COUNT(*) AS n FROM email_analytics
            WHERE user_id = ? AND occurred_at >= ?
            GROUP BY event
            ",
        )
        .bind(user.0)
        .bind(to_db_time(since))
        .fetch_all(&self.pool)
        .await?;

        let mut counts: BTreeMap<String, i64> = ALL_EVENTS
            .iter()
            .map(|e| (e.as_str().to_string(), 0))
            .collect();
        for row in &rows {
            counts.insert(row.get("event"), row.get("n"));
        }
        Ok(AnalyticsSummary { since, counts })
    }

    /// Events of one email, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn for_email(&self, email: EmailId) -> Result<Vec<AnalyticsRecord>> {
        let rows = sqlx::query(
            r"
            SELECT event, email_id, recipient, detail, occurred_at FROM email_analytics
            WHERE email_id = ? ORDER BY id
            ",
        )
        .bind(email.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| {
                let event: String = row.get("event");
                let email_id: Option<i64> = row.get("email_id");
                Ok(AnalyticsRecord {
                    event: event.parse()?,
                    email_id: email_id.map(EmailId),
                    recipient: row.get("recipient"),
                    detail: row.get("detail"),
                    occurred_at: from_db_time(row.get("occurred_at")),
                })
            })
            .collect()
    }
}
