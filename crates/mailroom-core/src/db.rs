//! Shared connection pool and schema.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};

use crate::Result;

/// Handle to the relational store. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (or creates) the store at `database_path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn open(database_path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(database_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// Creates an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database connection fails or schema creation fails.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    /// Uses an existing pool, creating the schema if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if schema creation fails.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        let db = Self { pool };
        db.initialize().await?;
        Ok(db)
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Initialize database schema.
    async fn initialize(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

/// How long a connection waits for another writer before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Starts a transaction holding the write lock from its first statement.
///
/// Deferred transactions that read and then write cannot wait for a
/// concurrent writer; `SQLite` fails them with `SQLITE_BUSY` instead.
pub(crate) async fn begin_write(pool: &SqlitePool) -> Result<Transaction<'static, Sqlite>> {
    Ok(pool.begin_with("BEGIN IMMEDIATE").await?)
}

const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        email TEXT NOT NULL UNIQUE COLLATE NOCASE,
        display_name TEXT NOT NULL,
        password_hash TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        last_login_at TEXT
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS sessions (
        token_hash TEXT PRIMARY KEY,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        created_at TEXT NOT NULL,
        expires_at TEXT NOT NULL
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_sessions_user ON sessions(user_id)
    ",
    r"
    CREATE TABLE IF NOT EXISTS user_settings (
        user_id INTEGER PRIMARY KEY REFERENCES users(id) ON DELETE CASCADE,
        signature TEXT,
        page_size INTEGER NOT NULL DEFAULT 25,
        timezone TEXT NOT NULL DEFAULT 'UTC',
        notifications_enabled INTEGER NOT NULL DEFAULT 1,
        updated_at TEXT NOT NULL
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS email_threads (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        subject TEXT NOT NULL,
        normalized_subject TEXT NOT NULL,
        message_count INTEGER NOT NULL DEFAULT 0,
        last_message_at TEXT NOT NULL
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_threads_subject
    ON email_threads(user_id, normalized_subject, last_message_at)
    ",
    r"
    CREATE TABLE IF NOT EXISTS emails (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        thread_id INTEGER NOT NULL REFERENCES email_threads(id),
        message_id TEXT NOT NULL,
        in_reply_to TEXT,
        reference_ids TEXT NOT NULL DEFAULT '',
        from_address TEXT NOT NULL,
        from_name TEXT,
        subject TEXT NOT NULL,
        body_text TEXT NOT NULL,
        body_html TEXT,
        folder TEXT NOT NULL,
        status TEXT NOT NULL,
        is_read INTEGER NOT NULL DEFAULT 0,
        is_starred INTEGER NOT NULL DEFAULT 0,
        size_bytes INTEGER NOT NULL DEFAULT 0,
        sent_at TEXT,
        received_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (user_id, message_id)
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_emails_folder ON emails(user_id, folder, created_at)
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_emails_thread ON emails(thread_id)
    ",
    r"
    CREATE TABLE IF NOT EXISTS email_recipients (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        email_id INTEGER NOT NULL REFERENCES emails(id) ON DELETE CASCADE,
        kind TEXT NOT NULL,
        address TEXT NOT NULL,
        name TEXT,
        delivery_status TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        updated_at TEXT NOT NULL
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_recipients_email ON email_recipients(email_id)
    ",
    r"
    CREATE TABLE IF NOT EXISTS email_attachments (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        email_id INTEGER NOT NULL REFERENCES emails(id) ON DELETE CASCADE,
        filename TEXT NOT NULL,
        content_type TEXT NOT NULL,
        content_id TEXT,
        size_bytes INTEGER NOT NULL,
        content BLOB NOT NULL
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_attachments_email ON email_attachments(email_id)
    ",
    r"
    CREATE TABLE IF NOT EXISTS email_labels (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        name TEXT NOT NULL COLLATE NOCASE,
        color TEXT,
        UNIQUE (user_id, name)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS email_label_links (
        email_id INTEGER NOT NULL REFERENCES emails(id) ON DELETE CASCADE,
        label_id INTEGER NOT NULL REFERENCES email_labels(id) ON DELETE CASCADE,
        PRIMARY KEY (email_id, label_id)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS email_templates (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        name TEXT NOT NULL COLLATE NOCASE,
        subject TEXT NOT NULL,
        body_text TEXT NOT NULL,
        body_html TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE (user_id, name)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS email_schedules (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        email_id INTEGER NOT NULL REFERENCES emails(id) ON DELETE CASCADE,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        send_at TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_schedules_due ON email_schedules(status, send_at)
    ",
    r"
    CREATE TABLE IF NOT EXISTS email_analytics (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        email_id INTEGER REFERENCES emails(id) ON DELETE SET NULL,
        event TEXT NOT NULL,
        recipient TEXT,
        detail TEXT,
        occurred_at TEXT NOT NULL
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_analytics_user ON email_analytics(user_id, occurred_at)
    ",
];

/// Formats a timestamp for storage. Fixed precision keeps text order equal
/// to time order.
pub(crate) fn to_db_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current time in storage format.
pub(crate) fn now() -> String {
    to_db_time(Utc::now())
}

/// Parses a stored timestamp.
pub(crate) fn from_db_time(text: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}

/// Escapes `%`, `_` and `\` for a `LIKE ... ESCAPE '\'` pattern.
pub(crate) fn like_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
