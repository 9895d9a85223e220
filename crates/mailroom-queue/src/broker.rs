//! Topic storage and the produce path.

use crate::error::{Error, Result};
use crate::record::{ProducerRecord, RecordMetadata, now_millis};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Row, Sqlite, Transaction};
use std::time::Duration;

/// How long a connection waits for another writer before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest partition count a topic may have.
pub const MAX_PARTITIONS: i32 = 256;

/// Name and partition count of a topic.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct TopicInfo {
    /// Topic name.
    pub name: String,
    /// Number of partitions.
    pub partitions: i32,
}

/// Handle to the topic log. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Broker {
    pool: SqlitePool,
}

impl Broker {
    /// Opens (or creates) the log in a `SQLite` file.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
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

    /// Creates a log that lives as long as the broker.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub async fn in_memory() -> Result<Self> {
        // A single connection that never recycles, otherwise the database vanishes.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    /// Uses an existing pool, creating the log tables if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the tables cannot be created.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        let broker = Self { pool };
        broker.initialize().await?;
        Ok(broker)
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Starts a transaction that takes the write lock immediately, so
    /// concurrent read-then-write transactions queue up behind each other
    /// instead of failing with `SQLITE_BUSY`.
    pub(crate) async fn begin_write(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }

    async fn initialize(&self) -> Result<()> {
        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS queue_topics (
                name TEXT PRIMARY KEY,
                partitions INTEGER NOT NULL,
                rr_cursor INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS queue_partition_heads (
                topic TEXT NOT NULL,
                partition_id INTEGER NOT NULL,
                next_offset INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (topic, partition_id)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS queue_records (
                topic TEXT NOT NULL,
                partition_id INTEGER NOT NULL,
                record_offset INTEGER NOT NULL,
                record_key TEXT,
                payload BLOB NOT NULL,
                headers TEXT NOT NULL,
                idempotency_key TEXT,
                deliver_after INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (topic, partition_id, record_offset),
                UNIQUE (topic, idempotency_key)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS queue_consumer_offsets (
                group_id TEXT NOT NULL,
                topic TEXT NOT NULL,
                partition_id INTEGER NOT NULL,
                next_offset INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (group_id, topic, partition_id)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS queue_group_members (
                group_id TEXT NOT NULL,
                member_id TEXT NOT NULL,
                last_seen INTEGER NOT NULL,
                PRIMARY KEY (group_id, member_id)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE TABLE IF NOT EXISTS queue_partition_leases (
                group_id TEXT NOT NULL,
                topic TEXT NOT NULL,
                partition_id INTEGER NOT NULL,
                owner TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                PRIMARY KEY (group_id, topic, partition_id)
            )
            ",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r"
            CREATE INDEX IF NOT EXISTS idx_queue_leases_owner
            ON queue_partition_leases(group_id, owner)
            ",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Creates a topic. Creating an existing topic with the same partition
    /// count is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the name or count is invalid, or the topic already
    /// exists with a different count.
    pub async fn create_topic(&self, name: &str, partitions: i32) -> Result<()> {
        validate_topic_name(name)?;
        if !(1..=MAX_PARTITIONS).contains(&partitions) {
            return Err(Error::InvalidTopic(format!(
                "{name}: partition count must be between 1 and {MAX_PARTITIONS}"
            )));
        }

        let mut tx = self.begin_write().await?;
        sqlx::query(
            r"
            INSERT INTO queue_topics (name, partitions, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT(name) DO NOTHING
            ",
        )
        .bind(name)
        .bind(partitions)
        .bind(now_millis())
        .execute(&mut *tx)
        .await?;

        let existing: i32 = sqlx::query("SELECT partitions FROM queue_topics WHERE name = ?")
            .bind(name)
            .fetch_one(&mut *tx)
            .await?
            .get("partitions");
        if existing != partitions {
            return Err(Error::TopicExists {
                name: name.to_string(),
                partitions: existing,
            });
        }

        for partition in 0..partitions {
            sqlx::query(
                r"
                INSERT INTO queue_partition_heads (topic, partition_id, next_offset)
                VALUES (?, ?, 0)
                ON CONFLICT(topic, partition_id) DO NOTHING
                ",
            )
            .bind(name)
            .bind(partition)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        tracing::debug!(topic = name, partitions, "topic ready");
        Ok(())
    }

    /// Lists all topics, ordered by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub async fn topics(&self) -> Result<Vec<TopicInfo>> {
        let rows = sqlx::query("SELECT name, partitions FROM queue_topics ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| TopicInfo {
                name: row.get("name"),
                partitions: row.get("partitions"),
            })
            .collect())
    }

    /// Partition count of a topic.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownTopic`] if the topic does not exist.
    pub async fn partitions(&self, topic: &str) -> Result<i32> {
        sqlx::query("SELECT partitions FROM queue_topics WHERE name = ?")
            .bind(topic)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| row.get("partitions"))
            .ok_or_else(|| Error::UnknownTopic(topic.to_string()))
    }

    /// Appends a record.
    ///
    /// Keyed records go to `fnv1a(key) % partitions`; keyless records are
    /// spread round-robin. A repeated idempotency key returns the original
    /// position with `duplicate` set and appends nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic does not exist or the write fails.
    pub async fn produce(&self, record: ProducerRecord) -> Result<RecordMetadata> {
        let mut tx = self.begin_write().await?;

        // Writing first takes the database lock for the whole transaction.
        let row = sqlx::query(
            r"
            UPDATE queue_topics SET rr_cursor = rr_cursor + 1
            WHERE name = ?
            RETURNING partitions, rr_cursor
            ",
        )
        .bind(&record.topic)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| Error::UnknownTopic(record.topic.clone()))?;
        let partitions: i32 = row.get("partitions");
        let cursor: i64 = row.get("rr_cursor");

        if let Some(existing) = find_idempotent(&mut tx, &record).await? {
            tx.commit().await?;
            tracing::debug!(
                topic = %record.topic,
                partition = existing.partition,
                offset = existing.offset,
                "duplicate record ignored"
            );
            return Ok(existing);
        }

        let partition = record.key.as_deref().map_or_else(
            || round_robin(cursor - 1, partitions),
            |key| partition_for_key(key, partitions),
        );

        let offset: i64 = sqlx::query(
            r"
            UPDATE queue_partition_heads SET next_offset = next_offset + 1
            WHERE topic = ? AND partition_id = ?
            RETURNING next_offset - 1 AS assigned
            ",
        )
        .bind(&record.topic)
        .bind(partition)
        .fetch_one(&mut *tx)
        .await?
        .get("assigned");

        let now = now_millis();
        let deliver_after = record
            .deliver_after
            .map_or(now, |at| at.timestamp_millis());
        sqlx::query(
            r"
            INSERT INTO queue_records
                (topic, partition_id, record_offset, record_key, payload, headers,
                 idempotency_key, deliver_after, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(&record.topic)
        .bind(partition)
        .bind(offset)
        .bind(&record.key)
        .bind(&record.payload)
        .bind(serde_json::to_string(&record.headers)?)
        .bind(&record.idempotency_key)
        .bind(deliver_after)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::trace!(topic = %record.topic, partition, offset, "record appended");
        Ok(RecordMetadata {
            partition,
            offset,
            duplicate: false,
        })
    }
}

async fn find_idempotent(
    tx: &mut Transaction<'_, Sqlite>,
    record: &ProducerRecord,
) -> Result<Option<RecordMetadata>> {
    let Some(key) = &record.idempotency_key else {
        return Ok(None);
    };
    let row = sqlx::query(
        r"
        SELECT partition_id, record_offset FROM queue_records
        WHERE topic = ? AND idempotency_key = ?
        ",
    )
    .bind(&record.topic)
    .bind(key)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(row.map(|row| RecordMetadata {
        partition: row.get("partition_id"),
        offset: row.get("record_offset"),
        duplicate: true,
    }))
}

fn validate_topic_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidTopic(format!("invalid topic name {name:?}")))
    }
}

/// 32-bit FNV-1a.
pub(crate) fn fnv1a(bytes: &[u8]) -> u32 {
    bytes.iter().fold(0x811c_9dc5_u32, |hash, &b| {
        (hash ^ u32::from(b)).wrapping_mul(0x0100_0193)
    })
}

fn partition_for_key(key: &str, partitions: i32) -> i32 {
    let count = u32::try_from(partitions.max(1)).unwrap_or(1);
    i32::try_from(fnv1a(key.as_bytes()) % count).unwrap_or_default()
}

fn round_robin(cursor: i64, partitions: i32) -> i32 {
    i32::try_from(cursor.rem_euclid(i64::from(partitions.max(1)))).unwrap_or_default()
}
