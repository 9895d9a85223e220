//! Consumer groups.
//!
//! Members of a group share the partitions of the topics they subscribe to.
//! Every poll is a heartbeat: the member refreshes its liveness, renews its
//! partition leases, gives up leases beyond its fair share and claims free
//! or expired ones up to that share. A partition is only read by the member
//! holding its lease, so records of one partition are handled in order by a
//! single member at a time.

use crate::broker::Broker;
use crate::error::{Error, Result};
use crate::record::{Record, from_millis, now_millis};
use sqlx::{Row, Sqlite, Transaction};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

/// Consumer settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// A member that has not polled for this long is considered gone and its
    /// leases may be taken over.
    pub session_timeout: Duration,
    /// Upper bound on records returned by one poll.
    pub max_poll_records: usize,
    /// Pause between polls that returned nothing.
    pub poll_interval: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(30),
            max_poll_records: 100,
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// A group member reading from one or more topics.
#[derive(Debug)]
pub struct Consumer {
    broker: Broker,
    group: String,
    member: String,
    topics: Vec<String>,
    config: ConsumerConfig,
    assignment: Vec<(String, i32)>,
    cursor: usize,
}

impl Consumer {
    /// Joins `group` as `member` and takes an initial share of partitions.
    ///
    /// # Errors
    ///
    /// Returns an error if a topic does not exist or the settings are invalid.
    pub async fn subscribe(
        broker: &Broker,
        group: impl Into<String>,
        member: impl Into<String>,
        topics: &[&str],
        config: ConsumerConfig,
    ) -> Result<Self> {
        let group = group.into();
        let member = member.into();
        if group.is_empty() || member.is_empty() {
            return Err(Error::InvalidConfig(
                "group and member ids must not be empty".into(),
            ));
        }
        if config.session_timeout.is_zero() || config.max_poll_records == 0 {
            return Err(Error::InvalidConfig(
                "session timeout and max poll records must be positive".into(),
            ));
        }
        if topics.is_empty() {
            return Err(Error::InvalidConfig("no topics to subscribe to".into()));
        }
        for topic in topics {
            broker.partitions(topic).await?;
        }

        let mut consumer = Self {
            broker: broker.clone(),
            group,
            member,
            topics: topics.iter().map(ToString::to_string).collect(),
            config,
            assignment: Vec::new(),
            cursor: 0,
        };
        let mut tx = consumer.broker.begin_write().await?;
        consumer.assignment = consumer.heartbeat(&mut tx).await?;
        tx.commit().await?;

        tracing::info!(
            group = %consumer.group,
            member = %consumer.member,
            topics = ?consumer.topics,
            partitions = consumer.assignment.len(),
            "joined consumer group"
        );
        Ok(consumer)
    }

    /// Group id.
    #[must_use]
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Member id.
    #[must_use]
    pub fn member(&self) -> &str {
        &self.member
    }

    /// Subscribed topics.
    #[must_use]
    pub fn topics(&self) -> &[String] {
        &self.topics
    }

    /// Settings this consumer was created with.
    #[must_use]
    pub const fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// The broker this consumer reads from.
    #[must_use]
    pub const fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Partitions held after the last poll, as `(topic, partition)`.
    #[must_use]
    pub fn assignment(&self) -> &[(String, i32)] {
        &self.assignment
    }

    /// Heartbeats, rebalances and returns up to `max` records from the
    /// committed position of each held partition.
    ///
    /// Records that are not committed are returned again by the next poll.
    /// A record whose delivery time lies in the future holds back the rest of
    /// its partition.
    ///
    /// # Errors
    ///
    /// Returns an error if the database fails.
    pub async fn poll(&mut self, max: usize) -> Result<Vec<Record>> {
        let mut tx = self.broker.begin_write().await?;
        let assignment = self.heartbeat(&mut tx).await?;
        if assignment != self.assignment {
            tracing::info!(
                group = %self.group,
                member = %self.member,
                partitions = ?assignment,
                "partition assignment changed"
            );
        }
        self.assignment = assignment;

        let now = now_millis();
        let mut records = Vec::new();
        let count = self.assignment.len();
        for i in 0..count {
            if records.len() >= max {
                break;
            }
            let (topic, partition) = &self.assignment[(self.cursor + i) % count];
            let remaining = i64::try_from(max - records.len()).unwrap_or(i64::MAX);
            fetch_partition(&mut tx, &self.group, topic, *partition, now, remaining, &mut records)
                .await?;
        }
        tx.commit().await?;

        // Start from the next partition so one busy partition cannot starve the rest.
        self.cursor = self.cursor.wrapping_add(1);
        Ok(records)
    }

    /// Marks `record` and everything before it in its partition as done.
    /// Committing an older offset than the stored one has no effect.
    ///
    /// # Errors
    ///
    /// Returns an error if the database fails.
    pub async fn commit(&self, record: &Record) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO queue_consumer_offsets
                (group_id, topic, partition_id, next_offset, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(group_id, topic, partition_id) DO UPDATE SET
                next_offset = MAX(next_offset, excluded.next_offset),
                updated_at = excluded.updated_at
            ",
        )
        .bind(&self.group)
        .bind(&record.topic)
        .bind(record.partition)
        .bind(record.offset + 1)
        .bind(now_millis())
        .execute(self.broker.pool())
        .await?;
        Ok(())
    }

    /// Next offset the group will read from a partition.
    ///
    /// # Errors
    ///
    /// Returns an error if the database fails.
    pub async fn committed(&self, topic: &str, partition: i32) -> Result<i64> {
        let row = sqlx::query(
            r"
            SELECT next_offset FROM queue_consumer_offsets
            WHERE group_id = ? AND topic = ? AND partition_id = ?
            ",
        )
        .bind(&self.group)
        .bind(topic)
        .bind(partition)
        .fetch_optional(self.broker.pool())
        .await?;
        Ok(row.map_or(0, |row| row.get("next_offset")))
    }

    /// Leaves the group, releasing all leases at once.
    ///
    /// # Errors
    ///
    /// Returns an error if the database fails.
    pub async fn close(self) -> Result<()> {
        let mut tx = self.broker.begin_write().await?;
        sqlx::query("DELETE FROM queue_group_members WHERE group_id = ? AND member_id = ?")
            .bind(&self.group)
            .bind(&self.member)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM queue_partition_leases WHERE group_id = ? AND owner = ?")
            .bind(&self.group)
            .bind(&self.member)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        tracing::info!(group = %self.group, member = %self.member, "left consumer group");
        Ok(())
    }

    /// Refreshes liveness and recomputes this member's leases.
    async fn heartbeat(&self, tx: &mut Transaction<'_, Sqlite>) -> Result<Vec<(String, i32)>> {
        let now = now_millis();
        let timeout = i64::try_from(self.config.session_timeout.as_millis()).unwrap_or(i64::MAX);
        let live_since = now.saturating_sub(timeout);
        let expires_at = now.saturating_add(timeout);

        sqlx::query(
            r"
            INSERT INTO queue_group_members (group_id, member_id, last_seen)
            VALUES (?, ?, ?)
            ON CONFLICT(group_id, member_id) DO UPDATE SET last_seen = excluded.last_seen
            ",
        )
        .bind(&self.group)
        .bind(&self.member)
        .bind(now)
        .execute(&mut **tx)
        .await?;

        sqlx::query("DELETE FROM queue_group_members WHERE group_id = ? AND last_seen < ?")
            .bind(&self.group)
            .bind(live_since)
            .execute(&mut **tx)
            .await?;

        let live: i64 = sqlx::query(
            "SELECT COUNT(*) AS live FROM queue_group_members WHERE group_id = ?",
        )
        .bind(&self.group)
        .fetch_one(&mut **tx)
        .await?
        .get("live");

        let mut assignment = Vec::new();
        for topic in &self.topics {
            let partitions = topic_partitions(tx, topic).await?;
            let fair = fair_share(partitions, live);

            sqlx::query(
                r"
                UPDATE queue_partition_leases SET expires_at = ?
                WHERE group_id = ? AND topic = ? AND owner = ?
                ",
            )
            .bind(expires_at)
            .bind(&self.group)
            .bind(topic)
            .bind(&self.member)
            .execute(&mut **tx)
            .await?;

            let held = self.leases(tx, topic, now).await?;
            let mine: Vec<i32> = held
                .iter()
                .filter(|(_, owner)| owner.as_str() == self.member)
                .map(|(p, _)| *p)
                .collect();

            let kept = if mine.len() > fair {
                for partition in &mine[fair..] {
                    sqlx::query(
                        r"
                        DELETE FROM queue_partition_leases
                        WHERE group_id = ? AND topic = ? AND partition_id = ? AND owner = ?
                        ",
                    )
                    .bind(&self.group)
                    .bind(topic)
                    .bind(partition)
                    .bind(&self.member)
                    .execute(&mut **tx)
                    .await?;
                }
                mine[..fair].to_vec()
            } else {
                let mut kept = mine;
                let taken: HashSet<i32> = held.keys().copied().collect();
                for partition in (0..partitions).filter(|p| !taken.contains(p)) {
                    if kept.len() >= fair {
                        break;
                    }
                    let claimed = sqlx::query(
                        r"
                        INSERT INTO queue_partition_leases
                            (group_id, topic, partition_id, owner, expires_at)
                        VALUES (?, ?, ?, ?, ?)
                        ON CONFLICT(group_id, topic, partition_id) DO UPDATE SET
                            owner = excluded.owner,
                            expires_at = excluded.expires_at
                        WHERE queue_partition_leases.expires_at < ?
                        ",
                    )
                    .bind(&self.group)
                    .bind(topic)
                    .bind(partition)
                    .bind(&self.member)
                    .bind(expires_at)
                    .bind(now)
                    .execute(&mut **tx)
                    .await?
                    .rows_affected()
                        > 0;
                    if claimed {
                        kept.push(partition);
                    }
                }
                kept.sort_unstable();
                kept
            };

            assignment.extend(kept.into_iter().map(|p| (topic.clone(), p)));
        }
        Ok(assignment)
    }

    /// Unexpired leases of a topic, by partition.
    async fn leases(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        topic: &str,
        now: i64,
    ) -> Result<BTreeMap<i32, String>> {
        let rows = sqlx::query(
            r"
            SELECT partition_id, owner FROM queue_partition_leases
            WHERE group_id = ? AND topic = ? AND expires_at >= ?
            ORDER BY partition_id
            ",
        )
        .bind(&self.group)
        .bind(topic)
        .bind(now)
        .fetch_all(&mut **tx)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("partition_id"), row.get("owner")))
            .collect())
    }
}

async fn topic_partitions(tx: &mut Transaction<'_, Sqlite>, topic: &str) -> Result<i32> {
    sqlx::query("SELECT partitions FROM queue_topics WHERE name = ?")
        .bind(topic)
        .fetch_optional(&mut **tx)
        .await?
        .map(|row| row.get("partitions"))
        .ok_or_else(|| Error::UnknownTopic(topic.to_string()))
}

async fn fetch_partition(
    tx: &mut Transaction<'_, Sqlite>,
    group: &str,
    topic: &str,
    partition: i32,
    now: i64,
    limit: i64,
    out: &mut Vec<Record>,
) -> Result<()> {
    let rows = sqlx::query(
        r"
        SELECT r.record_offset, r.record_key, r.payload, r.headers,
               r.deliver_after, r.created_at
        FROM queue_records r
        WHERE r.topic = ? AND r.partition_id = ?
          AND r.record_offset >= COALESCE((
              SELECT o.next_offset FROM queue_consumer_offsets o
              WHERE o.group_id = ? AND o.topic = r.topic AND o.partition_id = r.partition_id
          ), 0)
        ORDER BY r.record_offset
        LIMIT ?
        ",
    )
    .bind(topic)
    .bind(partition)
    .bind(group)
    .bind(limit)
    .fetch_all(&mut **tx)
    .await?;

    for row in rows {
        let deliver_after: i64 = row.get("deliver_after");
        if deliver_after > now {
            break;
        }
        let headers: String = row.get("headers");
        out.push(Record {
            topic: topic.to_string(),
            partition,
            offset: row.get("record_offset"),
            key: row.get("record_key"),
            payload: row.get("payload"),
            headers: serde_json::from_str(&headers)?,
            timestamp: from_millis(row.get("created_at")),
            deliver_after: from_millis(deliver_after),
        });
    }
    Ok(())
}

/// `ceil(partitions / members)`.
fn fair_share(partitions: i32, members: i64) -> usize {
    let partitions = usize::try_from(partitions).unwrap_or(0);
    let members = usize::try_from(members).unwrap_or(1).max(1);
    partitions.div_ceil(members)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::record::ProducerRecord;
    use chrono::Utc;

    fn fast() -> ConsumerConfig {
        ConsumerConfig {
            session_timeout: Duration::from_millis(200),
            ..ConsumerConfig::default()
        }
    }

    async fn broker_with(topic: &str, partitions: i32) -> Broker {
        let broker = Broker::in_memory().await.unwrap();
        broker.create_topic(topic, partitions).await.unwrap();
        broker
    }

    #[test]
    fn fair_share_rounds_up() {
        assert_eq!(fair_share(4, 1), 4);
        assert_eq!(fair_share(4, 3), 2);
        assert_eq!(fair_share(3, 5), 1);
        assert_eq!(fair_share(4, 0), 4);
    }

    #[tokio::test]
    async fn subscribe_rejects_unknown_topics_and_bad_config() {
        let broker = broker_with("t", 1).await;
        let err = Consumer::subscribe(&broker, "g", "m", &["missing"], fast()).await;
        assert!(matches!(err, Err(Error::UnknownTopic(_))));

        let zero = ConsumerConfig {
            session_timeout: Duration::ZERO,
            ..fast()
        };
        let err = Consumer::subscribe(&broker, "g", "m", &["t"], zero).await;
        assert!(matches!(err, Err(Error::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn poll_commit_advances() {
        let broker = broker_with("t", 1).await;
        for i in 0..3u8 {
            broker.produce(ProducerRecord::new("t", vec![i])).await.unwrap();
        }
        let mut consumer = Consumer::subscribe(&broker, "g", "m1", &["t"], fast())
            .await
            .unwrap();

        let batch = consumer.poll(2).await.unwrap();
        assert_eq!(batch.iter().map(|r| r.offset).collect::<Vec<_>>(), vec![0, 1]);

        // Nothing committed yet: the same records come back.
        let again = consumer.poll(2).await.unwrap();
        assert_eq!(again[0].offset, 0);

        consumer.commit(&batch[1]).await.unwrap();
        consumer.commit(&batch[0]).await.unwrap();
        assert_eq!(consumer.committed("t", 0).await.unwrap(), 2);

        let rest = consumer.poll(10).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].payload, vec![2]);
    }

    #[tokio::test]
    async fn future_record_blocks_its_partition() {
        let broker = broker_with("t", 1).await;
        let later = Utc::now() + chrono::Duration::hours(1);
        broker
            .produce(ProducerRecord::new("t", b"later".to_vec()).deliver_after(later))
            .await
            .unwrap();
        broker.produce(ProducerRecord::new("t", b"now".to_vec())).await.unwrap();

        let mut consumer = Consumer::subscribe(&broker, "g", "m", &["t"], fast())
            .await
            .unwrap();
        assert!(consumer.poll(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn groups_read_independently() {
        let broker = broker_with("t", 1).await;
        broker.produce(ProducerRecord::new("t", b"x".to_vec())).await.unwrap();

        let mut a = Consumer::subscribe(&broker, "ga", "m", &["t"], fast()).await.unwrap();
        let mut b = Consumer::subscribe(&broker, "gb", "m", &["t"], fast()).await.unwrap();
        let record = a.poll(1).await.unwrap().remove(0);
        a.commit(&record).await.unwrap();
        assert!(a.poll(1).await.unwrap().is_empty());
        assert_eq!(b.poll(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn members_split_partitions() {
        let broker = broker_with("t", 4).await;
        let config = ConsumerConfig {
            session_timeout: Duration::from_secs(30),
            ..ConsumerConfig::default()
        };
        let mut first = Consumer::subscribe(&broker, "g", "m1", &["t"], config.clone())
            .await
            .unwrap();
        assert_eq!(first.assignment().len(), 4);

        let mut second = Consumer::subscribe(&broker, "g", "m2", &["t"], config)
            .await
            .unwrap();
        assert!(second.assignment().is_empty());

        first.poll(1).await.unwrap();
        assert_eq!(first.assignment().len(), 2);
        second.poll(1).await.unwrap();
        assert_eq!(second.assignment().len(), 2);

        let mut all: Vec<i32> = first
            .assignment()
            .iter()
            .chain(second.assignment())
            .map(|(_, p)| *p)
            .collect();
        all.sort_unstable();
        assert_eq!(all, vec![0, 1, 2, 3]);

        // Leaving hands everything back.
        first.close().await.unwrap();
        second.poll(1).await.unwrap();
        assert_eq!(second.assignment().len(), 4);
    }

    #[tokio::test]
    async fn expired_leases_are_taken_over() {
        let broker = broker_with("t", 2).await;
        let first = Consumer::subscribe(&broker, "g", "m1", &["t"], fast()).await.unwrap();
        assert_eq!(first.assignment().len(), 2);

        let mut second = Consumer::subscribe(&broker, "g", "m2", &["t"], fast())
            .await
            .unwrap();
        assert!(second.assignment().is_empty());

        tokio::time::sleep(Duration::from_millis(300)).await;
        second.poll(1).await.unwrap();
        assert_eq!(second.assignment().len(), 2);
        drop(first);
    }
}
