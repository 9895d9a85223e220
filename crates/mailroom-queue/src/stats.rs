//! End offsets and consumer lag.

use crate::broker::Broker;
use crate::error::Result;
use serde::Serialize;
use sqlx::Row;
use std::collections::BTreeMap;

/// Size and consumption state of one topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicStats {
    /// Topic name.
    pub topic: String,
    /// Per-partition end offsets.
    pub partitions: Vec<PartitionStats>,
    /// Groups that have committed or leased anything on this topic.
    pub groups: Vec<GroupLag>,
}

/// End offset of one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PartitionStats {
    /// Partition index.
    pub partition: i32,
    /// Offset the next record will get.
    pub end_offset: i64,
}

/// How far a group is behind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupLag {
    /// Group id.
    pub group: String,
    /// Sum of the per-partition lag.
    pub total_lag: i64,
    /// Committed offset and lag per partition.
    pub partitions: Vec<PartitionLag>,
}

/// A group's position in one partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PartitionLag {
    /// Partition index.
    pub partition: i32,
    /// Next offset the group will read.
    pub committed: i64,
    /// Records not yet committed.
    pub lag: i64,
}

impl Broker {
    /// End offsets and per-group lag of a topic.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic does not exist or the query fails.
    pub async fn topic_stats(&self, topic: &str) -> Result<TopicStats> {
        self.partitions(topic).await?;

        let partitions: Vec<PartitionStats> = sqlx::query(
            r"
            SELECT partition_id, next_offset FROM queue_partition_heads
            WHERE topic = ? ORDER BY partition_id
            ",
        )
        .bind(topic)
        .fetch_all(self.pool())
        .await?
        .into_iter()
        .map(|row| PartitionStats {
            partition: row.get("partition_id"),
            end_offset: row.get("next_offset"),
        })
        .collect();

        let groups: Vec<String> = sqlx::query(
            r"
            SELECT group_id FROM queue_consumer_offsets WHERE topic = ?
            UNION
            SELECT group_id FROM queue_partition_leases WHERE topic = ?
            ORDER BY group_id
            ",
        )
        .bind(topic)
        .bind(topic)
        .fetch_all(self.pool())
        .await?
        .into_iter()
        .map(|row| row.get("group_id"))
        .collect();

        let mut lags = Vec::with_capacity(groups.len());
        for group in groups {
            let committed: BTreeMap<i32, i64> = sqlx::query(
                r"
                SELECT partition_id, next_offset FROM queue_consumer_offsets
                WHERE group_id = ? AND topic = ?
                ",
            )
            .bind(&group)
            .bind(topic)
            .fetch_all(self.pool())
            .await?
            .into_iter()
            .map(|row| (row.get("partition_id"), row.get("next_offset")))
            .collect();

            let partitions: Vec<PartitionLag> = partitions
                .iter()
                .map(|p| {
                    let committed = committed.get(&p.partition).copied().unwrap_or(0);
                    PartitionLag {
                        partition: p.partition,
                        committed,
                        lag: (p.end_offset - committed).max(0),
                    }
                })
                .collect();
            lags.push(GroupLag {
                total_lag: partitions.iter().map(|p| p.lag).sum(),
                group,
                partitions,
            });
        }

        Ok(TopicStats {
            topic: topic.to_string(),
            partitions,
            groups: lags,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use crate::{Broker, Consumer, ConsumerConfig, ProducerRecord};

    #[tokio::test]
    async fn lag_follows_commits() {
        let broker = Broker::in_memory().await.unwrap();
        broker.create_topic("t", 2).await.unwrap();
        for key in ["a", "a", "a"] {
            broker
                .produce(ProducerRecord::new("t", Vec::new()).with_key(key))
                .await
                .unwrap();
        }

        let stats = broker.topic_stats("t").await.unwrap();
        assert_eq!(stats.partitions.iter().map(|p| p.end_offset).sum::<i64>(), 3);
        assert!(stats.groups.is_empty());

        let mut consumer = Consumer::subscribe(&broker, "g", "m", &["t"], ConsumerConfig::default())
            .await
            .unwrap();
        let batch = consumer.poll(10).await.unwrap();
        consumer.commit(&batch[0]).await.unwrap();

        let stats = broker.topic_stats("t").await.unwrap();
        assert_eq!(stats.groups.len(), 1);
        assert_eq!(stats.groups[0].group, "g");
        assert_eq!(stats.groups[0].total_lag, 2);

        assert!(broker.topic_stats("missing").await.is_err());
    }
}
