//! Records as produced and as consumed.

use crate::error::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;

/// Header carrying the delivery attempt number, starting at 1.
pub const ATTEMPT_HEADER: &str = "x-attempt";
/// Header carrying the last handler error on retried and dead-lettered records.
pub const ERROR_HEADER: &str = "x-error";
/// Header naming where a dead-lettered record came from (`topic/partition/offset`).
pub const ORIGIN_HEADER: &str = "x-origin";

/// A record to append to a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRecord {
    /// Target topic.
    pub topic: String,
    /// Partitioning key. Records with the same key keep their order.
    pub key: Option<String>,
    /// Opaque payload.
    pub payload: Vec<u8>,
    /// String headers.
    pub headers: BTreeMap<String, String>,
    /// Producing twice with the same key yields the first record's position.
    pub idempotency_key: Option<String>,
    /// The record is not handed to consumers before this instant.
    pub deliver_after: Option<DateTime<Utc>>,
}

impl ProducerRecord {
    /// Creates a keyless record.
    #[must_use]
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            payload: payload.into(),
            headers: BTreeMap::new(),
            idempotency_key: None,
            deliver_after: None,
        }
    }

    /// Creates a record with a JSON payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be serialized.
    pub fn json<T: Serialize + ?Sized>(topic: impl Into<String>, value: &T) -> Result<Self> {
        Ok(Self::new(topic, serde_json::to_vec(value)?))
    }

    /// Sets the partitioning key.
    #[must_use]
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sets the idempotency key.
    #[must_use]
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Delays delivery until `at`.
    #[must_use]
    pub fn deliver_after(mut self, at: DateTime<Utc>) -> Self {
        self.deliver_after = Some(at);
        self
    }
}

/// Where a produced record landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecordMetadata {
    /// Partition index.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
    /// True if the idempotency key matched an earlier record.
    pub duplicate: bool,
}

/// A record read from a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Topic name.
    pub topic: String,
    /// Partition index.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
    /// Partitioning key.
    pub key: Option<String>,
    /// Opaque payload.
    pub payload: Vec<u8>,
    /// String headers.
    pub headers: BTreeMap<String, String>,
    /// When the record was appended.
    pub timestamp: DateTime<Utc>,
    /// Earliest delivery time.
    pub deliver_after: DateTime<Utc>,
}

impl Record {
    /// Decodes the JSON payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not valid JSON for `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Delivery attempt number from the `x-attempt` header, 1 if absent.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.header(ATTEMPT_HEADER)
            .and_then(|v| v.parse().ok())
            .unwrap_or(1)
    }

    /// Looks up a header.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// `topic/partition/offset`, used in logs and dead-letter headers.
    #[must_use]
    pub fn position(&self) -> String {
        format!("{}/{}/{}", self.topic, self.partition, self.offset)
    }
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Job {
        email_id: i64,
    }

    fn consumed(headers: BTreeMap<String, String>, payload: Vec<u8>) -> Record {
        Record {
            topic: "t".into(),
            partition: 2,
            offset: 9,
            key: None,
            payload,
            headers,
            timestamp: from_millis(0),
            deliver_after: from_millis(0),
        }
    }

    #[test]
    fn builder_sets_fields() {
        let at = Utc::now();
        let record = ProducerRecord::new("t", b"x".to_vec())
            .with_key("k")
            .with_header("a", "b")
            .with_idempotency_key("i")
            .deliver_after(at);
        assert_eq!(record.key.as_deref(), Some("k"));
        assert_eq!(record.headers.get("a").map(String::as_str), Some("b"));
        assert_eq!(record.idempotency_key.as_deref(), Some("i"));
        assert_eq!(record.deliver_after, Some(at));
    }

    #[test]
    fn json_payload_decodes() {
        let produced = ProducerRecord::json("t", &Job { email_id: 7 }).unwrap();
        let record = consumed(BTreeMap::new(), produced.payload);
        assert_eq!(record.json::<Job>().unwrap(), Job { email_id: 7 });
        assert!(consumed(BTreeMap::new(), b"nope".to_vec()).json::<Job>().is_err());
    }

    #[test]
    fn attempt_defaults_to_one() {
        assert_eq!(consumed(BTreeMap::new(), Vec::new()).attempt(), 1);
        let headers = BTreeMap::from([(ATTEMPT_HEADER.to_string(), "3".to_string())]);
        let record = consumed(headers, Vec::new());
        assert_eq!(record.attempt(), 3);
        assert_eq!(record.position(), "t/2/9");
    }
}
