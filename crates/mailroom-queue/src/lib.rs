//! # mailroom-queue
//!
//! A durable, partitioned topic log stored in `SQLite`.
//!
//! Producers append records to topics. A record's key picks its partition, so
//! records sharing a key stay in order. Consumers join a group and split the
//! partitions between live members; each member commits how far it got.
//! [`run_consumer`] drives a handler over a subscription and turns temporary
//! failures into delayed retries on a `<topic>.retry` twin and permanent ones
//! into dead letters.
//!
//! ## Example
//!
//! ```ignore
//! use mailroom_queue::{Broker, Consumer, ConsumerConfig, ProducerRecord};
//!
//! let broker = Broker::open("queue.db").await?;
//! broker.create_topic("email-send", 4).await?;
//! broker
//!     .produce(ProducerRecord::new("email-send", payload).with_key("42"))
//!     .await?;
//!
//! let mut consumer =
//!     Consumer::subscribe(&broker, "senders", "worker-1", &["email-send"], ConsumerConfig::default())
//!         .await?;
//! for record in consumer.poll(10).await? {
//!     consumer.commit(&record).await?;
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod broker;
mod consumer;
mod error;
mod record;
mod retry;
mod runner;
mod stats;

pub use broker::{Broker, MAX_PARTITIONS, TopicInfo};
pub use consumer::{Consumer, ConsumerConfig};
pub use error::{Error, Result};
pub use record::{ATTEMPT_HEADER, ERROR_HEADER, ORIGIN_HEADER, ProducerRecord, Record, RecordMetadata};
pub use retry::RetryPolicy;
pub use runner::{
    DEAD_LETTER_SUFFIX, HandlerOutcome, RETRY_SUFFIX, RecordHandler, dead_letter_topic, retry_topic,
    run_consumer,
};
pub use stats::{GroupLag, PartitionLag, PartitionStats, TopicStats};
