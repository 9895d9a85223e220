//! Consumer loop with retries and dead letters.

use crate::broker::Broker;
use crate::consumer::Consumer;
use crate::error::{Error, Result};
use crate::record::{ATTEMPT_HEADER, ERROR_HEADER, ORIGIN_HEADER, ProducerRecord, Record};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tracing::Instrument;

/// Suffix of the dead-letter topic paired with every consumed topic.
pub const DEAD_LETTER_SUFFIX: &str = ".dlq";

/// Suffix of the delay topic that holds retries of a consumed topic.
pub const RETRY_SUFFIX: &str = ".retry";

/// What a handler decided about a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// Done; commit.
    Done,
    /// Temporary failure; try again later.
    Retry(String),
    /// Permanent failure; move to the dead-letter topic.
    Reject(String),
}

/// Processes records for [`run_consumer`].
#[async_trait]
pub trait RecordHandler: Send + Sync {
    /// Handles one record.
    async fn handle(&self, record: &Record) -> HandlerOutcome;
}

/// Name of the dead-letter topic for `topic`.
#[must_use]
pub fn dead_letter_topic(topic: &str) -> String {
    format!("{}{DEAD_LETTER_SUFFIX}", source_topic(topic))
}

/// Name of the retry topic for `topic`.
#[must_use]
pub fn retry_topic(topic: &str) -> String {
    format!("{}{RETRY_SUFFIX}", source_topic(topic))
}

/// `topic` without a retry suffix.
fn source_topic(topic: &str) -> &str {
    topic.strip_suffix(RETRY_SUFFIX).unwrap_or(topic)
}

/// Polls until `shutdown` turns true, handing each record to `handler`.
///
/// Every record is committed after its outcome has been acted on:
/// - `Retry` appends a copy to `<topic>.retry` with `x-attempt` incremented,
///   delayed by the policy's backoff;
/// - `Reject`, or a retry beyond `max_attempts`, appends a copy to
///   `<topic>.dlq` with the reason in `x-error`.
///
/// Retry topics are read by a companion consumer in group `<group>.retry`,
/// so a delayed copy only holds up other retries, never fresh records of
/// the source partition.
///
/// Copies carry an idempotency key derived from the source position, so
/// handling a record twice after a crash does not duplicate them.
///
/// # Errors
///
/// Returns an error if the policy is invalid or the retry and dead-letter
/// topics cannot be created. Errors while polling are logged and retried.
pub async fn run_consumer<H: RecordHandler + ?Sized>(
    mut consumer: Consumer,
    handler: &H,
    policy: &RetryPolicy,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    policy.validate()?;
    let mut retry_topics = Vec::new();
    for topic in consumer.topics() {
        let partitions = consumer.broker().partitions(topic).await?;
        ensure_topic(consumer.broker(), &dead_letter_topic(topic), 1).await?;
        let retries = retry_topic(topic);
        ensure_topic(consumer.broker(), &retries, partitions).await?;
        if !consumer.topics().contains(&retries) && !retry_topics.contains(&retries) {
            retry_topics.push(retries);
        }
    }
    let mut retries = if retry_topics.is_empty() {
        None
    } else {
        let topics: Vec<&str> = retry_topics.iter().map(String::as_str).collect();
        Some(
            Consumer::subscribe(
                consumer.broker(),
                format!("{}{RETRY_SUFFIX}", consumer.group()),
                consumer.member(),
                &topics,
                consumer.config().clone(),
            )
            .await?,
        )
    };

    let max = consumer.config().max_poll_records;
    let interval = consumer.config().poll_interval;

    while !*shutdown.borrow() {
        let mut handled = drain(&mut consumer, handler, policy, max, &shutdown).await;
        if let Some(retries) = retries.as_mut() {
            if !*shutdown.borrow() {
                handled += drain(retries, handler, policy, max, &shutdown).await;
            }
        }

        if handled == 0 {
            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }

    if let Some(retries) = retries {
        retries.close().await?;
    }
    consumer.close().await
}

/// Polls `consumer` once and settles the batch; returns how many records
/// were settled.
async fn drain<H: RecordHandler + ?Sized>(
    consumer: &mut Consumer,
    handler: &H,
    policy: &RetryPolicy,
    max: usize,
    shutdown: &watch::Receiver<bool>,
) -> usize {
    let batch = match consumer.poll(max).await {
        Ok(batch) => batch,
        Err(e) => {
            tracing::warn!(group = consumer.group(), error = %e, "poll failed");
            return 0;
        }
    };

    let mut settled = 0;
    for record in batch {
        let span = tracing::info_span!(
            "pipeline.record",
            group = consumer.group(),
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            attempt = record.attempt(),
        );
        let result = process(consumer, handler, policy, &record)
            .instrument(span)
            .await;
        if let Err(e) = result {
            // The rest of the batch is redelivered from the committed offset.
            tracing::warn!(position = %record.position(), error = %e, "record not settled");
            break;
        }
        settled += 1;
        if *shutdown.borrow() {
            break;
        }
    }
    settled
}

async fn process<H: RecordHandler + ?Sized>(
    consumer: &Consumer,
    handler: &H,
    policy: &RetryPolicy,
    record: &Record,
) -> Result<()> {
    let attempt = record.attempt();
    match handler.handle(record).await {
        HandlerOutcome::Done => {
            tracing::debug!("record handled");
        }
        HandlerOutcome::Retry(reason) if !policy.exhausted(attempt) => {
            let delay = policy.backoff(attempt);
            tracing::info!(reason = %reason, delay_ms = delay.as_millis(), "scheduling retry");
            let retry = copy_of(record, &retry_topic(&record.topic), "retry", &reason)
                .with_header(ATTEMPT_HEADER, (attempt + 1).to_string())
                .deliver_after(Utc::now() + delay);
            consumer.broker().produce(retry).await?;
        }
        HandlerOutcome::Retry(reason) => {
            let reason = format!("gave up after {attempt} attempts: {reason}");
            dead_letter(consumer.broker(), record, &reason).await?;
        }
        HandlerOutcome::Reject(reason) => {
            dead_letter(consumer.broker(), record, &reason).await?;
        }
    }
    consumer.commit(record).await
}

async fn dead_letter(broker: &Broker, record: &Record, reason: &str) -> Result<()> {
    tracing::warn!(reason, "moving record to dead-letter topic");
    let topic = dead_letter_topic(&record.topic);
    let copy = copy_of(record, &topic, "dlq", reason)
        .with_header(ORIGIN_HEADER, record.position())
        .with_header(ATTEMPT_HEADER, record.attempt().to_string());
    broker.produce(copy).await?;
    Ok(())
}

fn copy_of(record: &Record, topic: &str, kind: &str, reason: &str) -> ProducerRecord {
    let mut copy = ProducerRecord::new(topic, record.payload.clone())
        .with_idempotency_key(format!("{kind}:{}", record.position()));
    copy.key.clone_from(&record.key);
    copy.headers.clone_from(&record.headers);
    copy.with_header(ERROR_HEADER, reason)
}

async fn ensure_topic(broker: &Broker, topic: &str, partitions: i32) -> Result<()> {
    match broker.partitions(topic).await {
        Ok(_) => Ok(()),
        Err(Error::UnknownTopic(_)) => broker.create_topic(topic, partitions).await,
        Err(e) => Err(e),
    }
}
