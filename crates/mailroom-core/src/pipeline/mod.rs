//! The send/receive pipeline: topics, job payloads and the workers that
//! consume them.
//!
//! Outgoing mail flows API -> `email-send` -> send worker -> SMTP relay
//! (or `email-receive` for local recipients). Incoming mail flows SMTP
//! receiver -> `email-receive` -> receive worker -> inbox.

mod inbound;
mod receive;
mod scheduler;
mod send;
mod transport;

use mailroom_queue::Broker;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::ids::{EmailId, UserId};

pub use inbound::InboxSink;
pub use receive::{ReceiveWorker, THREAD_WINDOW_DAYS};
pub use scheduler::Scheduler;
pub use send::SendWorker;
pub use transport::{MailTransport, NoRelay, SmtpRelay};

/// Topic of outgoing emails, keyed by email id.
pub const SEND_TOPIC: &str = "email-send";
/// Topic of raw incoming messages.
pub const RECEIVE_TOPIC: &str = "email-receive";
/// Consumer group of the send worker.
pub const SEND_GROUP: &str = "email-senders";
/// Consumer group of the receive worker.
pub const RECEIVE_GROUP: &str = "email-receivers";

/// Envelope sender of an `email-receive` record.
pub const MAIL_FROM_HEADER: &str = "x-mail-from";
/// Comma-separated envelope recipients of an `email-receive` record.
pub const RCPT_TO_HEADER: &str = "x-rcpt-to";

/// Payload of an `email-send` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendJob {
    /// Email to deliver.
    pub email_id: EmailId,
    /// Its owner.
    pub user_id: UserId,
}

/// Domains whose mailboxes live in this store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalDomains(Vec<String>);

impl LocalDomains {
    /// Creates the set, ignoring case and surrounding whitespace.
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            domains
                .into_iter()
                .map(|d| d.as_ref().trim().to_ascii_lowercase())
                .filter(|d| !d.is_empty())
                .collect(),
        )
    }

    /// True if `address` is at one of the domains.
    #[must_use]
    pub fn contains(&self, address: &str) -> bool {
        address
            .rsplit_once('@')
            .is_some_and(|(_, domain)| self.0.iter().any(|d| d.eq_ignore_ascii_case(domain)))
    }

    /// The domains, lowercase.
    #[must_use]
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

/// Creates the pipeline topics and their retry and dead-letter twins if
/// missing.
///
/// # Errors
///
/// Returns an error if a topic exists with another partition count.
pub async fn create_topics(broker: &Broker, partitions: i32) -> Result<()> {
    for topic in [SEND_TOPIC, RECEIVE_TOPIC] {
        broker.create_topic(topic, partitions).await?;
        broker
            .create_topic(&mailroom_queue::retry_topic(topic), partitions)
            .await?;
        broker
            .create_topic(&mailroom_queue::dead_letter_topic(topic), 1)
            .await?;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn local_domain_match() {
        let local = LocalDomains::new([" Example.COM ", ""]);
        assert_eq!(local.as_slice(), ["example.com"]);
        assert!(local.contains("ada@example.com"));
        assert!(local.contains("ada@EXAMPLE.com"));
        assert!(!local.contains("ada@example.org"));
        assert!(!local.contains("example.com"));
    }

    #[tokio::test]
    async fn topics_are_created_once() {
        let broker = Broker::in_memory().await.unwrap();
        create_topics(&broker, 3).await.unwrap();
        create_topics(&broker, 3).await.unwrap();
        assert_eq!(broker.partitions(SEND_TOPIC).await.unwrap(), 3);
        assert_eq!(broker.partitions("email-send.retry").await.unwrap(), 3);
        assert_eq!(broker.partitions("email-receive.dlq").await.unwrap(), 1);
        assert!(create_topics(&broker, 4).await.is_err());
    }
}
