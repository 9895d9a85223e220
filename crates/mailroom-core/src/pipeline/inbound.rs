//! Bridge from the SMTP receiver to the `email-receive` topic.

use async_trait::async_trait;
use mailroom_mime::ParsedMessage;
use mailroom_queue::{Broker, ProducerRecord};
use mailroom_smtp::{Address, DeliveryError, InboundMessage, MessageSink};
use tracing::{info, warn};

use super::{LocalDomains, MAIL_FROM_HEADER, RCPT_TO_HEADER, RECEIVE_TOPIC};
use crate::db::Database;
use crate::user::UserRepository;

/// Accepts mail for registered users at the local domains and queues it.
#[derive(Debug, Clone)]
pub struct InboxSink {
    users: UserRepository,
    broker: Broker,
    local: LocalDomains,
}

impl InboxSink {
    /// Creates the sink.
    #[must_use]
    pub fn new(db: &Database, broker: Broker, local: LocalDomains) -> Self {
        Self {
            users: UserRepository::new(db),
            broker,
            local,
        }
    }
}

#[async_trait]
impl MessageSink for InboxSink {
    async fn accepts(&self, recipient: &Address) -> bool {
        if !self.local.contains(recipient.as_str()) {
            return false;
        }
        match self.users.find_by_email(recipient.as_str()).await {
            Ok(user) => user.is_some(),
            Err(e) => {
                warn!(error = %e, "recipient lookup failed");
                false
            }
        }
    }

    async fn deliver(&self, message: InboundMessage) -> Result<(), DeliveryError> {
        // Local mailboxes are case-insensitive.
        let mut rcpts: Vec<String> = message
            .recipients
            .iter()
            .map(|r| r.as_str().to_ascii_lowercase())
            .collect();
        rcpts.sort();
        rcpts.dedup();
        let rcpt_header = rcpts.join(",");

        // Retransmissions of the same message collapse onto one record.
        let message_id = ParsedMessage::parse(&message.data)
            .ok()
            .and_then(|p| p.message_id());
        let mut record = ProducerRecord::new(RECEIVE_TOPIC, message.data)
            .with_header(MAIL_FROM_HEADER, message.mail_from.as_str())
            .with_header(RCPT_TO_HEADER, rcpt_header.clone());
        if let Some(first) = rcpts.first() {
            record = record.with_key(first.clone());
        }
        if let Some(id) = &message_id {
            record = record.with_idempotency_key(format!("inbound:{id}:{rcpt_header}"));
        }
        if let Some(helo) = &message.helo {
            record = record.with_header("x-helo", helo.clone());
        }
        if let Some(peer) = message.peer {
            record = record.with_header("x-peer", peer.to_string());
        }

        match self.broker.produce(record).await {
            Ok(meta) => {
                info!(
                    rcpts = %rcpt_header,
                    partition = meta.partition,
                    offset = meta.offset,
                    duplicate = meta.duplicate,
                    "inbound message queued"
                );
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "could not queue inbound message");
                Err(DeliveryError::Transient("queue unavailable".into()))
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::pipeline::{RECEIVE_GROUP, create_topics};
    use mailroom_queue::{Consumer, ConsumerConfig};
    use mailroom_smtp::ReversePath;

    async fn sink() -> (InboxSink, Broker) {
        let db = Database::in_memory().await.unwrap();
        let broker = Broker::in_memory().await.unwrap();
        create_topics(&broker, 2).await.unwrap();
        UserRepository::new(&db)
            .create("bob@example.com", "Bob", "h")
            .await
            .unwrap();
        let sink = InboxSink::new(&db, broker.clone(), LocalDomains::new(["example.com"]));
        (sink, broker)
    }

    fn inbound(data: &str) -> InboundMessage {
        InboundMessage {
            mail_from: ReversePath::Address(Address::new("carol@example.org").unwrap()),
            recipients: vec![Address::new("Bob@example.com").unwrap()],
            data: data.as_bytes().to_vec(),
            helo: Some("mx.example.org".into()),
            peer: None,
        }
    }

    #[tokio::test]
    async fn accepts_only_registered_local_users() {
        let (sink, _) = sink().await;
        assert!(sink.accepts(&Address::new("bob@example.com").unwrap()).await);
        assert!(sink.accepts(&Address::new("BOB@Example.com").unwrap()).await);
        assert!(!sink.accepts(&Address::new("ghost@example.com").unwrap()).await);
        assert!(!sink.accepts(&Address::new("bob@example.org").unwrap()).await);
    }

    #[tokio::test]
    async fn queues_once_per_message_id() {
        let (sink, broker) = sink().await;
        let raw = "Message-ID: <m1@example.org>\r\nSubject: hi\r\n\r\nbody\r\n";
        sink.deliver(inbound(raw)).await.unwrap();
        sink.deliver(inbound(raw)).await.unwrap();

        let mut consumer = Consumer::subscribe(
            &broker,
            RECEIVE_GROUP,
            "inspector",
            &[RECEIVE_TOPIC],
            ConsumerConfig::default(),
        )
        .await
        .unwrap();
        let records = consumer.poll(10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].header(RCPT_TO_HEADER), Some("bob@example.com"));
        assert_eq!(records[0].header(MAIL_FROM_HEADER), Some("carol@example.org"));
        assert_eq!(records[0].header("x-helo"), Some("mx.example.org"));
    }
}
