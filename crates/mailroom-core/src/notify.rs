//! In-process fan-out of mailbox changes to connected clients.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::ids::{EmailId, UserId};
use crate::mail::EmailStatus;

/// Buffered events per subscriber before the slowest one starts lagging.
const CHANNEL_CAPACITY: usize = 256;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MailEventKind {
    /// A message arrived in the inbox.
    NewMail,
    /// An outgoing message changed state.
    StatusChanged,
}

/// A change in one user's mailbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MailEvent {
    /// Whose mailbox changed.
    pub user_id: UserId,
    /// What happened.
    pub kind: MailEventKind,
    /// The email concerned.
    pub email_id: EmailId,
    /// New status, for status changes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<EmailStatus>,
}

impl MailEvent {
    /// A new-mail event.
    #[must_use]
    pub const fn new_mail(user_id: UserId, email_id: EmailId) -> Self {
        Self {
            user_id,
            kind: MailEventKind::NewMail,
            email_id,
            status: None,
        }
    }

    /// A status-change event.
    #[must_use]
    pub const fn status(user_id: UserId, email_id: EmailId, status: EmailStatus) -> Self {
        Self {
            user_id,
            kind: MailEventKind::StatusChanged,
            email_id,
            status: Some(status),
        }
    }
}

/// Broadcasts [`MailEvent`]s. Cheap to clone; every clone feeds the same
/// subscribers.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<MailEvent>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    /// Creates a notifier with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publishes an event. Events with no subscriber are dropped.
    pub fn publish(&self, event: MailEvent) {
        let receivers = self.tx.send(event).unwrap_or(0);
        trace!(receivers, "mail event published");
    }

    /// Receives every event published from now on. Callers filter by user.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<MailEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_later_events() {
        let notifier = Notifier::new();
        notifier.publish(MailEvent::new_mail(UserId(1), EmailId(1)));

        let mut rx = notifier.subscribe();
        notifier
            .clone()
            .publish(MailEvent::status(UserId(2), EmailId(9), EmailStatus::Sent));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.email_id, EmailId(9));
        assert_eq!(event.kind, MailEventKind::StatusChanged);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "status_changed");
        assert_eq!(json["status"], "sent");
    }
}
