//! Outbound delivery seam.

use async_trait::async_trait;
use mailroom_smtp::{DeliveryReport, Envelope, RecipientOutcome, SmtpTransport, TransportConfig};
use tracing::debug;

/// Hands a message to the outside world.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Delivers `message` to the envelope recipients.
    ///
    /// # Errors
    ///
    /// Returns an error when the whole session failed; per-recipient
    /// refusals are reported in the [`DeliveryReport`].
    async fn deliver(
        &self,
        envelope: &Envelope,
        message: &[u8],
    ) -> mailroom_smtp::Result<DeliveryReport>;
}

/// Delivers through an SMTP relay.
#[derive(Debug, Clone)]
pub struct SmtpRelay {
    transport: SmtpTransport,
}

impl SmtpRelay {
    /// Creates a relay transport.
    #[must_use]
    pub const fn new(config: TransportConfig) -> Self {
        Self {
            transport: SmtpTransport::new(config),
        }
    }
}

#[async_trait]
impl MailTransport for SmtpRelay {
    async fn deliver(
        &self,
        envelope: &Envelope,
        message: &[u8],
    ) -> mailroom_smtp::Result<DeliveryReport> {
        self.transport.deliver(envelope, message).await
    }
}

/// Refuses every remote recipient; used when no relay is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRelay;

#[async_trait]
impl MailTransport for NoRelay {
    async fn deliver(
        &self,
        envelope: &Envelope,
        _message: &[u8],
    ) -> mailroom_smtp::Result<DeliveryReport> {
        debug!(recipients = envelope.recipients.len(), "no relay configured");
        Ok(DeliveryReport {
            recipients: envelope
                .recipients
                .iter()
                .map(|r| {
                    (
                        r.clone(),
                        RecipientOutcome::Rejected {
                            code: 550,
                            message: "relaying is not configured".into(),
                        },
                    )
                })
                .collect(),
            queue_reply: None,
        })
    }
}
