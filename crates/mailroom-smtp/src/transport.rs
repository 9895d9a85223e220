//! High-level delivery over a single SMTP session.
//!
//! [`SmtpTransport::deliver`] drives the type-state [`Client`] through a full
//! session (greeting, EHLO, optional STARTTLS and AUTH, one transaction, QUIT)
//! and reports an outcome for every envelope recipient.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::connection::{Client, Connected, MailTransaction, connect, connect_tls};
use crate::error::{Error, Result};
use crate::types::Address;

/// Connection security for the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Security {
    /// No encryption (local relays only).
    None,
    /// Implicit TLS (connect directly with TLS).
    Tls,
    /// STARTTLS upgrade after plaintext connect.
    #[default]
    StartTls,
}

impl Security {
    /// Default port for the security mode.
    #[must_use]
    pub const fn default_port(self) -> u16 {
        match self {
            Self::None => 25,
            Self::StartTls => 587,
            Self::Tls => 465,
        }
    }
}

/// Username and password for SMTP AUTH.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Login name.
    pub username: String,
    /// Password.
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Settings for [`SmtpTransport`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Relay hostname.
    pub host: String,
    /// Relay port.
    pub port: u16,
    /// Connection security.
    pub security: Security,
    /// Credentials, if the relay requires AUTH.
    pub credentials: Option<Credentials>,
    /// Name announced in EHLO.
    pub hello_name: String,
    /// Upper bound for every network step.
    pub timeout: Duration,
}

impl TransportConfig {
    /// Creates a configuration with default port, EHLO name and timeout.
    #[must_use]
    pub fn new(host: impl Into<String>, security: Security) -> Self {
        Self {
            host: host.into(),
            port: security.default_port(),
            security,
            credentials: None,
            hello_name: "localhost".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Sender and recipients of one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// `MAIL FROM` address.
    pub from: Address,
    /// `RCPT TO` addresses.
    pub recipients: Vec<Address>,
}

impl Envelope {
    /// Creates an envelope.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(from: Address, recipients: Vec<Address>) -> Self {
        Self { from, recipients }
    }
}

/// What happened to one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecipientOutcome {
    /// The server took responsibility for the message.
    Accepted,
    /// The server refused the recipient or the message.
    Rejected {
        /// Reply code.
        code: u16,
        /// Reply text.
        message: String,
    },
}

impl RecipientOutcome {
    /// Returns true if the recipient was refused with a 5xx reply.
    #[must_use]
    pub const fn is_permanent_failure(&self) -> bool {
        matches!(self, Self::Rejected { code, .. } if *code >= 500)
    }

    /// Returns true if the recipient was refused with a 4xx reply.
    #[must_use]
    pub const fn is_transient_failure(&self) -> bool {
        matches!(self, Self::Rejected { code, .. } if *code >= 400 && *code < 500)
    }
}

/// Per-recipient result of a delivery.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeliveryReport {
    /// One entry per envelope recipient, in envelope order.
    pub recipients: Vec<(Address, RecipientOutcome)>,
    /// Final reply text of the DATA phase, when it was reached.
    pub queue_reply: Option<String>,
}

impl DeliveryReport {
    /// Recipients the server accepted.
    pub fn accepted(&self) -> impl Iterator<Item = &Address> {
        self.recipients
            .iter()
            .filter(|(_, o)| matches!(o, RecipientOutcome::Accepted))
            .map(|(a, _)| a)
    }

    /// Returns true if every recipient was accepted.
    #[must_use]
    pub fn all_accepted(&self) -> bool {
        self.recipients
            .iter()
            .all(|(_, o)| matches!(o, RecipientOutcome::Accepted))
    }

    /// Outcome recorded for an address.
    #[must_use]
    pub fn outcome(&self, address: &Address) -> Option<&RecipientOutcome> {
        self.recipients
            .iter()
            .find(|(a, _)| a == address)
            .map(|(_, o)| o)
    }
}

/// Delivers messages through one relay.
#[derive(Debug, Clone)]
pub struct SmtpTransport {
    config: TransportConfig,
}

impl SmtpTransport {
    /// Creates a transport.
    #[must_use]
    pub const fn new(config: TransportConfig) -> Self {
        Self { config }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Delivers `message` to every envelope recipient over one session.
    ///
    /// Refused recipients are reported, not raised. If no recipient is
    /// accepted the transaction is reset and no data is sent. A refused DATA
    /// phase marks every accepted recipient with that reply.
    ///
    /// # Errors
    ///
    /// Returns an error when the session itself fails (connection, greeting,
    /// TLS, authentication, sender refused, timeout). Use
    /// [`Error::is_transient`] to decide whether to retry.
    pub async fn deliver(&self, envelope: &Envelope, message: &[u8]) -> Result<DeliveryReport> {
        if envelope.recipients.is_empty() {
            return Err(Error::InvalidAddress("No recipients specified".into()));
        }

        let cfg = &self.config;
        debug!(host = %cfg.host, port = cfg.port, "opening SMTP session");

        let stream = match cfg.security {
            Security::Tls => self.step(connect_tls(&cfg.host, cfg.port)).await?,
            Security::StartTls | Security::None => self.step(connect(&cfg.host, cfg.port)).await?,
        };
        let client = self.step(Client::from_stream(stream)).await?;
        let mut client = self.step(client.ehlo(&cfg.hello_name)).await?;
        if cfg.security == Security::StartTls {
            client = self
                .step(client.starttls(&cfg.host, &cfg.hello_name))
                .await?;
        }

        let size = Some(message.len());
        let from = envelope.from.clone();
        let mut tx = match &cfg.credentials {
            Some(creds) => {
                let client = self
                    .step(client.authenticate(&creds.username, &creds.password))
                    .await?;
                self.step(client.mail_from(from, size)).await?
            }
            None => self.step(client.mail_from(from, size)).await?,
        };

        let mut report = DeliveryReport::default();
        for rcpt in &envelope.recipients {
            let reply = self.step(tx.rcpt_to(rcpt)).await?;
            let outcome = if reply.is_success() {
                RecipientOutcome::Accepted
            } else {
                warn!(recipient = %rcpt, code = reply.code.as_u16(), "recipient refused");
                RecipientOutcome::Rejected {
                    code: reply.code.as_u16(),
                    message: reply.text(),
                }
            };
            report.recipients.push((rcpt.clone(), outcome));
        }

        if tx.accepted_recipients() == 0 {
            let client = self.step(tx.reset()).await?;
            self.close(client).await;
            return Ok(report);
        }

        let client = self.finish_transaction(tx, message, &mut report).await?;
        if let Some(client) = client {
            self.close(client).await;
        }

        info!(
            accepted = report.accepted().count(),
            total = report.recipients.len(),
            "SMTP delivery finished"
        );
        Ok(report)
    }

    async fn finish_transaction(
        &self,
        tx: Client<MailTransaction>,
        message: &[u8],
        report: &mut DeliveryReport,
    ) -> Result<Option<Client<Connected>>> {
        let data = self.step(tx.data()).await;
        let sent = match data {
            Ok(data) => self.step(data.send_message(message)).await,
            Err(e) => Err(e),
        };

        match sent {
            Ok((client, reply)) => {
                report.queue_reply = Some(reply.text());
                Ok(Some(client))
            }
            Err(Error::Reply { code, message }) => {
                warn!(code, "message refused during DATA");
                for (_, outcome) in &mut report.recipients {
                    if matches!(outcome, RecipientOutcome::Accepted) {
                        *outcome = RecipientOutcome::Rejected {
                            code,
                            message: message.clone(),
                        };
                    }
                }
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn close(&self, client: Client<Connected>) {
        if let Err(e) = self.step(client.quit()).await {
            debug!(error = %e, "QUIT failed after delivery");
        }
    }

    async fn step<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.config.timeout, fut)
            .await
            .map_err(|_| Error::Timeout(self.config.timeout))?
    }
}
