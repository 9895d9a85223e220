//! Inbound SMTP receiver.
//!
//! [`Receiver`] accepts plain TCP connections and runs one session task per
//! client. Recipients are vetted and finished messages are handed off through
//! a [`MessageSink`]; the receiver never stores mail itself.

mod session;

pub use session::run_session;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::{Semaphore, watch};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::types::{Address, ReversePath};

/// Receiver limits and identity.
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Name announced in the greeting and EHLO reply.
    pub hostname: String,
    /// Largest accepted message, in bytes after dot-unstuffing.
    pub max_message_bytes: usize,
    /// Most recipients accepted in one transaction.
    pub max_recipients: usize,
    /// Concurrent sessions; further clients wait for a free slot.
    pub max_connections: usize,
    /// Idle time allowed between commands.
    pub command_timeout: Duration,
    /// Idle time allowed between lines of message data.
    pub data_timeout: Duration,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            max_message_bytes: 10 * 1024 * 1024,
            max_recipients: 100,
            max_connections: 64,
            command_timeout: Duration::from_secs(300),
            data_timeout: Duration::from_secs(180),
        }
    }
}

/// A message accepted by the receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Envelope sender (`MAIL FROM`).
    pub mail_from: ReversePath,
    /// Accepted envelope recipients, in `RCPT TO` order.
    pub recipients: Vec<Address>,
    /// Raw RFC 5322 message with CRLF line endings.
    pub data: Vec<u8>,
    /// Name the client gave in HELO/EHLO.
    pub helo: Option<String>,
    /// Remote address, when known.
    pub peer: Option<SocketAddr>,
}

/// Why a sink refused a message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// Try again later (451).
    #[error("transient delivery failure: {0}")]
    Transient(String),
    /// Do not retry (554).
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

/// Destination for inbound mail.
#[async_trait]
pub trait MessageSink: Send + Sync + 'static {
    /// Returns true if mail for `recipient` is accepted here.
    async fn accepts(&self, recipient: &Address) -> bool;

    /// Takes ownership of a complete message.
    ///
    /// # Errors
    ///
    /// A [`DeliveryError`] is reported back to the client as 451 or 554.
    async fn deliver(&self, message: InboundMessage) -> std::result::Result<(), DeliveryError>;
}

/// Listening SMTP receiver.
pub struct Receiver<S: MessageSink + ?Sized> {
    listener: TcpListener,
    config: Arc<ReceiverConfig>,
    sink: Arc<S>,
}

impl<S: MessageSink + ?Sized> std::fmt::Debug for Receiver<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver")
            .field("local_addr", &self.listener.local_addr().ok())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S: MessageSink + ?Sized> Receiver<S> {
    /// Binds the listening socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        config: ReceiverConfig,
        sink: Arc<S>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            config: Arc::new(config),
            sink,
        })
    }

    /// Address the receiver is listening on.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket has no local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until `shutdown` turns true.
    ///
    /// Sessions already running are left to finish on their own.
    ///
    /// # Errors
    ///
    /// Returns an error only if the listener itself fails.
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let slots = Arc::new(Semaphore::new(self.config.max_connections.max(1)));
        info!(addr = ?self.listener.local_addr().ok(), "SMTP receiver listening");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = Arc::clone(&slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let (stream, peer) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "SMTP accept failed");
                        continue;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            debug!(%peer, "SMTP connection accepted");
            let config = Arc::clone(&self.config);
            let sink = Arc::clone(&self.sink);
            tokio::spawn(async move {
                if let Err(e) = run_session(stream, Some(peer), config, sink).await {
                    debug!(%peer, error = %e, "SMTP session ended with error");
                }
                drop(permit);
            });
        }

        info!("SMTP receiver stopped");
        Ok(())
    }
}
