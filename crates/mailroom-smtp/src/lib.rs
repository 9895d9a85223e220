//! # mailroom-smtp
//!
//! SMTP for the mailroom delivery pipeline (RFC 5321): an outbound client
//! used to hand mail to a relay, and an inbound receiver that accepts mail
//! for local mailboxes.
//!
//! ## Features
//!
//! - **Type-state client**: compile-time enforcement of valid SMTP state
//!   transitions
//! - **Transport**: one call per message with per-recipient outcomes,
//!   STARTTLS or implicit TLS, AUTH PLAIN/LOGIN and step timeouts
//! - **Receiver**: EHLO/HELO, MAIL, RCPT, DATA, RSET, NOOP and QUIT with size
//!   and recipient limits, handing messages to a [`MessageSink`]
//!
//! ## Sending
//!
//! ```ignore
//! use mailroom_smtp::{Address, Envelope, Security, SmtpTransport, TransportConfig};
//!
//! # async fn send() -> mailroom_smtp::Result<()> {
//! let transport = SmtpTransport::new(TransportConfig::new("smtp.example.com", Security::StartTls));
//! let envelope = Envelope::new(
//!     Address::new("alice@example.com")?,
//!     vec![Address::new("bob@example.org")?],
//! );
//! let report = transport
//!     .deliver(&envelope, b"Subject: Hi\r\n\r\nHello\r\n")
//!     .await?;
//! assert!(report.all_accepted());
//! # Ok(())
//! # }
//! ```
//!
//! ## Client States
//!
//! ```text
//! Connected ── authenticate() ──→ Authenticated
//!     │                                │
//!     └──────── mail_from() ───────────┴──→ MailTransaction ── data() ──→ Data
//!                                                 ↑                        │
//!                                                 └── send_message() ──────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod command;
pub mod connection;
mod error;
pub mod parser;
pub mod server;
mod transport;
pub mod types;

pub use connection::{
    Authenticated, Client, Connected, Data, MailTransaction, ServerInfo, SmtpConnection,
};
pub use error::{Error, Result};
pub use server::{DeliveryError, InboundMessage, MessageSink, Receiver, ReceiverConfig};
pub use transport::{
    Credentials, DeliveryReport, Envelope, RecipientOutcome, Security, SmtpTransport,
    TransportConfig,
};
pub use types::{Address, AuthMechanism, Extension, Reply, ReplyClass, ReplyCode, ReversePath};
