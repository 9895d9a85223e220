//! Failures of an SMTP session and how they should be retried.

use std::io;
use std::time::Duration;

use crate::types::{ReplyClass, ReplyCode};

/// Result of an SMTP operation.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a session or command failed.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Socket failure.
    #[error("network: {0}")]
    Io(#[from] io::Error),

    /// TLS setup failure.
    #[error("tls: {0}")]
    Tls(#[from] rustls::Error),

    /// A network step did not finish in time.
    #[error("no answer within {0:?}")]
    Timeout(Duration),

    /// The server refused a command.
    #[error("server replied {code} {message}")]
    Reply {
        /// Reply code, e.g. 550.
        code: u16,
        /// Reply text.
        message: String,
    },

    /// A reply that makes no sense at this point of the dialogue.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// An address that cannot go on the wire.
    #[error("unusable address {0:?}")]
    InvalidAddress(String),

    /// The message is over the advertised `SIZE`.
    #[error("message is {size} bytes, server takes at most {limit}")]
    MessageTooLarge {
        /// Message size.
        size: usize,
        /// Advertised limit.
        limit: usize,
    },

    /// A required extension was not advertised.
    #[error("server lacks {0}")]
    NotSupported(String),

    /// The peer hung up.
    #[error("connection closed by peer")]
    ConnectionClosed,
}

impl Error {
    /// Creates an error from a server reply code and text.
    #[must_use]
    pub fn reply(code: u16, message: impl Into<String>) -> Self {
        Self::Reply {
            code,
            message: message.into(),
        }
    }

    /// Returns the SMTP reply code carried by this error, if any.
    #[must_use]
    pub const fn code(&self) -> Option<u16> {
        match self {
            Self::Reply { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Returns true if retrying later may succeed.
    ///
    /// Network failures, timeouts, dropped connections and 4xx replies are
    /// transient. Everything else is permanent.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Io(_) | Self::Timeout(_) | Self::ConnectionClosed => true,
            Self::Reply { code, .. } => {
                matches!(ReplyCode::new(*code).class(), ReplyClass::Transient)
            }
            _ => false,
        }
    }

    /// Returns true if retrying cannot succeed.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}
