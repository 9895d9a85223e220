//! The outbound client: a typestate session over a TCP or TLS stream.

mod client;
mod stream;

pub use client::{
    Authenticated, Client, Connected, Data, MailTransaction, SmtpConnection, encode_data,
};
pub use stream::{SmtpStream, connect, connect_tls};

use crate::types::{AuthMechanism, Extension};
use std::collections::HashSet;

/// What the server told us about itself in its greeting and EHLO reply.
#[derive(Debug, Clone, Default)]
pub struct ServerInfo {
    /// Name from the 220 greeting.
    pub hostname: String,
    /// Extensions from the last EHLO; empty after a HELO fallback.
    pub extensions: HashSet<Extension>,
}

impl ServerInfo {
    /// Whether `ext` was advertised.
    #[must_use]
    pub fn supports(&self, ext: &Extension) -> bool {
        self.extensions.contains(ext)
    }

    /// Whether STARTTLS was advertised.
    #[must_use]
    pub fn supports_starttls(&self) -> bool {
        self.supports(&Extension::StartTls)
    }

    fn find<T>(&self, pick: impl Fn(&Extension) -> Option<T>) -> Option<T> {
        self.extensions.iter().find_map(pick)
    }

    /// Advertised `SIZE` limit; `None` when absent or unlimited.
    #[must_use]
    pub fn max_message_size(&self) -> Option<usize> {
        self.find(|ext| match ext {
            Extension::Size(limit) => *limit,
            _ => None,
        })
    }

    /// Advertised `AUTH` mechanisms that this client can speak.
    #[must_use]
    pub fn auth_mechanisms(&self) -> Vec<AuthMechanism> {
        self.find(|ext| match ext {
            Extension::Auth(mechanisms) => Some(mechanisms.clone()),
            _ => None,
        })
        .unwrap_or_default()
    }
}
