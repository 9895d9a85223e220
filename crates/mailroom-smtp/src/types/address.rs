//! Envelope address types.

use crate::error::{Error, Result};

/// Email address used in the SMTP envelope (`MAIL FROM` / `RCPT TO`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address(String);

impl Address {
    /// Creates a new address from a string.
    ///
    /// # Errors
    ///
    /// Returns an error if the address is not of the form `local@domain`
    /// or contains characters that cannot appear in an envelope path.
    pub fn new(addr: impl Into<String>) -> Result<Self> {
        let addr = addr.into();
        let addr = addr.trim().to_string();
        Self::validate(&addr)?;
        Ok(Self(addr))
    }

    /// Returns the address as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the part before the `@`.
    #[must_use]
    pub fn local_part(&self) -> &str {
        self.0.rsplit_once('@').map_or("", |(local, _)| local)
    }

    /// Returns the part after the `@`.
    #[must_use]
    pub fn domain(&self) -> &str {
        self.0.rsplit_once('@').map_or("", |(_, domain)| domain)
    }

    /// Returns the address with its domain lowercased.
    #[must_use]
    pub fn normalized(&self) -> String {
        format!("{}@{}", self.local_part(), self.domain().to_ascii_lowercase())
    }

    fn validate(addr: &str) -> Result<()> {
        if addr.is_empty() {
            return Err(Error::InvalidAddress("Address cannot be empty".into()));
        }

        if addr
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || c == '<' || c == '>')
        {
            return Err(Error::InvalidAddress(format!(
                "Address contains forbidden characters: {addr}"
            )));
        }

        let Some((local, domain)) = addr.rsplit_once('@') else {
            return Err(Error::InvalidAddress(format!("Missing @ in {addr}")));
        };

        if local.is_empty() || domain.is_empty() {
            return Err(Error::InvalidAddress(format!(
                "Local and domain parts cannot be empty: {addr}"
            )));
        }

        if domain.contains('@') || domain.starts_with('.') || domain.ends_with('.') {
            return Err(Error::InvalidAddress(format!("Invalid domain in {addr}")));
        }

        Ok(())
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Reverse path from `MAIL FROM`: either an address or the null sender `<>`
/// used by bounces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReversePath {
    /// The null reverse path.
    Null,
    /// A regular sender address.
    Address(Address),
}

impl ReversePath {
    /// Returns the sender address, or an empty string for the null path.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Null => "",
            Self::Address(addr) => addr.as_str(),
        }
    }
}

/// Parses the argument of `MAIL FROM:` / `RCPT TO:` into the bracketed path and
/// any trailing ESMTP parameters.
///
/// Accepts `<user@example.com> SIZE=123` as well as the lenient unbracketed
/// `user@example.com` form some clients send.
///
/// # Errors
///
/// Returns an error if brackets are unbalanced.
pub fn split_path(arg: &str) -> Result<(&str, Vec<&str>)> {
    let arg = arg.trim();
    if let Some(rest) = arg.strip_prefix('<') {
        let end = rest
            .find('>')
            .ok_or_else(|| Error::InvalidAddress(format!("Unterminated path: {arg}")))?;
        let path = &rest[..end];
        let params = rest[end + 1..].split_whitespace().collect();
        Ok((path, params))
    } else {
        let mut parts = arg.split_whitespace();
        let path = parts.next().unwrap_or("");
        Ok((path, parts.collect()))
    }
}
