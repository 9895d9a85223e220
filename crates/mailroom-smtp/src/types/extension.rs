//! ESMTP extension keywords.

/// ESMTP extension advertised in an EHLO reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Extension {
    /// STARTTLS - TLS upgrade
    StartTls,
    /// AUTH - Authentication with the listed mechanisms
    Auth(Vec<AuthMechanism>),
    /// SIZE - Maximum message size (0 or absent means no fixed limit)
    Size(Option<usize>),
    /// 8BITMIME - 8-bit MIME transport
    EightBitMime,
    /// PIPELINING - Command pipelining
    Pipelining,
    /// SMTPUTF8 - UTF-8 email addresses
    SmtpUtf8,
    /// ENHANCEDSTATUSCODES - RFC 3463 status codes in replies
    EnhancedStatusCodes,
    /// Any extension this crate does not interpret
    Other(String),
}

impl Extension {
    /// Parses one line of an EHLO reply (after the greeting line).
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let mut words = line.split_whitespace();
        let Some(keyword) = words.next() else {
            return Self::Other(line.to_string());
        };

        match keyword.to_ascii_uppercase().as_str() {
            "STARTTLS" => Self::StartTls,
            "AUTH" => Self::Auth(words.filter_map(AuthMechanism::parse).collect()),
            "SIZE" => Self::Size(words.next().and_then(|s| s.parse().ok()).filter(|n| *n > 0)),
            "8BITMIME" => Self::EightBitMime,
            "PIPELINING" => Self::Pipelining,
            "SMTPUTF8" => Self::SmtpUtf8,
            "ENHANCEDSTATUSCODES" => Self::EnhancedStatusCodes,
            _ => Self::Other(line.to_string()),
        }
    }

    /// Renders the extension as an EHLO reply line.
    #[must_use]
    pub fn keyword_line(&self) -> String {
        match self {
            Self::StartTls => "STARTTLS".into(),
            Self::Auth(mechs) => {
                let names: Vec<&str> = mechs.iter().map(|m| m.as_str()).collect();
                format!("AUTH {}", names.join(" "))
            }
            Self::Size(Some(n)) => format!("SIZE {n}"),
            Self::Size(None) => "SIZE".into(),
            Self::EightBitMime => "8BITMIME".into(),
            Self::Pipelining => "PIPELINING".into(),
            Self::SmtpUtf8 => "SMTPUTF8".into(),
            Self::EnhancedStatusCodes => "ENHANCEDSTATUSCODES".into(),
            Self::Other(line) => line.clone(),
        }
    }
}

/// SASL authentication mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMechanism {
    /// PLAIN - RFC 4616
    Plain,
    /// LOGIN - legacy username/password prompts
    Login,
}

impl AuthMechanism {
    /// Parses an authentication mechanism name.
    ///
    /// Mechanisms this client cannot perform yield `None`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PLAIN" => Some(Self::Plain),
            "LOGIN" => Some(Self::Login),
            _ => None,
        }
    }

    /// Returns the mechanism name as a string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::Login => "LOGIN",
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_keywords() {
        assert_eq!(Extension::parse("STARTTLS"), Extension::StartTls);
        assert_eq!(Extension::parse("starttls"), Extension::StartTls);
        assert_eq!(Extension::parse("8BITMIME"), Extension::EightBitMime);
        assert_eq!(Extension::parse("PIPELINING"), Extension::Pipelining);
        assert_eq!(
            Extension::parse("ENHANCEDSTATUSCODES"),
            Extension::EnhancedStatusCodes
        );
    }

    #[test]
    fn parse_size() {
        assert_eq!(
            Extension::parse("SIZE 35882577"),
            Extension::Size(Some(35_882_577))
        );
        assert_eq!(Extension::parse("SIZE"), Extension::Size(None));
        assert_eq!(Extension::parse("SIZE 0"), Extension::Size(None));
    }

    #[test]
    fn parse_auth_skips_unknown_mechanisms() {
        assert_eq!(
            Extension::parse("AUTH CRAM-MD5 LOGIN PLAIN XOAUTH2"),
            Extension::Auth(vec![AuthMechanism::Login, AuthMechanism::Plain])
        );
    }

    #[test]
    fn parse_unknown() {
        assert_eq!(
            Extension::parse("X-VENDOR thing"),
            Extension::Other("X-VENDOR thing".into())
        );
    }

    #[test]
    fn keyword_lines() {
        assert_eq!(Extension::Size(Some(10)).keyword_line(), "SIZE 10");
        assert_eq!(
            Extension::Auth(vec![AuthMechanism::Plain, AuthMechanism::Login]).keyword_line(),
            "AUTH PLAIN LOGIN"
        );
    }
}
