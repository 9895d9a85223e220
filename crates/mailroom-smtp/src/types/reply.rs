//! Replies: a three-digit code and one or more text lines.

use std::fmt::{self, Write as _};

/// A reply as read from a server or written by the receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Code shared by every line.
    pub code: ReplyCode,
    /// Text lines, without the code prefix.
    pub lines: Vec<String>,
}

impl Reply {
    /// A reply with several text lines.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(code: ReplyCode, lines: Vec<String>) -> Self {
        Self { code, lines }
    }

    /// A one-line reply.
    #[must_use]
    pub fn single(code: ReplyCode, text: impl Into<String>) -> Self {
        Self::new(code, vec![text.into()])
    }

    /// Class of the code.
    #[must_use]
    pub const fn class(&self) -> ReplyClass {
        self.code.class()
    }

    /// 2xx.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.class(), ReplyClass::Completed)
    }

    /// Lines joined with `\n`.
    #[must_use]
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// Wire form: `250-first`, ..., `250 last`, each CRLF-terminated.
    #[must_use]
    pub fn to_wire(&self) -> String {
        let code = self.code;
        let Some((last, init)) = self.lines.split_last() else {
            return format!("{code} \r\n");
        };
        let mut out = String::new();
        for line in init {
            let _ = write!(out, "{code}-{line}\r\n");
        }
        let _ = write!(out, "{code} {last}\r\n");
        out
    }
}

/// First digit of a reply code (RFC 5321 section 4.2.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyClass {
    /// 2yz: the command succeeded.
    Completed,
    /// 3yz: more input is expected.
    Intermediate,
    /// 4yz: try again later.
    Transient,
    /// 5yz: do not retry.
    Permanent,
    /// Anything outside 200..600.
    Unknown,
}

/// A three-digit reply code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplyCode(u16);

impl ReplyCode {
    /// Wraps a numeric code.
    #[must_use]
    pub const fn new(code: u16) -> Self {
        Self(code)
    }

    /// The numeric code.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }

    /// Which class the code falls in.
    #[must_use]
    pub const fn class(self) -> ReplyClass {
        match self.0 / 100 {
            2 => ReplyClass::Completed,
            3 => ReplyClass::Intermediate,
            4 => ReplyClass::Transient,
            5 => ReplyClass::Permanent,
            _ => ReplyClass::Unknown,
        }
    }

    /// Greeting.
    pub const SERVICE_READY: Self = Self(220);
    /// Reply to QUIT.
    pub const CLOSING: Self = Self(221);
    /// Requested action completed.
    pub const OK: Self = Self(250);
    /// Server challenge during AUTH.
    pub const AUTH_CONTINUE: Self = Self(334);
    /// Go ahead with the message after DATA.
    pub const START_DATA: Self = Self(354);
    /// Closing the channel, e.g. on idle timeout.
    pub const SERVICE_UNAVAILABLE: Self = Self(421);
    /// Mailbox busy; try later.
    pub const MAILBOX_BUSY: Self = Self(450);
    /// Local processing error.
    pub const LOCAL_ERROR: Self = Self(451);
    /// Too many recipients, or out of storage.
    pub const INSUFFICIENT_STORAGE: Self = Self(452);
    /// Unrecognized command or overlong line.
    pub const SYNTAX_ERROR: Self = Self(500);
    /// Bad arguments.
    pub const PARAMETER_ERROR: Self = Self(501);
    /// Command not offered here.
    pub const NOT_IMPLEMENTED: Self = Self(502);
    /// Command out of order.
    pub const BAD_SEQUENCE: Self = Self(503);
    /// No such mailbox.
    pub const MAILBOX_UNAVAILABLE: Self = Self(550);
    /// Message too large.
    pub const EXCEEDED_STORAGE: Self = Self(552);
    /// Transaction refused.
    pub const TRANSACTION_FAILED: Self = Self(554);
}

impl fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}", self.0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn classes_follow_first_digit() {
        assert_eq!(ReplyCode::OK.class(), ReplyClass::Completed);
        assert_eq!(ReplyCode::START_DATA.class(), ReplyClass::Intermediate);
        assert_eq!(ReplyCode::MAILBOX_BUSY.class(), ReplyClass::Transient);
        assert_eq!(ReplyCode::MAILBOX_UNAVAILABLE.class(), ReplyClass::Permanent);
        assert_eq!(ReplyCode::new(99).class(), ReplyClass::Unknown);
        assert_eq!(ReplyCode::new(600).class(), ReplyClass::Unknown);
    }

    #[test]
    fn wire_format() {
        assert_eq!(Reply::single(ReplyCode::OK, "OK").to_wire(), "250 OK\r\n");
        let ehlo = Reply::new(
            ReplyCode::OK,
            vec!["mx.example.com".into(), "PIPELINING".into(), "SIZE 1000".into()],
        );
        assert_eq!(
            ehlo.to_wire(),
            "250-mx.example.com\r\n250-PIPELINING\r\n250 SIZE 1000\r\n"
        );
        assert_eq!(Reply::new(ReplyCode::OK, Vec::new()).to_wire(), "250 \r\n");
    }

    #[test]
    fn text_joins_lines() {
        let reply = Reply::new(ReplyCode::MAILBOX_UNAVAILABLE, vec!["a".into(), "b".into()]);
        assert_eq!(reply.text(), "a\nb");
        assert!(!reply.is_success());
        assert_eq!(reply.class(), ReplyClass::Permanent);
    }
}
