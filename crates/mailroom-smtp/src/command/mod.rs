//! SMTP commands: serialization for the client, parsing for the receiver.

use crate::types::{Address, AuthMechanism, ReversePath, split_path};

/// `BODY=` parameter of `MAIL FROM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyType {
    /// 7-bit ASCII body.
    SevenBit,
    /// 8-bit MIME body (RFC 6152).
    EightBitMime,
}

impl BodyType {
    const fn as_str(self) -> &'static str {
        match self {
            Self::SevenBit => "7BIT",
            Self::EightBitMime => "8BITMIME",
        }
    }
}

/// SMTP command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// HELO - Simple greeting
    Helo {
        /// Client hostname
        hostname: String,
    },
    /// EHLO - Extended greeting
    Ehlo {
        /// Client hostname
        hostname: String,
    },
    /// STARTTLS - Upgrade to TLS
    StartTls,
    /// AUTH - Begin authentication
    Auth {
        /// Authentication mechanism
        mechanism: AuthMechanism,
        /// Initial response (SASL-IR)
        initial_response: Option<String>,
    },
    /// Continuation line sent in answer to a 334 challenge
    AuthResponse(String),
    /// MAIL FROM - Start mail transaction
    MailFrom {
        /// Reverse path
        from: ReversePath,
        /// BODY parameter
        body: Option<BodyType>,
        /// SIZE parameter
        size: Option<usize>,
    },
    /// RCPT TO - Add recipient
    RcptTo {
        /// Recipient address
        to: Address,
    },
    /// DATA - Begin message data
    Data,
    /// RSET - Reset transaction
    Rset,
    /// NOOP - No operation
    Noop,
    /// QUIT - Close connection
    Quit,
}

/// Why a command line could not be parsed by the receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The verb is not one this receiver implements (500).
    UnknownCommand(String),
    /// The verb is known but its arguments are malformed (501).
    InvalidArguments(String),
}

impl Command {
    /// Serializes the command to bytes, including the trailing CRLF.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut line = match self {
            Self::Helo { hostname } => format!("HELO {hostname}"),
            Self::Ehlo { hostname } => format!("EHLO {hostname}"),
            Self::StartTls => "STARTTLS".to_string(),
            Self::Auth {
                mechanism,
                initial_response,
            } => match initial_response {
                Some(resp) => format!("AUTH {} {resp}", mechanism.as_str()),
                None => format!("AUTH {}", mechanism.as_str()),
            },
            Self::AuthResponse(resp) => resp.clone(),
            Self::MailFrom { from, body, size } => {
                let mut s = format!("MAIL FROM:<{}>", from.as_str());
                if let Some(body) = body {
                    s.push_str(" BODY=");
                    s.push_str(body.as_str());
                }
                if let Some(size) = size {
                    s.push_str(&format!(" SIZE={size}"));
                }
                s
            }
            Self::RcptTo { to } => format!("RCPT TO:<{to}>"),
            Self::Data => "DATA".to_string(),
            Self::Rset => "RSET".to_string(),
            Self::Noop => "NOOP".to_string(),
            Self::Quit => "QUIT".to_string(),
        };
        line.push_str("\r\n");
        line.into_bytes()
    }

    /// Parses a command line received from a client (without CRLF).
    ///
    /// # Errors
    ///
    /// Returns [`ParseError::UnknownCommand`] for verbs outside the supported
    /// set and [`ParseError::InvalidArguments`] for malformed arguments.
    pub fn parse(line: &str) -> Result<Self, ParseError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (verb, rest) = line
            .split_once(' ')
            .map_or((line, ""), |(v, r)| (v, r.trim()));

        match verb.to_ascii_uppercase().as_str() {
            "HELO" | "EHLO" => {
                if rest.is_empty() {
                    return Err(ParseError::InvalidArguments(format!(
                        "{verb} requires a hostname"
                    )));
                }
                let hostname = rest.to_string();
                if verb.eq_ignore_ascii_case("HELO") {
                    Ok(Self::Helo { hostname })
                } else {
                    Ok(Self::Ehlo { hostname })
                }
            }
            "MAIL" => Self::parse_mail(rest),
            "RCPT" => Self::parse_rcpt(rest),
            "DATA" => Ok(Self::Data),
            "RSET" => Ok(Self::Rset),
            "NOOP" => Ok(Self::Noop),
            "QUIT" => Ok(Self::Quit),
            "STARTTLS" => Ok(Self::StartTls),
            _ => Err(ParseError::UnknownCommand(verb.to_string())),
        }
    }

    fn parse_mail(rest: &str) -> Result<Self, ParseError> {
        let arg = strip_keyword(rest, "FROM:")
            .ok_or_else(|| ParseError::InvalidArguments("Expected MAIL FROM:<path>".into()))?;
        let (path, params) =
            split_path(arg).map_err(|e| ParseError::InvalidArguments(e.to_string()))?;

        let from = if path.is_empty() {
            ReversePath::Null
        } else {
            ReversePath::Address(
                Address::new(path).map_err(|e| ParseError::InvalidArguments(e.to_string()))?,
            )
        };

        let mut body = None;
        let mut size = None;
        for param in params {
            let (key, value) = param.split_once('=').unwrap_or((param, ""));
            match key.to_ascii_uppercase().as_str() {
                "SIZE" => {
                    size = Some(value.parse().map_err(|_| {
                        ParseError::InvalidArguments(format!("Invalid SIZE value: {value}"))
                    })?);
                }
                "BODY" => {
                    body = match value.to_ascii_uppercase().as_str() {
                        "7BIT" => Some(BodyType::SevenBit),
                        "8BITMIME" => Some(BodyType::EightBitMime),
                        _ => {
                            return Err(ParseError::InvalidArguments(format!(
                                "Invalid BODY value: {value}"
                            )));
                        }
                    };
                }
                // Unknown parameters are ignored rather than refused.
                _ => {}
            }
        }

        Ok(Self::MailFrom { from, body, size })
    }

    fn parse_rcpt(rest: &str) -> Result<Self, ParseError> {
        let arg = strip_keyword(rest, "TO:")
            .ok_or_else(|| ParseError::InvalidArguments("Expected RCPT TO:<path>".into()))?;
        let (path, _) = split_path(arg).map_err(|e| ParseError::InvalidArguments(e.to_string()))?;
        let to = Address::new(path).map_err(|e| ParseError::InvalidArguments(e.to_string()))?;
        Ok(Self::RcptTo { to })
    }
}

fn strip_keyword<'a>(s: &'a str, keyword: &str) -> Option<&'a str> {
    let head = s.get(..keyword.len())?;
    if head.eq_ignore_ascii_case(keyword) {
        Some(&s[keyword.len()..])
    } else {
        None
    }
}
