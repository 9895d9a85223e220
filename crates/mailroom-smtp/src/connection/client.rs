//! Type-state SMTP client.

use super::{ServerInfo, SmtpStream};
use crate::command::{BodyType, Command};
use crate::error::{Error, Result};
use crate::parser::{is_last_reply_line, parse_reply};
use crate::types::{Address, AuthMechanism, Extension, Reply, ReplyCode, ReversePath};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::collections::HashSet;
use std::marker::PhantomData;
use tracing::debug;

/// Greeted connection, ready for EHLO, STARTTLS, AUTH or a new transaction.
#[derive(Debug)]
pub struct Connected;

/// Authenticated connection.
#[derive(Debug)]
pub struct Authenticated;

/// `MAIL FROM` accepted; recipients may be added.
#[derive(Debug)]
pub struct MailTransaction;

/// `DATA` accepted; the message body may be sent.
#[derive(Debug)]
pub struct Data;

/// SMTP client with type-state pattern.
#[derive(Debug)]
pub struct Client<State> {
    stream: SmtpStream,
    server_info: ServerInfo,
    accepted_recipients: usize,
    _state: PhantomData<State>,
}

/// Connection trait for all states.
pub trait SmtpConnection {
    /// Returns the server information.
    fn server_info(&self) -> &ServerInfo;
}

impl<S> SmtpConnection for Client<S> {
    fn server_info(&self) -> &ServerInfo {
        &self.server_info
    }
}

impl Client<Connected> {
    /// Creates a client from a stream and reads the server greeting.
    ///
    /// # Errors
    ///
    /// Returns an error if reading the greeting fails or the server refuses
    /// the connection.
    pub async fn from_stream(mut stream: SmtpStream) -> Result<Self> {
        let greeting = read_reply(&mut stream).await?;
        if greeting.code != ReplyCode::SERVICE_READY {
            return Err(Error::reply(greeting.code.as_u16(), greeting.text()));
        }

        let hostname = greeting
            .lines
            .first()
            .and_then(|line| line.split_whitespace().next())
            .unwrap_or("unknown")
            .to_string();
        debug!(server = %hostname, "SMTP greeting received");

        Ok(Self {
            stream,
            server_info: ServerInfo {
                hostname,
                extensions: HashSet::new(),
            },
            accepted_recipients: 0,
            _state: PhantomData,
        })
    }

    /// Sends EHLO and records the advertised extensions.
    ///
    /// Falls back to HELO when the server does not understand EHLO.
    ///
    /// # Errors
    ///
    /// Returns an error if both greetings are refused.
    pub async fn ehlo(mut self, client_hostname: &str) -> Result<Self> {
        let reply = self
            .send_command(&Command::Ehlo {
                hostname: client_hostname.to_string(),
            })
            .await?;

        if reply.is_success() {
            self.server_info.extensions = parse_extensions(&reply);
            return Ok(self);
        }

        if reply.code == ReplyCode::SYNTAX_ERROR || reply.code == ReplyCode::NOT_IMPLEMENTED {
            debug!("EHLO refused, falling back to HELO");
            let reply = self
                .send_command(&Command::Helo {
                    hostname: client_hostname.to_string(),
                })
                .await?;
            expect_success(&reply)?;
            self.server_info.extensions.clear();
            return Ok(self);
        }

        Err(Error::reply(reply.code.as_u16(), reply.text()))
    }

    /// Upgrades the connection to TLS using STARTTLS and greets again.
    ///
    /// # Errors
    ///
    /// Returns an error if STARTTLS is not advertised or the upgrade fails.
    pub async fn starttls(mut self, hostname: &str, client_hostname: &str) -> Result<Self> {
        if !self.server_info.supports_starttls() {
            return Err(Error::NotSupported("STARTTLS".into()));
        }

        let reply = self.send_command(&Command::StartTls).await?;
        expect_success(&reply)?;

        self.stream = self.stream.upgrade_to_tls(hostname).await?;
        debug!(server = %hostname, "connection upgraded to TLS");

        // Capabilities must be rediscovered after the upgrade (RFC 3207).
        self.ehlo(client_hostname).await
    }

    /// Authenticates with the best mechanism the server offers.
    ///
    /// PLAIN is preferred over LOGIN. Servers that advertise no AUTH
    /// mechanism are tried with PLAIN.
    ///
    /// # Errors
    ///
    /// Returns an error if authentication fails.
    pub async fn authenticate(
        self,
        username: &str,
        password: &str,
    ) -> Result<Client<Authenticated>> {
        let offered = self.server_info.auth_mechanisms();
        if offered.contains(&AuthMechanism::Plain) || offered.is_empty() {
            self.auth_plain(username, password).await
        } else if offered.contains(&AuthMechanism::Login) {
            self.auth_login(username, password).await
        } else {
            Err(Error::NotSupported("PLAIN or LOGIN authentication".into()))
        }
    }

    /// Authenticates using the PLAIN mechanism.
    ///
    /// # Errors
    ///
    /// Returns an error if authentication fails.
    pub async fn auth_plain(
        mut self,
        username: &str,
        password: &str,
    ) -> Result<Client<Authenticated>> {
        let credentials = format!("\0{username}\0{password}");
        let reply = self
            .send_command(&Command::Auth {
                mechanism: AuthMechanism::Plain,
                initial_response: Some(STANDARD.encode(credentials.as_bytes())),
            })
            .await?;
        expect_success(&reply)?;
        Ok(self.transition())
    }

    /// Authenticates using the LOGIN mechanism.
    ///
    /// # Errors
    ///
    /// Returns an error if authentication fails.
    pub async fn auth_login(
        mut self,
        username: &str,
        password: &str,
    ) -> Result<Client<Authenticated>> {
        let reply = self
            .send_command(&Command::Auth {
                mechanism: AuthMechanism::Login,
                initial_response: None,
            })
            .await?;
        expect_code(&reply, ReplyCode::AUTH_CONTINUE)?;

        let reply = self
            .send_command(&Command::AuthResponse(STANDARD.encode(username)))
            .await?;
        expect_code(&reply, ReplyCode::AUTH_CONTINUE)?;

        let reply = self
            .send_command(&Command::AuthResponse(STANDARD.encode(password)))
            .await?;
        expect_success(&reply)?;
        Ok(self.transition())
    }

    /// Starts a mail transaction without authentication.
    ///
    /// # Errors
    ///
    /// Returns an error if the message exceeds the advertised size or the
    /// server rejects the sender.
    pub async fn mail_from(
        self,
        from: Address,
        size: Option<usize>,
    ) -> Result<Client<MailTransaction>> {
        self.start_transaction(from, size).await
    }
}

impl Client<Authenticated> {
    /// Starts a mail transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the message exceeds the advertised size or the
    /// server rejects the sender.
    pub async fn mail_from(
        self,
        from: Address,
        size: Option<usize>,
    ) -> Result<Client<MailTransaction>> {
        self.start_transaction(from, size).await
    }
}

impl Client<MailTransaction> {
    /// Offers a recipient to the server.
    ///
    /// A refused recipient does not end the transaction: the reply is
    /// returned so the caller can record a per-recipient outcome.
    ///
    /// # Errors
    ///
    /// Returns an error only for transport or protocol failures.
    pub async fn rcpt_to(&mut self, to: &Address) -> Result<Reply> {
        let reply = self.send_command(&Command::RcptTo { to: to.clone() }).await?;
        if reply.is_success() {
            self.accepted_recipients += 1;
        }
        Ok(reply)
    }

    /// Number of recipients accepted so far.
    #[must_use]
    pub const fn accepted_recipients(&self) -> usize {
        self.accepted_recipients
    }

    /// Begins sending message data.
    ///
    /// # Errors
    ///
    /// Returns an error if no recipient was accepted or the server refuses
    /// DATA.
    pub async fn data(mut self) -> Result<Client<Data>> {
        if self.accepted_recipients == 0 {
            return Err(Error::Protocol("DATA without an accepted recipient".into()));
        }

        let reply = self.send_command(&Command::Data).await?;
        expect_code(&reply, ReplyCode::START_DATA)?;
        Ok(self.transition())
    }

    /// Aborts the transaction with RSET.
    ///
    /// # Errors
    ///
    /// Returns an error if the RSET command fails.
    pub async fn reset(mut self) -> Result<Client<Connected>> {
        let reply = self.send_command(&Command::Rset).await?;
        expect_success(&reply)?;
        Ok(self.transition())
    }
}

impl Client<Data> {
    /// Sends the message content and completes the transaction.
    ///
    /// Line endings are normalized to CRLF, lines starting with `.` are
    /// dot-stuffed and the terminating `.` line is appended.
    ///
    /// # Errors
    ///
    /// Returns an error if sending fails or the server rejects the message.
    pub async fn send_message(mut self, message: &[u8]) -> Result<(Client<Connected>, Reply)> {
        let encoded = encode_data(message);
        self.stream.write_all(&encoded).await?;

        let reply = read_reply(&mut self.stream).await?;
        expect_success(&reply)?;
        Ok((self.transition(), reply))
    }
}

impl<S> Client<S> {
    async fn start_transaction(
        mut self,
        from: Address,
        size: Option<usize>,
    ) -> Result<Client<MailTransaction>> {
        if let (Some(size), Some(limit)) = (size, self.server_info.max_message_size()) {
            if size > limit {
                return Err(Error::MessageTooLarge { size, limit });
            }
        }

        let supports_size = self
            .server_info
            .extensions
            .iter()
            .any(|e| matches!(e, Extension::Size(_)));
        let cmd = Command::MailFrom {
            from: ReversePath::Address(from),
            body: self
                .server_info
                .supports(&Extension::EightBitMime)
                .then_some(BodyType::EightBitMime),
            size: size.filter(|_| supports_size),
        };
        let reply = self.send_command(&cmd).await?;
        expect_success(&reply)?;
        Ok(self.transition())
    }

    fn transition<T>(self) -> Client<T> {
        Client {
            stream: self.stream,
            server_info: self.server_info,
            accepted_recipients: 0,
            _state: PhantomData,
        }
    }

    async fn send_command(&mut self, cmd: &Command) -> Result<Reply> {
        self.stream.write_all(&cmd.serialize()).await?;
        let reply = read_reply(&mut self.stream).await?;
        debug!(code = reply.code.as_u16(), "SMTP reply");
        Ok(reply)
    }

    /// Sends QUIT and closes the connection (available in any state).
    ///
    /// # Errors
    ///
    /// Returns an error if the QUIT command fails.
    pub async fn quit(mut self) -> Result<()> {
        let reply = self.send_command(&Command::Quit).await?;
        if !reply.is_success() {
            return Err(Error::reply(reply.code.as_u16(), reply.text()));
        }
        Ok(())
    }
}

async fn read_reply(stream: &mut SmtpStream) -> Result<Reply> {
    let mut lines = Vec::new();
    loop {
        let line = stream.read_line().await?;
        if line.is_empty() {
            continue;
        }

        let is_last = is_last_reply_line(&line);
        lines.push(line);
        if is_last {
            break;
        }
    }
    parse_reply(&lines)
}

fn parse_extensions(reply: &Reply) -> HashSet<Extension> {
    // The first line is the server's greeting text, not an extension.
    reply.lines.iter().skip(1).map(|l| Extension::parse(l)).collect()
}

fn expect_success(reply: &Reply) -> Result<()> {
    if reply.is_success() {
        Ok(())
    } else {
        Err(Error::reply(reply.code.as_u16(), reply.text()))
    }
}

fn expect_code(reply: &Reply, code: ReplyCode) -> Result<()> {
    if reply.code == code {
        Ok(())
    } else {
        Err(Error::reply(reply.code.as_u16(), reply.text()))
    }
}

/// Encodes a message body for the DATA phase.
#[must_use]
pub fn encode_data(message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(message.len() + 64);
    let body = message.strip_suffix(b"\n").unwrap_or(message);
    let body = body.strip_suffix(b"\r").unwrap_or(body);

    if !body.is_empty() {
        for line in body.split(|&b| b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.first() == Some(&b'.') {
                out.push(b'.');
            }
            out.extend_from_slice(line);
            out.extend_from_slice(b"\r\n");
        }
    }

    out.extend_from_slice(b".\r\n");
    out
}
