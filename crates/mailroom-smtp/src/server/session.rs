//! Server side of one SMTP conversation.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use super::{DeliveryError, InboundMessage, MessageSink, ReceiverConfig};
use crate::command::{Command, ParseError};
use crate::error::{Error, Result};
use crate::types::{Address, Extension, Reply, ReplyCode, ReversePath};

/// RFC 5321 section 4.5.3.1.4 limit for command lines, CRLF included.
const MAX_COMMAND_LINE: usize = 512;

/// RFC 5321 section 4.5.3.1.6 limit for text lines, CRLF included. Longer
/// lines are still kept in message data; this only bounds the bytes held
/// while draining a message that is already over the size limit.
const MAX_TEXT_LINE: usize = 1000;

/// A leading stuffed dot plus CRLF on top of the payload of a data line.
const DATA_LINE_OVERHEAD: usize = 3;

/// Outcome of reading one line.
enum Line {
    /// A complete line, terminator stripped.
    Complete(Vec<u8>),
    /// A line that exceeded the limit; its bytes were discarded.
    TooLong,
    /// End of stream.
    Eof,
}

#[derive(Default)]
struct Transaction {
    mail_from: Option<ReversePath>,
    recipients: Vec<Address>,
}

/// Runs one SMTP session over `stream` until QUIT, EOF or timeout.
///
/// # Errors
///
/// Returns an error only for I/O failures on the connection.
pub async fn run_session<T, S>(
    stream: T,
    peer: Option<SocketAddr>,
    config: Arc<ReceiverConfig>,
    sink: Arc<S>,
) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
    S: MessageSink + ?Sized,
{
    let mut stream = BufReader::new(stream);
    let mut helo: Option<String> = None;
    let mut txn = Transaction::default();

    send(
        &mut stream,
        &Reply::single(
            ReplyCode::SERVICE_READY,
            format!("{} ESMTP mailroom ready", config.hostname),
        ),
    )
    .await?;

    loop {
        let line = match tokio::time::timeout(
            config.command_timeout,
            read_line(&mut stream, MAX_COMMAND_LINE),
        )
        .await
        {
            Ok(line) => line?,
            Err(_) => {
                debug!(?peer, "SMTP session idle timeout");
                send(
                    &mut stream,
                    &Reply::single(ReplyCode::SERVICE_UNAVAILABLE, "Idle timeout, closing"),
                )
                .await?;
                return Ok(());
            }
        };

        let line = match line {
            Line::Eof => return Ok(()),
            Line::TooLong => {
                send(
                    &mut stream,
                    &Reply::single(ReplyCode::SYNTAX_ERROR, "Line too long"),
                )
                .await?;
                continue;
            }
            Line::Complete(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        };

        let reply = match Command::parse(&line) {
            Err(ParseError::UnknownCommand(verb)) => {
                Reply::single(ReplyCode::SYNTAX_ERROR, format!("Command not recognized: {verb}"))
            }
            Err(ParseError::InvalidArguments(msg)) => {
                Reply::single(ReplyCode::PARAMETER_ERROR, msg)
            }
            Ok(Command::Quit) => {
                send(
                    &mut stream,
                    &Reply::single(ReplyCode::CLOSING, format!("{} closing", config.hostname)),
                )
                .await?;
                return Ok(());
            }
            Ok(Command::Helo { hostname }) => {
                txn = Transaction::default();
                helo = Some(hostname.clone());
                Reply::single(ReplyCode::OK, format!("{} greets {hostname}", config.hostname))
            }
            Ok(Command::Ehlo { hostname }) => {
                txn = Transaction::default();
                helo = Some(hostname.clone());
                ehlo_reply(&config, &hostname)
            }
            Ok(Command::StartTls) => {
                Reply::single(ReplyCode::NOT_IMPLEMENTED, "TLS not available")
            }
            Ok(Command::Auth { .. } | Command::AuthResponse(_)) => {
                Reply::single(ReplyCode::NOT_IMPLEMENTED, "Authentication not available")
            }
            Ok(Command::Noop) => Reply::single(ReplyCode::OK, "OK"),
            Ok(Command::Rset) => {
                txn = Transaction::default();
                Reply::single(ReplyCode::OK, "OK")
            }
            Ok(Command::MailFrom { from, size, .. }) => {
                if helo.is_none() {
                    Reply::single(ReplyCode::BAD_SEQUENCE, "Send EHLO or HELO first")
                } else if txn.mail_from.is_some() {
                    Reply::single(ReplyCode::BAD_SEQUENCE, "Sender already specified")
                } else if size.is_some_and(|s| s > config.max_message_bytes) {
                    Reply::single(
                        ReplyCode::EXCEEDED_STORAGE,
                        "Message size exceeds fixed maximum message size",
                    )
                } else {
                    txn.mail_from = Some(from);
                    Reply::single(ReplyCode::OK, "OK")
                }
            }
            Ok(Command::RcptTo { to }) => {
                if txn.mail_from.is_none() {
                    Reply::single(ReplyCode::BAD_SEQUENCE, "Need MAIL before RCPT")
                } else if txn.recipients.len() >= config.max_recipients {
                    Reply::single(ReplyCode::INSUFFICIENT_STORAGE, "Too many recipients")
                } else if sink.accepts(&to).await {
                    txn.recipients.push(to);
                    Reply::single(ReplyCode::OK, "OK")
                } else {
                    debug!(recipient = %to, "recipient refused");
                    Reply::single(ReplyCode::MAILBOX_UNAVAILABLE, "No such user here")
                }
            }
            Ok(Command::Data) => {
                if txn.mail_from.is_none() {
                    Reply::single(ReplyCode::BAD_SEQUENCE, "Need MAIL before DATA")
                } else if txn.recipients.is_empty() {
                    Reply::single(ReplyCode::BAD_SEQUENCE, "No valid recipients")
                } else {
                    send(
                        &mut stream,
                        &Reply::single(
                            ReplyCode::START_DATA,
                            "End data with <CR><LF>.<CR><LF>",
                        ),
                    )
                    .await?;

                    receive_data(
                        &mut stream,
                        std::mem::take(&mut txn),
                        helo.clone(),
                        peer,
                        &config,
                        sink.as_ref(),
                    )
                    .await?
                }
            }
        };

        send(&mut stream, &reply).await?;
    }
}

async fn receive_data<T, S>(
    stream: &mut BufReader<T>,
    txn: Transaction,
    helo: Option<String>,
    peer: Option<SocketAddr>,
    config: &ReceiverConfig,
    sink: &S,
) -> Result<Reply>
where
    T: AsyncRead + AsyncWrite + Unpin,
    S: MessageSink + ?Sized,
{
    let mut data = Vec::new();
    let mut oversized = false;

    loop {
        // Lines of any length are kept while they fit the remaining budget.
        let limit = if oversized {
            MAX_TEXT_LINE
        } else {
            config.max_message_bytes.saturating_sub(data.len()) + DATA_LINE_OVERHEAD
        };
        let line = tokio::time::timeout(config.data_timeout, read_line(stream, limit))
            .await
            .map_err(|_| Error::Timeout(config.data_timeout))??;
        let bytes = match line {
            Line::Eof => return Err(Error::ConnectionClosed),
            Line::TooLong => {
                oversized = true;
                continue;
            }
            Line::Complete(bytes) => bytes,
        };

        if bytes == b"." {
            break;
        }

        let unstuffed = bytes.strip_prefix(b".").unwrap_or(&bytes);
        if data.len() + unstuffed.len() + 2 > config.max_message_bytes {
            oversized = true;
        }
        if !oversized {
            data.extend_from_slice(unstuffed);
            data.extend_from_slice(b"\r\n");
        }
    }

    if oversized {
        warn!(?peer, "inbound message exceeded size limit");
        return Ok(Reply::single(
            ReplyCode::EXCEEDED_STORAGE,
            "Message size exceeds fixed maximum message size",
        ));
    }

    let message = InboundMessage {
        mail_from: txn.mail_from.unwrap_or(ReversePath::Null),
        recipients: txn.recipients,
        data,
        helo,
        peer,
    };
    let size = message.data.len();
    let recipients = message.recipients.len();

    match sink.deliver(message).await {
        Ok(()) => {
            info!(?peer, size, recipients, "inbound message accepted");
            Ok(Reply::single(ReplyCode::OK, "OK: queued"))
        }
        Err(DeliveryError::Transient(reason)) => {
            warn!(?peer, %reason, "inbound message deferred");
            Ok(Reply::single(
                ReplyCode::LOCAL_ERROR,
                "Local error in processing, try again later",
            ))
        }
        Err(DeliveryError::Permanent(reason)) => {
            warn!(?peer, %reason, "inbound message refused");
            Ok(Reply::single(ReplyCode::TRANSACTION_FAILED, reason))
        }
    }
}

fn ehlo_reply(config: &ReceiverConfig, client: &str) -> Reply {
    let extensions = [
        Extension::Size(Some(config.max_message_bytes)),
        Extension::EightBitMime,
        Extension::Pipelining,
        Extension::SmtpUtf8,
    ];
    let mut lines = vec![format!("{} greets {client}", config.hostname)];
    lines.extend(extensions.iter().map(Extension::keyword_line));
    Reply::new(ReplyCode::OK, lines)
}

async fn send<T>(stream: &mut BufReader<T>, reply: &Reply) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let inner = stream.get_mut();
    inner.write_all(reply.to_wire().as_bytes()).await?;
    inner.flush().await?;
    Ok(())
}

/// Reads up to and including `\n`, discarding bytes beyond `limit`.
async fn read_line<R>(reader: &mut R, limit: usize) -> Result<Line>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let mut too_long = false;

    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(if line.is_empty() && !too_long {
                Line::Eof
            } else if too_long {
                Line::TooLong
            } else {
                Line::Complete(trim_eol(line))
            });
        }

        let (chunk, done) = match available.iter().position(|&b| b == b'\n') {
            Some(i) => (&available[..=i], true),
            None => (available, false),
        };

        if !too_long {
            if line.len() + chunk.len() > limit {
                too_long = true;
                line.clear();
            } else {
                line.extend_from_slice(chunk);
            }
        }

        let consumed = chunk.len();
        reader.consume(consumed);

        if done {
            return Ok(if too_long {
                Line::TooLong
            } else {
                Line::Complete(trim_eol(line))
            });
        }
    }
}

fn trim_eol(mut line: Vec<u8>) -> Vec<u8> {
    if line.last() == Some(&b'\n') {
        line.pop();
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    line
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_line_splits_on_lf() {
        let mut reader = BufReader::new(&b"HELO a\r\nNOOP\n"[..]);
        assert!(matches!(read_line(&mut reader, 512).await.unwrap(), Line::Complete(l) if l == b"HELO a"));
        assert!(matches!(read_line(&mut reader, 512).await.unwrap(), Line::Complete(l) if l == b"NOOP"));
        assert!(matches!(read_line(&mut reader, 512).await.unwrap(), Line::Eof));
    }

    #[tokio::test]
    async fn read_line_flags_overlong_lines() {
        let mut input = vec![b'a'; 600];
        input.extend_from_slice(b"\r\nNOOP\r\n");
        let mut reader = BufReader::new(&input[..]);
        assert!(matches!(read_line(&mut reader, 512).await.unwrap(), Line::TooLong));
        assert!(matches!(read_line(&mut reader, 512).await.unwrap(), Line::Complete(l) if l == b"NOOP"));
    }

    struct Nobody;

    #[async_trait::async_trait]
    impl MessageSink for Nobody {
        async fn accepts(&self, _: &Address) -> bool {
            false
        }

        async fn deliver(&self, _: InboundMessage) -> std::result::Result<(), DeliveryError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn scripted_session() {
        let io = tokio_test::io::Builder::new()
            .write(b"220 mx.local.test ESMTP mailroom ready\r\n")
            .read(b"HELO client.test\r\n")
            .write(b"250 mx.local.test greets client.test\r\n")
            .read(b"STARTTLS\r\n")
            .write(b"502 TLS not available\r\n")
            .read(b"NOOP\r\n")
            .write(b"250 OK\r\n")
            .read(b"QUIT\r\n")
            .write(b"221 mx.local.test closing\r\n")
            .build();
        let config = ReceiverConfig {
            hostname: "mx.local.test".into(),
            ..ReceiverConfig::default()
        };
        run_session(io, None, Arc::new(config), Arc::new(Nobody))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn read_line_returns_unterminated_tail() {
        let mut reader = BufReader::new(&b"QUIT"[..]);
        assert!(matches!(read_line(&mut reader, 512).await.unwrap(), Line::Complete(l) if l == b"QUIT"));
    }
}
