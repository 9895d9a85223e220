//! Receiver tests over real loopback sockets.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mailroom_smtp::{
    Address, DeliveryError, Envelope, InboundMessage, MessageSink, Receiver, ReceiverConfig,
    RecipientOutcome, Security, SmtpTransport, TransportConfig,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, watch};

/// Accepts mail for `@local.test` and keeps it in memory.
#[derive(Default)]
struct MemorySink {
    delivered: Mutex<Vec<InboundMessage>>,
    fail_with: Option<DeliveryError>,
}

#[async_trait]
impl MessageSink for MemorySink {
    async fn accepts(&self, recipient: &Address) -> bool {
        recipient.domain().eq_ignore_ascii_case("local.test")
    }

    async fn deliver(&self, message: InboundMessage) -> Result<(), DeliveryError> {
        if let Some(err) = &self.fail_with {
            return Err(err.clone());
        }
        self.delivered.lock().await.push(message);
        Ok(())
    }
}

struct Running {
    addr: std::net::SocketAddr,
    sink: Arc<MemorySink>,
    shutdown: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<mailroom_smtp::Result<()>>,
}

async fn start(config: ReceiverConfig, sink: MemorySink) -> Running {
    let sink = Arc::new(sink);
    let receiver = Receiver::bind("127.0.0.1:0", config, Arc::clone(&sink))
        .await
        .unwrap();
    let addr = receiver.local_addr().unwrap();
    let (shutdown, rx) = watch::channel(false);
    let handle = tokio::spawn(receiver.serve(rx));
    Running {
        addr,
        sink,
        shutdown,
        handle,
    }
}

struct Conn {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Conn {
    async fn open(addr: std::net::SocketAddr) -> Self {
        let (read, writer) = TcpStream::connect(addr).await.unwrap().into_split();
        let mut conn = Self {
            reader: BufReader::new(read),
            writer,
        };
        let greeting = conn.reply().await;
        assert!(greeting.starts_with("220 "), "{greeting}");
        conn
    }

    /// Reads one full (possibly multi-line) reply and returns its last line.
    async fn reply(&mut self) -> String {
        loop {
            let mut line = String::new();
            self.reader.read_line(&mut line).await.unwrap();
            let line = line.trim_end().to_string();
            if line.len() < 4 || line.as_bytes()[3] == b' ' {
                return line;
            }
        }
    }

    async fn cmd(&mut self, line: &str) -> String {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
        self.reply().await
    }

    async fn raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }
}

fn code(reply: &str) -> &str {
    &reply[..3]
}

#[tokio::test]
async fn accepts_message_and_unstuffs_dots() {
    let server = start(ReceiverConfig::default(), MemorySink::default()).await;
    let mut c = Conn::open(server.addr).await;

    assert_eq!(code(&c.cmd("EHLO client.test").await), "250");
    assert_eq!(code(&c.cmd("MAIL FROM:<sender@remote.test>").await), "250");
    assert_eq!(code(&c.cmd("RCPT TO:<alice@local.test>").await), "250");
    assert_eq!(code(&c.cmd("DATA").await), "354");
    c.raw(b"Subject: hi\r\n\r\n..leading dot\r\nbody\r\n").await;
    assert_eq!(code(&c.cmd(".").await), "250");
    assert_eq!(code(&c.cmd("QUIT").await), "221");

    let delivered = server.sink.delivered.lock().await;
    assert_eq!(delivered.len(), 1);
    let message = &delivered[0];
    assert_eq!(message.mail_from.as_str(), "sender@remote.test");
    assert_eq!(message.recipients[0].as_str(), "alice@local.test");
    assert_eq!(message.helo.as_deref(), Some("client.test"));
    assert_eq!(
        message.data,
        b"Subject: hi\r\n\r\n.leading dot\r\nbody\r\n".to_vec()
    );
}

#[tokio::test]
async fn enforces_command_sequence() {
    let server = start(ReceiverConfig::default(), MemorySink::default()).await;
    let mut c = Conn::open(server.addr).await;

    assert_eq!(code(&c.cmd("MAIL FROM:<a@remote.test>").await), "503");
    assert_eq!(code(&c.cmd("HELO client.test").await), "250");
    assert_eq!(code(&c.cmd("RCPT TO:<alice@local.test>").await), "503");
    assert_eq!(code(&c.cmd("DATA").await), "503");
    assert_eq!(code(&c.cmd("MAIL FROM:<a@remote.test>").await), "250");
    assert_eq!(code(&c.cmd("MAIL FROM:<a@remote.test>").await), "503");
    assert_eq!(code(&c.cmd("DATA").await), "503");
    assert_eq!(code(&c.cmd("RSET").await), "250");
    assert_eq!(code(&c.cmd("RCPT TO:<alice@local.test>").await), "503");
    assert_eq!(code(&c.cmd("NOOP").await), "250");
}

#[tokio::test]
async fn reports_unknown_and_malformed_commands() {
    let server = start(ReceiverConfig::default(), MemorySink::default()).await;
    let mut c = Conn::open(server.addr).await;

    assert_eq!(code(&c.cmd("FROBNICATE").await), "500");
    assert_eq!(code(&c.cmd("EHLO client.test").await), "250");
    assert_eq!(code(&c.cmd("MAIL FROM:not-an-address").await), "501");
    assert_eq!(code(&c.cmd("STARTTLS").await), "502");
}

#[tokio::test]
async fn refuses_unknown_recipients_and_limits_count() {
    let config = ReceiverConfig {
        max_recipients: 2,
        ..ReceiverConfig::default()
    };
    let server = start(config, MemorySink::default()).await;
    let mut c = Conn::open(server.addr).await;

    c.cmd("EHLO client.test").await;
    c.cmd("MAIL FROM:<>").await;
    assert_eq!(code(&c.cmd("RCPT TO:<bob@elsewhere.test>").await), "550");
    assert_eq!(code(&c.cmd("RCPT TO:<a@local.test>").await), "250");
    assert_eq!(code(&c.cmd("RCPT TO:<b@local.test>").await), "250");
    assert_eq!(code(&c.cmd("RCPT TO:<c@local.test>").await), "452");
}

#[tokio::test]
async fn rejects_oversized_messages() {
    let config = ReceiverConfig {
        max_message_bytes: 64,
        ..ReceiverConfig::default()
    };
    let server = start(config, MemorySink::default()).await;
    let mut c = Conn::open(server.addr).await;

    c.cmd("EHLO client.test").await;
    assert_eq!(code(&c.cmd("MAIL FROM:<a@remote.test> SIZE=1000").await), "552");
    assert_eq!(code(&c.cmd("MAIL FROM:<a@remote.test>").await), "250");
    c.cmd("RCPT TO:<alice@local.test>").await;
    assert_eq!(code(&c.cmd("DATA").await), "354");
    for _ in 0..10 {
        c.raw(b"0123456789abcdef\r\n").await;
    }
    assert_eq!(code(&c.cmd(".").await), "552");

    // The session stays usable after the rejection.
    assert_eq!(code(&c.cmd("NOOP").await), "250");
    assert!(server.sink.delivered.lock().await.is_empty());
}

#[tokio::test]
async fn keeps_body_lines_longer_than_the_text_limit() {
    let server = start(ReceiverConfig::default(), MemorySink::default()).await;
    let mut c = Conn::open(server.addr).await;
    let long = "A".repeat(1500);

    c.cmd("EHLO client.test").await;
    c.cmd("MAIL FROM:<a@remote.test>").await;
    c.cmd("RCPT TO:<alice@local.test>").await;
    assert_eq!(code(&c.cmd("DATA").await), "354");
    c.raw(format!("before\r\n{long}\r\nafter\r\n").as_bytes()).await;
    assert_eq!(code(&c.cmd(".").await), "250");

    let delivered = server.sink.delivered.lock().await;
    assert_eq!(
        delivered[0].data,
        format!("before\r\n{long}\r\nafter\r\n").into_bytes()
    );
}

#[tokio::test]
async fn long_body_line_past_the_size_limit_is_refused() {
    let config = ReceiverConfig {
        max_message_bytes: 1024,
        ..ReceiverConfig::default()
    };
    let server = start(config, MemorySink::default()).await;
    let mut c = Conn::open(server.addr).await;

    c.cmd("EHLO client.test").await;
    c.cmd("MAIL FROM:<a@remote.test>").await;
    c.cmd("RCPT TO:<alice@local.test>").await;
    assert_eq!(code(&c.cmd("DATA").await), "354");
    c.raw(format!("{}\r\nafter\r\n", "B".repeat(4000)).as_bytes()).await;
    assert_eq!(code(&c.cmd(".").await), "552");
    assert_eq!(code(&c.cmd("NOOP").await), "250");
    assert!(server.sink.delivered.lock().await.is_empty());
}

#[tokio::test]
async fn rejects_overlong_command_lines() {
    let server = start(ReceiverConfig::default(), MemorySink::default()).await;
    let mut c = Conn::open(server.addr).await;

    let padded = format!("EHLO {}", "h".repeat(600));
    let reply = c.cmd(&padded).await;
    assert_eq!(code(&reply), "500");
    assert!(reply.contains("Line too long"), "{reply}");

    // The rest of the line was discarded, not read as a second command.
    assert_eq!(code(&c.cmd("EHLO client.test").await), "250");
    assert_eq!(code(&c.cmd("MAIL FROM:<a@remote.test>").await), "250");
}

#[tokio::test]
async fn sink_failures_map_to_reply_codes() {
    let sink = MemorySink {
        fail_with: Some(DeliveryError::Transient("database busy".into())),
        ..MemorySink::default()
    };
    let server = start(ReceiverConfig::default(), sink).await;
    let mut c = Conn::open(server.addr).await;

    c.cmd("EHLO client.test").await;
    c.cmd("MAIL FROM:<a@remote.test>").await;
    c.cmd("RCPT TO:<alice@local.test>").await;
    c.cmd("DATA").await;
    c.raw(b"Subject: x\r\n\r\nbody\r\n").await;
    assert_eq!(code(&c.cmd(".").await), "451");

    let sink = MemorySink {
        fail_with: Some(DeliveryError::Permanent("mailbox full".into())),
        ..MemorySink::default()
    };
    let server = start(ReceiverConfig::default(), sink).await;
    let mut c = Conn::open(server.addr).await;

    c.cmd("EHLO client.test").await;
    c.cmd("MAIL FROM:<a@remote.test>").await;
    c.cmd("RCPT TO:<alice@local.test>").await;
    c.cmd("DATA").await;
    c.raw(b"Subject: x\r\n\r\nbody\r\n").await;
    assert_eq!(code(&c.cmd(".").await), "554");
}

#[tokio::test]
async fn transport_delivers_to_receiver() {
    let server = start(ReceiverConfig::default(), MemorySink::default()).await;

    let mut config = TransportConfig::new("127.0.0.1", Security::None);
    config.port = server.addr.port();
    config.timeout = Duration::from_secs(5);
    let transport = SmtpTransport::new(config);

    let envelope = Envelope::new(
        Address::new("sender@remote.test").unwrap(),
        vec![
            Address::new("alice@local.test").unwrap(),
            Address::new("nobody@elsewhere.test").unwrap(),
        ],
    );
    let report = transport
        .deliver(&envelope, b"Subject: hello\r\n\r\n.dot line\r\n")
        .await
        .unwrap();

    assert_eq!(report.accepted().count(), 1);
    assert!(matches!(
        report.outcome(&Address::new("nobody@elsewhere.test").unwrap()),
        Some(RecipientOutcome::Rejected { code: 550, .. })
    ));

    let delivered = server.sink.delivered.lock().await;
    assert_eq!(delivered.len(), 1);
    let body = String::from_utf8_lossy(&delivered[0].data);
    assert!(body.contains("\r\n.dot line\r\n"));
    assert!(!body.contains(".."));
}

#[tokio::test]
async fn transport_skips_data_when_every_recipient_is_refused() {
    let server = start(ReceiverConfig::default(), MemorySink::default()).await;

    let mut config = TransportConfig::new("127.0.0.1", Security::None);
    config.port = server.addr.port();
    let transport = SmtpTransport::new(config);

    let envelope = Envelope::new(
        Address::new("sender@remote.test").unwrap(),
        vec![Address::new("nobody@elsewhere.test").unwrap()],
    );
    let report = transport.deliver(&envelope, b"Subject: x\r\n\r\n").await.unwrap();

    assert_eq!(report.accepted().count(), 0);
    assert!(report.queue_reply.is_none());
    assert!(server.sink.delivered.lock().await.is_empty());
}

#[tokio::test]
async fn serve_returns_after_shutdown() {
    let server = start(ReceiverConfig::default(), MemorySink::default()).await;
    server.shutdown.send(true).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), server.handle)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}
