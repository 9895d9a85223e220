//! Line-oriented transport under the client: plain TCP or TLS.

use crate::error::{Error, Result};
use rustls::pki_types::ServerName;
use std::sync::{Arc, OnceLock};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};

/// Longest reply line accepted from a server.
const MAX_LINE_LENGTH: usize = 4096;

/// A connection to an SMTP server.
#[derive(Debug)]
pub enum SmtpStream {
    /// Cleartext, possibly before STARTTLS.
    Plain(BufReader<TcpStream>),
    /// Encrypted, from the start or after STARTTLS.
    Secure(Box<BufReader<TlsStream<TcpStream>>>),
}

impl SmtpStream {
    fn reader(&mut self) -> &mut (dyn AsyncBufRead + Unpin + Send) {
        match self {
            Self::Plain(r) => r,
            Self::Secure(r) => r.as_mut(),
        }
    }

    fn writer(&mut self) -> &mut (dyn AsyncWrite + Unpin + Send) {
        match self {
            Self::Plain(r) => r.get_mut(),
            Self::Secure(r) => r.get_mut(),
        }
    }

    /// Reads one line without its CRLF.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionClosed`] at end of stream and
    /// [`Error::Protocol`] for a line longer than 4096 bytes.
    pub async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        if self.reader().read_line(&mut line).await? == 0 {
            return Err(Error::ConnectionClosed);
        }
        if line.len() > MAX_LINE_LENGTH {
            return Err(Error::Protocol(format!(
                "reply line longer than {MAX_LINE_LENGTH} bytes"
            )));
        }
        line.truncate(line.trim_end_matches(['\r', '\n']).len());
        Ok(line)
    }

    /// Writes and flushes `data`.
    ///
    /// # Errors
    ///
    /// Returns the I/O error of a failed write.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let writer = self.writer();
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Whether the connection is encrypted.
    #[must_use]
    pub const fn is_tls(&self) -> bool {
        matches!(self, Self::Secure(_))
    }

    /// Runs the TLS handshake on a cleartext connection (after STARTTLS).
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is already encrypted or the
    /// handshake fails.
    pub async fn upgrade_to_tls(self, hostname: &str) -> Result<Self> {
        let Self::Plain(reader) = self else {
            return Err(Error::Protocol("connection is already encrypted".into()));
        };
        secure(hostname, reader.into_inner()).await
    }
}

/// Opens a cleartext connection.
///
/// # Errors
///
/// Returns the I/O error of a failed connect.
pub async fn connect(hostname: &str, port: u16) -> Result<SmtpStream> {
    let tcp = TcpStream::connect((hostname, port)).await?;
    Ok(SmtpStream::Plain(BufReader::new(tcp)))
}

/// Opens an implicit-TLS connection (submissions, port 465).
///
/// # Errors
///
/// Returns an error if the connect or the handshake fails.
pub async fn connect_tls(hostname: &str, port: u16) -> Result<SmtpStream> {
    let tcp = TcpStream::connect((hostname, port)).await?;
    secure(hostname, tcp).await
}

async fn secure(hostname: &str, tcp: TcpStream) -> Result<SmtpStream> {
    let name = ServerName::try_from(hostname.to_string())
        .map_err(|_| Error::Protocol(format!("{hostname:?} is not a valid TLS server name")))?;
    let tls = TlsConnector::from(client_config()).connect(name, tcp).await?;
    Ok(SmtpStream::Secure(Box::new(BufReader::new(tls))))
}

/// Client settings trusting the webpki roots, built once per process.
fn client_config() -> Arc<ClientConfig> {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
    Arc::clone(CONFIG.get_or_init(|| {
        let roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        Arc::new(
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth(),
        )
    }))
}
