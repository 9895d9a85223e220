//! Errors raised while building or reading messages.

/// Result of a MIME operation.
pub type Result<T> = std::result::Result<T, Error>;

/// What went wrong with a message, header or body part.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A `Content-Type` value that does not parse.
    #[error("malformed content type: {0}")]
    InvalidContentType(String),

    /// A body that does not match its transfer encoding.
    #[error("malformed transfer encoding: {0}")]
    InvalidEncoding(String),

    /// Bad base64 in a body or encoded word.
    #[error(transparent)]
    Base64Decode(#[from] base64::DecodeError),

    /// A mailbox or address list that does not parse.
    #[error("malformed address: {0}")]
    InvalidAddress(String),

    /// A header the operation needs is absent.
    #[error("missing {0} header")]
    MissingHeader(String),

    /// The input is not an RFC 5322 message.
    #[error("unparseable message: {0}")]
    Parse(String),
}
