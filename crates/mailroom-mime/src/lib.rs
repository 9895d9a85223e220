//! # mailroom-mime
//!
//! RFC 5322 / MIME message building and parsing.
//!
//! ## Features
//!
//! - **Message building**: text, text + HTML (`multipart/alternative`) and
//!   attachments (`multipart/mixed`), threading headers, Bcc kept off the
//!   wire
//! - **Message parsing**: recursive multipart walking, transfer decoding,
//!   charset-tolerant text, attachments with Content-ID
//! - **Encoding/Decoding**: Base64, Quoted-Printable, RFC 2047 encoded words,
//!   RFC 2231 parameters
//! - **Addresses**: mailbox and address-list parsing
//!
//! ## Quick Start
//!
//! ```ignore
//! use mailroom_mime::{Mailbox, MessageBuilder, ParsedMessage};
//!
//! let built = MessageBuilder::new()
//!     .from(Mailbox::parse("Ada <ada@example.com>")?)
//!     .to(Mailbox::parse("bob@example.org")?)
//!     .subject("Hello")
//!     .text_body("Plain text version")
//!     .html_body("<p>HTML version</p>")
//!     .build()?;
//!
//! let parsed = ParsedMessage::parse(&built.bytes)?;
//! assert_eq!(parsed.subject(), "Hello");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

mod address;
mod builder;
mod content_type;
mod error;
mod header;
mod parser;

pub mod encoding;

pub use address::{Mailbox, format_list};
pub use builder::{Attachment, BuiltMessage, MessageBuilder, new_message_id};
pub use content_type::{ContentDisposition, ContentType};
pub use error::{Error, Result};
pub use header::Headers;
pub use parser::{ParsedAttachment, ParsedMessage, TransferEncoding};
