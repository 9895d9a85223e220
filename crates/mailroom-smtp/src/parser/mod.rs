//! SMTP reply parser.

use crate::error::{Error, Result};
use crate::types::{Reply, ReplyCode};

/// Parses an SMTP reply from its response lines (CRLF already stripped).
///
/// - Single: `250 OK`
/// - Multi: `250-First`, `250-Second`, `250 Last`
///
/// Every line of a multi-line reply must carry the same code.
///
/// # Errors
///
/// Returns an error if the reply is empty, a code is not three digits, or the
/// lines disagree on the code.
pub fn parse_reply(lines: &[String]) -> Result<Reply> {
    let first = lines
        .first()
        .ok_or_else(|| Error::Protocol("Empty reply".into()))?;
    let code = reply_code(first)?;

    let mut text = Vec::with_capacity(lines.len());
    for line in lines {
        if reply_code(line)? != code {
            return Err(Error::Protocol(format!(
                "Mixed reply codes in multi-line reply: {line}"
            )));
        }
        text.push(line.get(4..).unwrap_or("").to_string());
    }

    Ok(Reply::new(ReplyCode::new(code), text))
}

/// Checks if a line is the last line of a reply.
///
/// Continuation lines have `-` after the code; the last line has a space or
/// nothing at all.
#[must_use]
pub fn is_last_reply_line(line: &str) -> bool {
    match line.as_bytes().get(3) {
        None => line.len() == 3,
        Some(b) => *b == b' ',
    }
}

fn reply_code(line: &str) -> Result<u16> {
    let digits = line
        .get(..3)
        .ok_or_else(|| Error::Protocol(format!("Reply too short: {line:?}")))?;
    if !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::Protocol(format!("Invalid reply code: {digits:?}")));
    }
    if let Some(sep) = line.as_bytes().get(3) {
        if *sep != b' ' && *sep != b'-' {
            return Err(Error::Protocol(format!("Malformed reply line: {line:?}")));
        }
    }
    digits
        .parse()
        .map_err(|_| Error::Protocol(format!("Invalid reply code: {digits:?}")))
}
