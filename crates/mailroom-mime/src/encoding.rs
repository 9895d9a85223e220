//! Transfer and header encodings.
//!
//! Base64 and Quoted-Printable bodies (RFC 2045) and RFC 2047 encoded words
//! in header values.

use crate::error::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::fmt::Write as _;

/// Maximum encoded line length for bodies, CRLF excluded.
const MAX_LINE_LENGTH: usize = 76;

/// Longest UTF-8 chunk per encoded word; keeps each word under 75 chars.
const ENCODED_WORD_CHUNK: usize = 45;

/// Encodes data as a single line of Base64.
#[must_use]
pub fn encode_base64(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Encodes data as Base64 wrapped at 76 columns with CRLF line breaks.
#[must_use]
pub fn encode_base64_wrapped(data: &[u8]) -> String {
    let flat = STANDARD.encode(data);
    let mut out = String::with_capacity(flat.len() + flat.len() / MAX_LINE_LENGTH * 2 + 2);
    for (i, chunk) in flat.as_bytes().chunks(MAX_LINE_LENGTH).enumerate() {
        if i > 0 {
            out.push_str("\r\n");
        }
        // Base64 output is ASCII.
        out.push_str(&String::from_utf8_lossy(chunk));
    }
    out
}

/// Decodes Base64, ignoring embedded whitespace and line breaks.
///
/// # Errors
///
/// Returns an error if the input is not valid Base64.
pub fn decode_base64(data: &str) -> Result<Vec<u8>> {
    let cleaned: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    STANDARD.decode(cleaned).map_err(Into::into)
}

/// Encodes bytes as Quoted-Printable (RFC 2045 section 6.7).
///
/// Line breaks in the input (LF or CRLF) are kept as hard CRLF breaks;
/// whitespace before a break is encoded so transports cannot strip it.
#[must_use]
pub fn encode_quoted_printable(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3 / 2);
    let mut line_len = 0;
    let mut i = 0;

    while i < data.len() {
        let byte = data[i];

        if byte == b'\r' && data.get(i + 1) == Some(&b'\n') {
            i += 1;
            continue;
        }
        if byte == b'\n' {
            out.push_str("\r\n");
            line_len = 0;
            i += 1;
            continue;
        }

        let at_line_end = matches!(data.get(i + 1), None | Some(b'\r' | b'\n'));
        let literal = match byte {
            b'!'..=b'<' | b'>'..=b'~' => true,
            b' ' | b'\t' => !at_line_end,
            _ => false,
        };
        let width = if literal { 1 } else { 3 };

        // Leave room for the soft break "=".
        if line_len + width > MAX_LINE_LENGTH - 1 {
            out.push_str("=\r\n");
            line_len = 0;
        }

        if literal {
            out.push(char::from(byte));
        } else {
            let _ = write!(out, "={byte:02X}");
        }
        line_len += width;
        i += 1;
    }

    out
}

/// Decodes Quoted-Printable text into bytes.
///
/// Soft line breaks (`=` at end of line, optionally followed by trailing
/// whitespace) are removed.
///
/// # Errors
///
/// Returns an error for a malformed `=XX` escape.
pub fn decode_quoted_printable(text: &str) -> Result<Vec<u8>> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'=' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }

        // Soft line break, tolerating whitespace between '=' and the break.
        let mut j = i + 1;
        while j < bytes.len() && (bytes[j] == b' ' || bytes[j] == b'\t') {
            j += 1;
        }
        if j == bytes.len() {
            break;
        }
        if bytes[j] == b'\n' {
            i = j + 1;
            continue;
        }
        if bytes[j] == b'\r' && bytes.get(j + 1) == Some(&b'\n') {
            i = j + 2;
            continue;
        }

        let hex = bytes
            .get(i + 1..i + 3)
            .and_then(|h| std::str::from_utf8(h).ok())
            .and_then(|h| u8::from_str_radix(h, 16).ok())
            .ok_or_else(|| {
                Error::InvalidEncoding(format!("bad quoted-printable escape at byte {i}"))
            })?;
        out.push(hex);
        i += 3;
    }

    Ok(out)
}

/// Encodes a header value with RFC 2047 B encoded words when needed.
///
/// Printable ASCII values are returned unchanged. Longer values are split
/// on character boundaries into several encoded words.
#[must_use]
pub fn encode_rfc2047(text: &str) -> String {
    let needs_encoding = text
        .chars()
        .any(|c| !(c.is_ascii_graphic() || c == ' ' || c == '\t'))
        || text.contains("=?");
    if !needs_encoding {
        return text.to_string();
    }

    let mut words = Vec::new();
    let mut chunk = String::new();
    for c in text.chars() {
        if chunk.len() + c.len_utf8() > ENCODED_WORD_CHUNK {
            words.push(format!("=?utf-8?B?{}?=", encode_base64(chunk.as_bytes())));
            chunk.clear();
        }
        chunk.push(c);
    }
    if !chunk.is_empty() {
        words.push(format!("=?utf-8?B?{}?=", encode_base64(chunk.as_bytes())));
    }
    words.join(" ")
}

/// Decodes every RFC 2047 encoded word in a header value.
///
/// Whitespace between adjacent encoded words is dropped. Malformed words
/// and unknown charsets are left as they are or decoded lossily; this never
/// fails.
#[must_use]
pub fn decode_rfc2047(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    let mut pending_space = String::new();
    let mut last_was_word = false;

    while !rest.is_empty() {
        if let Some((decoded, len)) = decode_encoded_word(rest) {
            if !last_was_word {
                out.push_str(&pending_space);
            }
            pending_space.clear();
            out.push_str(&decoded);
            rest = &rest[len..];
            last_was_word = true;
            continue;
        }

        let Some(c) = rest.chars().next() else {
            break;
        };
        if c.is_whitespace() {
            pending_space.push(c);
        } else {
            out.push_str(&pending_space);
            pending_space.clear();
            out.push(c);
            last_was_word = false;
        }
        rest = &rest[c.len_utf8()..];
    }

    out.push_str(&pending_space);
    out
}

/// Decodes one encoded word at the start of `s`, returning the text and the
/// number of bytes consumed.
fn decode_encoded_word(s: &str) -> Option<(String, usize)> {
    let body = s.strip_prefix("=?")?;
    let (charset, body) = body.split_once('?')?;
    let (encoding, body) = body.split_once('?')?;
    let end = body.find("?=")?;
    let payload = &body[..end];
    if payload.contains(char::is_whitespace) || charset.is_empty() {
        return None;
    }

    let bytes = match encoding {
        "B" | "b" => decode_base64(payload).ok()?,
        "Q" | "q" => decode_quoted_printable(&payload.replace('_', " ")).ok()?,
        _ => return None,
    };

    // "=?" + charset + "?" + encoding + "?" + payload + "?="
    let consumed = 2 + charset.len() + 1 + encoding.len() + 1 + end + 2;
    Some((decode_charset(&bytes, charset), consumed))
}

/// Decodes bytes in `charset` to a string, lossily.
///
/// UTF-8, ASCII and the ISO-8859-1 family are understood; anything else is
/// treated as UTF-8.
#[must_use]
pub fn decode_charset(bytes: &[u8], charset: &str) -> String {
    // RFC 2231 allows a language suffix: utf-8*en
    let charset = charset.split('*').next().unwrap_or(charset);
    match charset.to_ascii_lowercase().as_str() {
        "iso-8859-1" | "latin1" | "iso8859-1" | "windows-1252" | "cp1252" => {
            bytes.iter().map(|&b| char::from(b)).collect()
        }
        _ => String::from_utf8_lossy(bytes).into_owned(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn base64_wraps_at_76_columns() {
        let encoded = encode_base64_wrapped(&[0u8; 200]);
        let lines: Vec<&str> = encoded.split("\r\n").collect();
        assert!(lines.len() > 1);
        assert!(lines.iter().all(|l| l.len() <= 76));
        assert_eq!(decode_base64(&encoded).unwrap(), vec![0u8; 200]);
    }

    #[test]
    fn qp_plain_ascii_is_unchanged() {
        assert_eq!(encode_quoted_printable(b"Hello, World!"), "Hello, World!");
    }

    #[test]
    fn qp_encodes_utf8_and_equals() {
        assert_eq!(encode_quoted_printable("é=1".as_bytes()), "=C3=A9=3D1");
    }

    #[test]
    fn qp_protects_trailing_whitespace() {
        assert_eq!(encode_quoted_printable(b"a \nb"), "a=20\r\nb");
    }

    #[test]
    fn qp_soft_breaks_long_lines() {
        let encoded = encode_quoted_printable(&[b'x'; 200]);
        assert!(encoded.split("\r\n").all(|l| l.len() <= 76));
        assert_eq!(decode_quoted_printable(&encoded).unwrap(), vec![b'x'; 200]);
    }

    #[test]
    fn qp_decode_handles_soft_breaks() {
        assert_eq!(decode_quoted_printable("Hello=\r\nWorld").unwrap(), b"HelloWorld");
        assert_eq!(decode_quoted_printable("Hello= \nWorld").unwrap(), b"HelloWorld");
    }

    #[test]
    fn qp_decode_rejects_bad_escape() {
        assert!(decode_quoted_printable("=ZZ").is_err());
    }

    #[test]
    fn rfc2047_leaves_ascii_alone() {
        assert_eq!(encode_rfc2047("Weekly report"), "Weekly report");
    }

    #[test]
    fn rfc2047_splits_long_values() {
        let subject = "é".repeat(60);
        let encoded = encode_rfc2047(&subject);
        assert!(encoded.split(' ').count() > 1);
        assert!(encoded.split(' ').all(|w| w.len() <= 75));
        assert_eq!(decode_rfc2047(&encoded), subject);
    }

    #[test]
    fn rfc2047_decodes_mixed_text() {
        assert_eq!(
            decode_rfc2047("Re: =?utf-8?B?SMOpbGxv?= there"),
            "Re: Héllo there"
        );
        assert_eq!(
            decode_rfc2047("=?ISO-8859-1?Q?Caf=E9_cr=E8me?="),
            "Café crème"
        );
    }

    #[test]
    fn rfc2047_drops_space_between_words() {
        assert_eq!(
            decode_rfc2047("=?utf-8?Q?a?= =?utf-8?Q?b?="),
            "ab"
        );
    }

    #[test]
    fn rfc2047_keeps_malformed_words() {
        assert_eq!(decode_rfc2047("=?utf-8?X?abc?="), "=?utf-8?X?abc?=");
    }

    proptest! {
        #[test]
        fn qp_roundtrips_arbitrary_bytes(data in proptest::collection::vec(any::<u8>(), 0..512)) {
            // Bare CR and CRLF are normalised, so compare without them.
            let input: Vec<u8> = data.into_iter().filter(|b| *b != b'\r' && *b != b'\n').collect();
            let decoded = decode_quoted_printable(&encode_quoted_printable(&input)).unwrap();
            prop_assert_eq!(decoded, input);
        }

        #[test]
        fn qp_lines_stay_short(data in proptest::collection::vec(any::<u8>(), 0..512)) {
            let encoded = encode_quoted_printable(&data);
            prop_assert!(encoded.split("\r\n").all(|l| l.len() <= 76));
        }

        #[test]
        fn rfc2047_roundtrips_text(s in "\\PC{0,80}") {
            prop_assert_eq!(decode_rfc2047(&encode_rfc2047(&s)), s);
        }
    }
}
