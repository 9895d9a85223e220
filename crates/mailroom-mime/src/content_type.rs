//! MIME content type and disposition handling.

use crate::encoding::decode_charset;
use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;

/// MIME content type with parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentType {
    /// Main type (e.g., "text", "image", "multipart").
    pub main_type: String,
    /// Subtype (e.g., "plain", "html", "jpeg").
    pub sub_type: String,
    /// Parameters keyed by lowercase name (e.g., charset, boundary).
    pub parameters: BTreeMap<String, String>,
}

impl ContentType {
    /// Creates a new content type.
    #[must_use]
    pub fn new(main_type: impl Into<String>, sub_type: impl Into<String>) -> Self {
        Self {
            main_type: main_type.into().to_ascii_lowercase(),
            sub_type: sub_type.into().to_ascii_lowercase(),
            parameters: BTreeMap::new(),
        }
    }

    /// `text/plain; charset=utf-8`.
    #[must_use]
    pub fn text_plain() -> Self {
        Self::new("text", "plain").with_parameter("charset", "utf-8")
    }

    /// `text/html; charset=utf-8`.
    #[must_use]
    pub fn text_html() -> Self {
        Self::new("text", "html").with_parameter("charset", "utf-8")
    }

    /// `application/octet-stream`.
    #[must_use]
    pub fn octet_stream() -> Self {
        Self::new("application", "octet-stream")
    }

    /// `multipart/<subtype>` with a boundary.
    #[must_use]
    pub fn multipart(sub_type: &str, boundary: impl Into<String>) -> Self {
        Self::new("multipart", sub_type).with_parameter("boundary", boundary)
    }

    /// Adds a parameter.
    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters
            .insert(key.into().to_ascii_lowercase(), value.into());
        self
    }

    /// Returns a parameter by name.
    #[must_use]
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Returns the charset parameter if present.
    #[must_use]
    pub fn charset(&self) -> Option<&str> {
        self.parameter("charset")
    }

    /// Returns the boundary parameter if present.
    #[must_use]
    pub fn boundary(&self) -> Option<&str> {
        self.parameter("boundary")
    }

    /// `type/subtype` without parameters.
    #[must_use]
    pub fn essence(&self) -> String {
        format!("{}/{}", self.main_type, self.sub_type)
    }

    /// Checks if this is a multipart content type.
    #[must_use]
    pub fn is_multipart(&self) -> bool {
        self.main_type == "multipart"
    }

    /// Checks if this is a text content type.
    #[must_use]
    pub fn is_text(&self) -> bool {
        self.main_type == "text"
    }

    /// Checks the type and subtype, ignoring case.
    #[must_use]
    pub fn is(&self, main_type: &str, sub_type: &str) -> bool {
        self.main_type.eq_ignore_ascii_case(main_type) && self.sub_type.eq_ignore_ascii_case(sub_type)
    }

    /// Parses `type/subtype; param=value; param="quoted; value"`.
    ///
    /// # Errors
    ///
    /// Returns an error if the type or subtype is missing.
    pub fn parse(s: &str) -> Result<Self> {
        let mut segments = split_params(s).into_iter();
        let type_str = segments.next().unwrap_or_default();

        let (main_type, sub_type) = type_str
            .trim()
            .split_once('/')
            .ok_or_else(|| Error::InvalidContentType(s.to_string()))?;
        let (main_type, sub_type) = (main_type.trim(), sub_type.trim());
        if main_type.is_empty() || sub_type.is_empty() {
            return Err(Error::InvalidContentType(s.to_string()));
        }

        let mut content_type = Self::new(main_type, sub_type);
        content_type.parameters = parse_params(segments);
        Ok(content_type)
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.main_type, self.sub_type)?;
        write_params(f, &self.parameters)
    }
}

/// `Content-Disposition` header value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDisposition {
    /// `inline`, `attachment` or another token, lowercase.
    pub kind: String,
    /// Parameters keyed by lowercase name.
    pub parameters: BTreeMap<String, String>,
}

impl ContentDisposition {
    /// `attachment; filename="..."`.
    #[must_use]
    pub fn attachment(filename: &str) -> Self {
        let mut parameters = BTreeMap::new();
        parameters.insert("filename".to_string(), filename.to_string());
        Self {
            kind: "attachment".to_string(),
            parameters,
        }
    }

    /// `inline`, with an optional filename.
    #[must_use]
    pub fn inline(filename: Option<&str>) -> Self {
        let mut parameters = BTreeMap::new();
        if let Some(name) = filename {
            parameters.insert("filename".to_string(), name.to_string());
        }
        Self {
            kind: "inline".to_string(),
            parameters,
        }
    }

    /// Parses a disposition value. Never fails; an empty kind is `inline`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        let mut segments = split_params(s).into_iter();
        let kind = segments
            .next()
            .map(|k| k.trim().to_ascii_lowercase())
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| "inline".to_string());
        Self {
            kind,
            parameters: parse_params(segments),
        }
    }

    /// True for `attachment`.
    #[must_use]
    pub fn is_attachment(&self) -> bool {
        self.kind == "attachment"
    }

    /// The filename parameter.
    #[must_use]
    pub fn filename(&self) -> Option<&str> {
        self.parameters.get("filename").map(String::as_str)
    }
}

impl fmt::Display for ContentDisposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.kind)?;
        write_params(f, &self.parameters)
    }
}

fn write_params(f: &mut fmt::Formatter<'_>, params: &BTreeMap<String, String>) -> fmt::Result {
    for (key, value) in params {
        if !value.is_ascii() {
            // RFC 2231 extended value.
            write!(f, "; {key}*=utf-8''{}", percent_encode(value))?;
        } else if value.is_empty()
            || value.contains(|c: char| c.is_whitespace() || "()<>@,;:\\\"/[]?=".contains(c))
        {
            let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
            write!(f, "; {key}=\"{escaped}\"")?;
        } else {
            write!(f, "; {key}={value}")?;
        }
    }
    Ok(())
}

/// Splits on `;` outside double quotes.
fn split_params(s: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;

    for c in s.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => {
                current.push(c);
                escaped = true;
            }
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ';' if !in_quotes => segments.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    segments.push(current);
    segments
}

fn parse_params(segments: impl Iterator<Item = String>) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    let mut continuations: BTreeMap<String, Vec<(u32, String)>> = BTreeMap::new();

    for segment in segments {
        let Some((key, value)) = segment.trim().split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = unquote(value.trim());

        // name*=charset'lang'percent-encoded (RFC 2231)
        if let Some(name) = key.strip_suffix('*') {
            if let Some((base, Ok(index))) = name
                .split_once('*')
                .map(|(base, index)| (base, index.parse::<u32>()))
            {
                continuations
                    .entry(base.to_string())
                    .or_default()
                    .push((index, decode_extended(&value, index == 0)));
            } else {
                params.insert(name.to_string(), decode_extended(&value, true));
            }
            continue;
        }

        // name*0=... continuation without charset
        if let Some((name, index)) = key.split_once('*') {
            if let Ok(index) = index.parse::<u32>() {
                continuations
                    .entry(name.to_string())
                    .or_default()
                    .push((index, value));
                continue;
            }
        }

        params.entry(key).or_insert(value);
    }

    for (name, mut pieces) in continuations {
        pieces.sort_by_key(|(i, _)| *i);
        let joined: String = pieces.into_iter().map(|(_, v)| v).collect();
        params.insert(name, joined);
    }

    params
}

fn unquote(value: &str) -> String {
    let Some(inner) = value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) else {
        return value.to_string();
    };
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Decodes an RFC 2231 extended value; only the first piece carries a charset.
fn decode_extended(value: &str, has_charset: bool) -> String {
    let (charset, encoded) = if has_charset {
        let mut parts = value.splitn(3, '\'');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(charset), Some(_lang), Some(rest)) => (charset, rest),
            _ => ("utf-8", value),
        }
    } else {
        ("utf-8", value)
    };

    let bytes = percent_decode(encoded);
    decode_charset(&bytes, if charset.is_empty() { "utf-8" } else { charset })
}

fn percent_decode(s: &str) -> Vec<u8> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let Some(b) = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
            {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

fn percent_encode(s: &str) -> String {
    use std::fmt::Write as _;
    let mut out = String::with_capacity(s.len() * 3);
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || b"!#$&+-.^_`|~".contains(&b) {
            out.push(char::from(b));
        } else {
            let _ = write!(out, "%{b:02X}");
        }
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parse_lowercases_type_and_keys() {
        let ct = ContentType::parse("Text/HTML; Charset=UTF-8").unwrap();
        assert!(ct.is("text", "html"));
        assert_eq!(ct.charset(), Some("UTF-8"));
    }

    #[test]
    fn parse_quoted_boundary_with_semicolon() {
        let ct = ContentType::parse("multipart/mixed; boundary=\"a;b=c\"; x=1").unwrap();
        assert!(ct.is_multipart());
        assert_eq!(ct.boundary(), Some("a;b=c"));
        assert_eq!(ct.parameter("x"), Some("1"));
    }

    #[test]
    fn parse_rejects_missing_subtype() {
        assert!(ContentType::parse("text").is_err());
        assert!(ContentType::parse("/plain").is_err());
    }

    #[test]
    fn display_quotes_special_values() {
        let ct = ContentType::multipart("alternative", "=_b1");
        assert_eq!(ct.to_string(), "multipart/alternative; boundary=\"=_b1\"");
    }

    #[test]
    fn display_is_deterministic() {
        let ct = ContentType::new("text", "plain")
            .with_parameter("format", "flowed")
            .with_parameter("charset", "utf-8");
        assert_eq!(ct.to_string(), "text/plain; charset=utf-8; format=flowed");
    }

    #[test]
    fn disposition_roundtrip_fields() {
        let d = ContentDisposition::parse("attachment; filename=\"q1 report.pdf\"");
        assert!(d.is_attachment());
        assert_eq!(d.filename(), Some("q1 report.pdf"));
        assert_eq!(
            ContentDisposition::attachment("q1 report.pdf").to_string(),
            "attachment; filename=\"q1 report.pdf\""
        );
    }

    #[test]
    fn rfc2231_extended_filename() {
        let d = ContentDisposition::parse("attachment; filename*=utf-8''r%C3%A9sum%C3%A9.pdf");
        assert_eq!(d.filename(), Some("résumé.pdf"));
        let rendered = ContentDisposition::attachment("résumé.pdf").to_string();
        assert_eq!(rendered, "attachment; filename*=utf-8''r%C3%A9sum%C3%A9.pdf");
    }

    #[test]
    fn rfc2231_continuations() {
        let d = ContentDisposition::parse(
            "attachment; filename*0=\"long\"; filename*1=\"name.txt\"",
        );
        assert_eq!(d.filename(), Some("longname.txt"));
    }
}
