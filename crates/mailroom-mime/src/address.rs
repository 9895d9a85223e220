//! Mailboxes and address lists (RFC 5322 section 3.4).

use crate::encoding::{decode_rfc2047, encode_rfc2047};
use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// A display name and an address, as in `"Ada" <ada@example.com>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Mailbox {
    /// Display name, decoded.
    pub name: Option<String>,
    /// `local@domain`.
    pub address: String,
}

impl Mailbox {
    /// Creates a mailbox after checking the address shape.
    ///
    /// # Errors
    ///
    /// Returns an error if the address has no local part or domain.
    pub fn new(name: Option<String>, address: impl Into<String>) -> Result<Self> {
        let address = address.into().trim().to_string();
        validate(&address)?;
        Ok(Self {
            name: name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()),
            address,
        })
    }

    /// Creates a mailbox without a display name.
    ///
    /// # Errors
    ///
    /// Returns an error if the address has no local part or domain.
    pub fn bare(address: impl Into<String>) -> Result<Self> {
        Self::new(None, address)
    }

    /// Domain part of the address, lowercase.
    #[must_use]
    pub fn domain(&self) -> String {
        self.address
            .rsplit_once('@')
            .map(|(_, d)| d.to_ascii_lowercase())
            .unwrap_or_default()
    }

    /// Parses one mailbox: `addr`, `<addr>`, `Name <addr>` or
    /// `"Quoted, Name" <addr>`.
    ///
    /// # Errors
    ///
    /// Returns an error if no valid address is found.
    pub fn parse(s: &str) -> Result<Self> {
        let s = strip_comments(s.trim());
        let s = s.trim();

        if let Some(open) = find_unquoted(s, '<') {
            let close = s[open..]
                .find('>')
                .map(|i| open + i)
                .ok_or_else(|| Error::InvalidAddress(s.to_string()))?;
            let address = &s[open + 1..close];
            let name = unquote_phrase(s[..open].trim());
            return Self::new((!name.is_empty()).then_some(name), address);
        }

        Self::bare(s)
    }

    /// Parses a comma-separated list. Empty entries and group syntax
    /// (`undisclosed-recipients:;`) are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if any entry is not a valid mailbox.
    pub fn parse_list(s: &str) -> Result<Vec<Self>> {
        list_items(s).map(Self::parse).collect()
    }

    /// Parses a comma-separated list, dropping entries that do not parse.
    #[must_use]
    pub fn parse_list_lenient(s: &str) -> Vec<Self> {
        list_items(s).filter_map(|item| Self::parse(item).ok()).collect()
    }

    /// Formats the mailbox for a header, RFC 2047 encoding a non-ASCII name.
    #[must_use]
    pub fn to_header(&self) -> String {
        match &self.name {
            Some(name) if !name.is_ascii() => {
                format!("{} <{}>", encode_rfc2047(name), self.address)
            }
            Some(name) => format!("{} <{}>", quote_phrase(name), self.address),
            None => self.address.clone(),
        }
    }
}

impl fmt::Display for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} <{}>", quote_phrase(name), self.address),
            None => f.write_str(&self.address),
        }
    }
}

impl FromStr for Mailbox {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Formats a list of mailboxes for a header.
#[must_use]
pub fn format_list(mailboxes: &[Mailbox]) -> String {
    mailboxes
        .iter()
        .map(Mailbox::to_header)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Non-empty list entries with group labels and terminators removed.
fn list_items(s: &str) -> impl Iterator<Item = &str> {
    split_unquoted(s, ',').into_iter().filter_map(|item| {
        let mut item = item.trim();
        // "Group: a@b, c@d;" lists its members as plain entries.
        if let Some(colon) = find_unquoted(item, ':') {
            if find_unquoted(item, '<').is_none_or(|lt| colon < lt) {
                item = item[colon + 1..].trim();
            }
        }
        let item = item.trim_end_matches(';').trim();
        (!item.is_empty()).then_some(item)
    })
}

fn validate(address: &str) -> Result<()> {
    let (local, domain) = address
        .rsplit_once('@')
        .ok_or_else(|| Error::InvalidAddress(address.to_string()))?;
    let bad = local.is_empty()
        || domain.is_empty()
        || domain.starts_with('.')
        || domain.ends_with('.')
        || address
            .chars()
            .any(|c| c.is_whitespace() || c.is_control() || c == '<' || c == '>' || c == ',');
    if bad {
        return Err(Error::InvalidAddress(address.to_string()));
    }
    Ok(())
}

fn quote_phrase(name: &str) -> String {
    if name
        .chars()
        .all(|c| c.is_alphanumeric() || c == ' ' || "!#$%&'*+-/=?^_`{|}~".contains(c))
    {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('\\', "\\\\").replace('"', "\\\""))
    }
}

fn unquote_phrase(phrase: &str) -> String {
    let inner = phrase
        .strip_prefix('"')
        .and_then(|p| p.strip_suffix('"'))
        .map_or_else(|| phrase.to_string(), |p| p.replace("\\\"", "\"").replace("\\\\", "\\"));
    decode_rfc2047(inner.trim())
}

fn find_unquoted(s: &str, needle: char) -> Option<usize> {
    let mut in_quotes = false;
    let mut escaped = false;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            c if c == needle && !in_quotes => return Some(i),
            _ => {}
        }
    }
    None
}

fn split_unquoted(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut in_angle = false;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => in_angle = true,
            '>' if !in_quotes => in_angle = false,
            c if c == sep && !in_quotes && !in_angle => {
                parts.push(&s[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

/// Removes `(comments)` outside quotes.
fn strip_comments(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut depth = 0u32;
    let mut in_quotes = false;
    for c in s.chars() {
        match c {
            '"' if depth == 0 => {
                in_quotes = !in_quotes;
                out.push(c);
            }
            '(' if !in_quotes => depth += 1,
            ')' if !in_quotes && depth > 0 => depth -= 1,
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_forms() {
        let m = Mailbox::parse("ada@example.com").unwrap();
        assert_eq!(m.name, None);
        assert_eq!(m.address, "ada@example.com");

        let m = Mailbox::parse("Ada Lovelace <ada@example.com>").unwrap();
        assert_eq!(m.name.as_deref(), Some("Ada Lovelace"));

        let m = Mailbox::parse("\"Lovelace, Ada\" <ada@example.com>").unwrap();
        assert_eq!(m.name.as_deref(), Some("Lovelace, Ada"));

        let m = Mailbox::parse("<ada@example.com>").unwrap();
        assert_eq!(m.name, None);
    }

    #[test]
    fn parses_encoded_names_and_comments() {
        let m = Mailbox::parse("=?utf-8?B?SMOpbMOobmU=?= <h@example.com>").unwrap();
        assert_eq!(m.name.as_deref(), Some("Hélène"));

        let m = Mailbox::parse("ada@example.com (Ada)").unwrap();
        assert_eq!(m.address, "ada@example.com");
    }

    #[test]
    fn rejects_bad_addresses() {
        assert!(Mailbox::parse("no-at-sign").is_err());
        assert!(Mailbox::parse("Name <@example.com>").is_err());
        assert!(Mailbox::parse("Name <a@example.com").is_err());
        assert!(Mailbox::parse("a@.example.com").is_err());
    }

    #[test]
    fn parses_lists() {
        let list = Mailbox::parse_list(
            "\"Doe, Jane\" <jane@example.com>, bob@example.org,, Team: c@example.net;",
        )
        .unwrap();
        let addrs: Vec<_> = list.iter().map(|m| m.address.as_str()).collect();
        assert_eq!(addrs, vec!["jane@example.com", "bob@example.org", "c@example.net"]);
        assert!(Mailbox::parse_list("undisclosed-recipients:;").unwrap().is_empty());
    }

    #[test]
    fn header_form_quotes_and_encodes() {
        let m = Mailbox::new(Some("Doe, Jane".into()), "jane@example.com").unwrap();
        assert_eq!(m.to_header(), "\"Doe, Jane\" <jane@example.com>");

        let m = Mailbox::new(Some("Hélène".into()), "h@example.com").unwrap();
        assert!(m.to_header().starts_with("=?utf-8?B?"));
        assert_eq!(Mailbox::parse(&m.to_header()).unwrap(), m);
    }

    #[test]
    fn domain_is_lowercased() {
        let m = Mailbox::bare("Ada@Example.COM").unwrap();
        assert_eq!(m.domain(), "example.com");
    }
}
