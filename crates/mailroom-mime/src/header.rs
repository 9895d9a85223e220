//! Message header handling.

use crate::encoding::decode_rfc2047;
use std::fmt;

/// Ordered collection of message headers.
///
/// Lookups ignore case; insertion order and the original name spelling are
/// kept for output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Creates a new empty header collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a header value.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Sets a header value, replacing any existing values in place.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .entries
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(&name))
        {
            Some(first) => {
                self.entries[first].1 = value;
                let mut index = 0;
                self.entries.retain(|(n, _)| {
                    let keep = index <= first || !n.eq_ignore_ascii_case(&name);
                    index += 1;
                    keep
                });
            }
            None => self.entries.push((name, value)),
        }
    }

    /// Gets the first raw value for a header.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Gets the first value with RFC 2047 encoded words decoded.
    #[must_use]
    pub fn get_decoded(&self, name: &str) -> Option<String> {
        self.get(name).map(decode_rfc2047)
    }

    /// Gets all raw values for a header, in order.
    #[must_use]
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Returns true if the header is present.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Removes all values for a header.
    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// Number of header lines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no headers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over `(name, value)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Parses a header block.
    ///
    /// Accepts CRLF or LF line endings and unfolds continuation lines.
    /// Parsing stops at the first empty line. Lines without a colon are
    /// skipped.
    #[must_use]
    pub fn parse(text: &str) -> Self {
        let mut headers = Self::new();
        let mut current: Option<(String, String)> = None;

        for line in text.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.is_empty() {
                break;
            }

            if line.starts_with([' ', '\t']) {
                if let Some((_, value)) = current.as_mut() {
                    value.push(' ');
                    value.push_str(line.trim());
                }
                continue;
            }

            if let Some((name, value)) = current.take() {
                headers.add(name, value.trim().to_string());
            }
            if let Some((name, value)) = line.split_once(':') {
                let name = name.trim();
                if !name.is_empty() && !name.contains(char::is_whitespace) {
                    current = Some((name.to_string(), value.trim().to_string()));
                }
            }
        }

        if let Some((name, value)) = current {
            headers.add(name, value.trim().to_string());
        }

        headers
    }
}

impl fmt::Display for Headers {
    /// Writes `Name: value` lines terminated by CRLF, folding long values at
    /// whitespace.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.entries {
            write!(f, "{name}:")?;
            let mut line_len = name.len() + 1;
            for (i, word) in value.split(' ').enumerate() {
                if i > 0 && line_len + 1 + word.len() > 78 {
                    f.write_str("\r\n")?;
                    line_len = 0;
                }
                write!(f, " {word}")?;
                line_len += 1 + word.len();
            }
            f.write_str("\r\n")?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn lookup_ignores_case_and_keeps_spelling() {
        let mut headers = Headers::new();
        headers.add("Content-Type", "text/plain");
        assert_eq!(headers.get("content-type"), Some("text/plain"));
        assert_eq!(headers.iter().next(), Some(("Content-Type", "text/plain")));
    }

    #[test]
    fn set_replaces_in_place() {
        let mut headers = Headers::new();
        headers.add("To", "a@example.com");
        headers.add("Subject", "x");
        headers.add("to", "b@example.com");
        headers.set("TO", "c@example.com");

        let names: Vec<_> = headers.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["To", "Subject"]);
        assert_eq!(headers.get_all("to"), vec!["c@example.com"]);
    }

    #[test]
    fn remove_drops_every_value() {
        let mut headers = Headers::new();
        headers.add("Received", "a");
        headers.add("Received", "b");
        headers.remove("received");
        assert!(headers.is_empty());
    }

    #[test]
    fn parse_unfolds_and_stops_at_blank_line() {
        let text = concat!(
            "From: sender@example.com\r\n",
            "Subject: Quarterly\r\n",
            "\tnumbers\r\n",
            "Received: one\n",
            "Received: two\n",
            "\r\n",
            "Body: not a header\r\n",
        );
        let headers = Headers::parse(text);
        assert_eq!(headers.get("subject"), Some("Quarterly numbers"));
        assert_eq!(headers.get_all("received"), vec!["one", "two"]);
        assert!(headers.get("body").is_none());
    }

    #[test]
    fn decoded_value() {
        let mut headers = Headers::new();
        headers.add("Subject", "=?utf-8?B?SMOpbGxv?=");
        assert_eq!(headers.get_decoded("subject").unwrap(), "Héllo");
    }

    #[test]
    fn display_folds_long_values() {
        let mut headers = Headers::new();
        headers.add("References", vec!["<abcdefghij@example.com>"; 6].join(" "));
        let rendered = headers.to_string();
        assert!(rendered.lines().count() > 1);
        assert!(rendered.lines().all(|l| l.trim_end().len() <= 78));
        let reparsed = Headers::parse(&rendered);
        assert_eq!(reparsed.get("references"), headers.get("references"));
    }
}
