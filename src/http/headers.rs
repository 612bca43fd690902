//! HTTP message headers
//!
//! An ordered name/value field set with case-insensitive lookups, multiple
//! values per name, and the derived framing properties the connection state
//! machine decides on: content length, chunked transfer, keep-alive.

use super::{Error, Result, Version, MAX_HEADERS};
use std::fmt;

/// Header field set of one logical message.
///
/// Cleared and repopulated per message; owned by the `Request` or `Reply`
/// that contains it.
#[derive(Debug, Clone, Default)]
pub struct MessageHeader {
    fields: Vec<(String, String)>,
}

impl MessageHeader {
    /// Create an empty header set
    pub fn new() -> Self {
        MessageHeader { fields: Vec::new() }
    }

    /// Add a field.
    ///
    /// A field with the same name (case-insensitive) adds another value
    /// rather than replacing. The set is capped at `MAX_HEADERS`; further
    /// fields are dropped.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        if self.fields.len() >= MAX_HEADERS {
            return;
        }
        self.fields.push((name.into(), value.into()));
    }

    /// Replace all values of a field with one value
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.add(name, value);
    }

    /// Get the first value for a field (case-insensitive)
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Get all values for a field (case-insensitive)
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Count how many times a field appears
    pub fn count(&self, name: &str) -> usize {
        self.fields
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .count()
    }

    /// Check if a field exists
    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Remove all instances of a field (case-insensitive)
    pub fn remove(&mut self, name: &str) -> usize {
        let initial_len = self.fields.len();
        self.fields.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        initial_len - self.fields.len()
    }

    /// Get the number of fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Check if there are no fields
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Clear all fields
    pub fn clear(&mut self) {
        self.fields.clear();
    }

    /// Iterate over all fields
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Parse one `name: value` field line
    pub fn parse_field(line: &str) -> Result<(String, String)> {
        if let Some(colon_pos) = line.find(':') {
            let name = line[..colon_pos].trim().to_string();
            let value = line[colon_pos + 1..].trim().to_string();

            if name.is_empty() {
                return Err(Error::InvalidMessage("empty header name".to_string()));
            }

            Ok((name, value))
        } else {
            Err(Error::InvalidMessage(format!("no colon in header: {}", line)))
        }
    }

    /// The declared content length, if any. A malformed value is a
    /// protocol error.
    pub fn content_length(&self) -> Result<Option<u64>> {
        match self.get("Content-Length") {
            None => Ok(None),
            Some(value) => value.trim().parse::<u64>().map(Some).map_err(|_| {
                Error::InvalidMessage(format!("invalid Content-Length: {}", value))
            }),
        }
    }

    /// Whether the body uses chunked transfer encoding
    pub fn is_chunked(&self) -> bool {
        self.get("Transfer-Encoding")
            .map(|v| v.eq_ignore_ascii_case("chunked"))
            .unwrap_or(false)
    }

    /// Whether the message requests connection reuse.
    ///
    /// HTTP/1.1 defaults to keep-alive unless `Connection: close`;
    /// HTTP/1.0 requires an explicit `Connection: keep-alive`.
    pub fn is_keep_alive(&self, version: Version) -> bool {
        match self.get("Connection") {
            Some(value) if value.eq_ignore_ascii_case("close") => false,
            Some(value) if value.eq_ignore_ascii_case("keep-alive") => true,
            _ => version == Version::Http11,
        }
    }
}

impl fmt::Display for MessageHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.fields {
            writeln!(f, "{}: {}", name, value)?;
        }
        Ok(())
    }
}

impl FromIterator<(String, String)> for MessageHeader {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut header = MessageHeader::new();
        for (name, value) in iter {
            header.add(name, value);
        }
        header
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_and_get() {
        let mut header = MessageHeader::new();
        header.add("Content-Type", "text/html");
        header.add("Content-Length", "42");

        assert_eq!(header.get("Content-Type"), Some("text/html"));
        assert_eq!(header.get("Content-Length"), Some("42"));
        assert_eq!(header.get("Missing"), None);
    }

    #[test]
    fn test_case_insensitive() {
        let mut header = MessageHeader::new();
        header.add("Content-Type", "text/html");

        assert_eq!(header.get("content-type"), Some("text/html"));
        assert_eq!(header.get("CONTENT-TYPE"), Some("text/html"));
    }

    #[test]
    fn test_multiple_values() {
        let mut header = MessageHeader::new();
        header.add("Set-Cookie", "a=1");
        header.add("Set-Cookie", "b=2");

        assert_eq!(header.get_all("Set-Cookie"), vec!["a=1", "b=2"]);
        assert_eq!(header.count("Set-Cookie"), 2);
        assert_eq!(header.get("Set-Cookie"), Some("a=1"));
    }

    #[test]
    fn test_set_replaces() {
        let mut header = MessageHeader::new();
        header.add("X-Custom", "first");
        header.add("X-Custom", "second");
        header.set("X-Custom", "only");

        assert_eq!(header.count("X-Custom"), 1);
        assert_eq!(header.get("X-Custom"), Some("only"));
    }

    #[test]
    fn test_remove() {
        let mut header = MessageHeader::new();
        header.add("X-Remove", "value1");
        header.add("X-Keep", "value2");
        header.add("X-Remove", "value3");

        assert_eq!(header.remove("x-remove"), 2);
        assert_eq!(header.get("X-Remove"), None);
        assert_eq!(header.get("X-Keep"), Some("value2"));
    }

    #[test]
    fn test_parse_field() {
        let (name, value) = MessageHeader::parse_field("Content-Type: text/html").unwrap();
        assert_eq!(name, "Content-Type");
        assert_eq!(value, "text/html");

        let (name, value) = MessageHeader::parse_field("X-Custom:  value  ").unwrap();
        assert_eq!(name, "X-Custom");
        assert_eq!(value, "value");

        assert!(MessageHeader::parse_field("Invalid").is_err());
        assert!(MessageHeader::parse_field(": value").is_err());
    }

    #[test]
    fn test_content_length() {
        let mut header = MessageHeader::new();
        assert_eq!(header.content_length().unwrap(), None);

        header.add("Content-Length", "123");
        assert_eq!(header.content_length().unwrap(), Some(123));

        let mut bad = MessageHeader::new();
        bad.add("Content-Length", "abc");
        assert!(bad.content_length().is_err());
    }

    #[test]
    fn test_is_chunked() {
        let mut header = MessageHeader::new();
        assert!(!header.is_chunked());
        header.add("Transfer-Encoding", "Chunked");
        assert!(header.is_chunked());
    }

    #[test]
    fn test_keep_alive_defaults() {
        let header = MessageHeader::new();
        assert!(header.is_keep_alive(Version::Http11));
        assert!(!header.is_keep_alive(Version::Http10));

        let mut close = MessageHeader::new();
        close.add("Connection", "close");
        assert!(!close.is_keep_alive(Version::Http11));

        let mut keep = MessageHeader::new();
        keep.add("Connection", "Keep-Alive");
        assert!(keep.is_keep_alive(Version::Http10));
    }

    #[test]
    fn test_max_headers_cap() {
        let mut header = MessageHeader::new();
        for i in 0..MAX_HEADERS + 10 {
            header.add(format!("Header-{}", i), "value");
        }
        assert_eq!(header.len(), MAX_HEADERS);
    }
}
