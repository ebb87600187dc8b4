//! Ordered, case-insensitive header map shared by requests and responses.

use crate::error::{Error, HeadPart, Result};

/// Header fields in insertion order. Name lookup is ASCII case-insensitive;
/// the original spelling is preserved for wire output.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    fields: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Headers { fields: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// First value of the named header, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// All values of the named header, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.fields
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Whether the named header carries the given token in any of its
    /// comma-separated value lists (case-insensitive).
    pub fn contains_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    /// Append a field, keeping any existing fields of the same name.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push((name.into(), value.into()));
    }

    /// Replace all fields of this name with a single one.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.fields.push((name.to_string(), value.into()));
    }

    /// Add the field only if no field of this name exists yet.
    pub fn add_if_absent(&mut self, name: &str, value: impl Into<String>) {
        if !self.contains(name) {
            self.add(name, value);
        }
    }

    pub fn remove(&mut self, name: &str) {
        self.fields.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// `Content-Length`, parsed. Multiple differing values or a non-numeric
    /// value are a parse error (the message framing would be ambiguous).
    pub fn content_length(&self) -> Result<Option<u64>> {
        let mut parsed: Option<u64> = None;
        for v in self.get_all("Content-Length") {
            let n = v.trim().parse::<u64>().map_err(|_| Error::Parse {
                part: HeadPart::Headers,
                byte: v.as_bytes().first().copied().unwrap_or(0),
                prev: None,
                pos: 0,
            })?;
            match parsed {
                Some(old) if old != n => {
                    return Err(Error::IllegalHeader(
                        "conflicting Content-Length values".into(),
                    ));
                }
                _ => parsed = Some(n),
            }
        }
        Ok(parsed)
    }

    /// Whether `Transfer-Encoding` names `chunked` as its final coding.
    pub fn transfer_encoding_chunked(&self) -> bool {
        self.get_all("Transfer-Encoding")
            .flat_map(|v| v.split(','))
            .last()
            .map(|t| t.trim().eq_ignore_ascii_case("chunked"))
            .unwrap_or(false)
    }

    pub fn connection_close(&self) -> bool {
        self.contains_token("Connection", "close")
    }

    pub fn expects_100_continue(&self) -> bool {
        self.contains_token("Expect", "100-continue")
    }
}

impl FromIterator<(String, String)> for Headers {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Headers {
            fields: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_is_case_insensitive() {
        let mut h = Headers::new();
        h.add("Content-Type", "text/plain");
        assert_eq!(h.get("content-type"), Some("text/plain"));
        assert_eq!(h.get("CONTENT-TYPE"), Some("text/plain"));
        assert_eq!(h.get("content-length"), None);
    }

    #[test]
    fn token_search_splits_lists() {
        let mut h = Headers::new();
        h.add("Connection", "keep-alive, Close");
        assert!(h.connection_close());
        assert!(h.contains_token("connection", "keep-alive"));
        assert!(!h.contains_token("connection", "upgrade"));
    }

    #[test]
    fn content_length_conflicts_rejected() {
        let mut h = Headers::new();
        h.add("Content-Length", "5");
        h.add("Content-Length", "5");
        assert_eq!(h.content_length().unwrap(), Some(5));
        h.add("Content-Length", "6");
        assert!(h.content_length().is_err());
    }

    #[test]
    fn set_replaces_all() {
        let mut h = Headers::new();
        h.add("X-A", "1");
        h.add("x-a", "2");
        h.set("X-A", "3");
        assert_eq!(h.get_all("x-a").collect::<Vec<_>>(), vec!["3"]);
    }

    #[test]
    fn chunked_must_be_final_coding() {
        let mut h = Headers::new();
        h.add("Transfer-Encoding", "gzip, chunked");
        assert!(h.transfer_encoding_chunked());
        h.set("Transfer-Encoding", "chunked, gzip");
        assert!(!h.transfer_encoding_chunked());
    }
}
