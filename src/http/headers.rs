//! Header storage with HTTP/1.1 lookup semantics.
//!
//! Lookups are case-insensitive and return the first value received for a
//! name; the ordered entry list keeps every header, duplicates included, with
//! its original spelling so it can be forwarded byte-for-byte.

use std::collections::HashMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, String)>,
    /// lowercase name -> index of first occurrence in `entries`
    first: HashMap<String, usize>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header, keeping any earlier value for the same name as the
    /// lookup result.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let key = name.to_ascii_lowercase();
        let index = self.entries.len();
        self.entries.push((name, value.into()));
        self.first.entry(key).or_insert(index);
    }

    /// Replace every header with this name by a single entry.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.remove(&name);
        self.append(name, value);
    }

    pub fn remove(&mut self, name: &str) {
        if self.first.remove(&name.to_ascii_lowercase()).is_none() {
            return;
        }
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.reindex();
    }

    fn reindex(&mut self) {
        self.first.clear();
        for (i, (name, _)) in self.entries.iter().enumerate() {
            self.first.entry(name.to_ascii_lowercase()).or_insert(i);
        }
    }

    /// First value received for `name`, case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.first
            .get(&name.to_ascii_lowercase())
            .map(|&i| self.entries[i].1.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.first.contains_key(&name.to_ascii_lowercase())
    }

    /// All values for `name` in arrival order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every header in arrival order with original case.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if a comma-separated header contains `token` (case-insensitive).
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    /// Serialize as `Name: value\r\n` lines.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        for (name, value) in &self.entries {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }
}

/// Parse a `Content-Length` value. Only ASCII digits are accepted, so signs
/// and embedded whitespace never reach the integer parser.
pub fn parse_content_length(value: &str) -> Option<u64> {
    let digits = value.trim_matches(|c| c == ' ' || c == '\t');
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
