//! Message header block.
//!
//! Keys are case-insensitive and stored in canonical form (`content-type`
//! becomes `Content-Type`). Each key maps to an ordered list of values.
//!
//! Header bytes on the wire are ISO-8859-1: every byte maps to the code point
//! of the same value, both when reading and when writing.

use std::io::{BufRead, Write};

use crate::error::{B2FError, Result};

/// Message identifier
pub const HEADER_MID: &str = "Mid";
/// Primary receiver
pub const HEADER_TO: &str = "To";
/// Date (`YYYY/MM/DD HH:MM`, UTC)
pub const HEADER_DATE: &str = "Date";
/// Message type
pub const HEADER_TYPE: &str = "Type";
/// Sender
pub const HEADER_FROM: &str = "From";
/// Carbon copy receiver
pub const HEADER_CC: &str = "Cc";
/// Subject
pub const HEADER_SUBJECT: &str = "Subject";
/// Mailbox operator origin
pub const HEADER_MBO: &str = "Mbo";
/// Body length in bytes
pub const HEADER_BODY: &str = "Body";
/// Attachment entry (`<size> <name>`)
pub const HEADER_FILE: &str = "File";
/// Body media type and charset
pub const HEADER_CONTENT_TYPE: &str = "Content-Type";
/// Body transfer encoding
pub const HEADER_CONTENT_TRANSFER_ENCODING: &str = "Content-Transfer-Encoding";

/// Canonical form of a header key.
///
/// The first letter and every letter following a hyphen are upper-cased,
/// the rest lower-cased.
pub fn canonical_key(key: &str) -> String {
    let mut upper = true;
    key.trim()
        .chars()
        .map(|c| {
            let out = if upper {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            };
            upper = c == '-';
            out
        })
        .collect()
}

/// Decode wire bytes as ISO-8859-1.
pub fn latin1_to_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Encode text as ISO-8859-1, replacing unrepresentable characters with `?`.
pub fn string_to_latin1(s: &str) -> Vec<u8> {
    s.chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect()
}

/// Decode a header value for display.
///
/// Values containing an RFC 2047 encoded-word marker (`=?`) are decoded per
/// that standard. Anything else is already the ISO-8859-1 interpretation of
/// the wire bytes (some clients send raw 8-bit subjects) and is returned as is.
pub fn decode_header_value(value: &str) -> String {
    if !value.contains("=?") {
        return value.to_string();
    }

    let mut raw = b"Subject: ".to_vec();
    raw.extend(string_to_latin1(value));
    match mailparse::parse_header(&raw) {
        Ok((header, _)) => header.get_value(),
        Err(e) => {
            tracing::warn!("Unable to decode header value '{}': {}", value, e);
            value.to_string()
        },
    }
}

/// Case-insensitive multi-value header
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Header {
    entries: Vec<(String, Vec<String>)>,
}

impl Header {
    /// Create an empty header
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, key: &str) -> Option<usize> {
        let key = canonical_key(key);
        self.entries.iter().position(|(k, _)| *k == key)
    }

    /// Append a value to `key`.
    pub fn add(&mut self, key: &str, value: impl Into<String>) {
        match self.position(key) {
            Some(i) => self.entries[i].1.push(value.into()),
            None => self.entries.push((canonical_key(key), vec![value.into()])),
        }
    }

    /// Replace all values of `key` with `value`.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        match self.position(key) {
            Some(i) => self.entries[i].1 = vec![value.into()],
            None => self.entries.push((canonical_key(key), vec![value.into()])),
        }
    }

    /// First value of `key`, or the empty string.
    pub fn get(&self, key: &str) -> &str {
        self.position(key)
            .and_then(|i| self.entries[i].1.first())
            .map_or("", String::as_str)
    }

    /// All values of `key`, in insertion order.
    pub fn get_all(&self, key: &str) -> &[String] {
        self.position(key)
            .map_or(&[][..], |i| self.entries[i].1.as_slice())
    }

    /// Remove every value of `key`.
    pub fn del(&mut self, key: &str) {
        if let Some(i) = self.position(key) {
            self.entries.remove(i);
        }
    }

    /// Whether `key` has at least one value.
    pub fn contains(&self, key: &str) -> bool {
        !self.get_all(key).is_empty()
    }

    /// Iterate over `(key, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|(k, vs)| vs.iter().map(move |v| (k.as_str(), v.as_str())))
    }

    /// Write the header block in wire format (without the terminating blank
    /// line). `Mid` is always written first.
    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        let mid = self.get(HEADER_MID);
        if mid.is_empty() {
            return Err(B2FError::MissingMid);
        }

        w.write_all(b"Mid: ")?;
        w.write_all(&string_to_latin1(mid.trim()))?;
        w.write_all(b"\r\n")?;

        for (key, value) in self.iter() {
            if key == HEADER_MID {
                continue;
            }
            w.write_all(key.as_bytes())?;
            w.write_all(b": ")?;
            w.write_all(&string_to_latin1(value.trim()))?;
            w.write_all(b"\r\n")?;
        }
        Ok(())
    }

    /// Read a header block terminated by an empty line.
    ///
    /// Continuation lines (starting with space or tab) are folded into the
    /// previous value.
    pub fn read_from<R: BufRead>(r: &mut R) -> Result<Self> {
        let mut header = Header::new();
        let mut last_key: Option<String> = None;

        loop {
            let mut raw = Vec::new();
            if r.read_until(b'\n', &mut raw)? == 0 {
                return Err(B2FError::UnexpectedEof);
            }
            while matches!(raw.last(), Some(b'\n' | b'\r')) {
                raw.pop();
            }
            if raw.is_empty() {
                break;
            }

            let line = latin1_to_string(&raw);
            if line.starts_with([' ', '\t']) {
                let Some(key) = &last_key else {
                    return Err(B2FError::Parse(format!(
                        "malformed header continuation line: '{line}'"
                    )));
                };
                if let Some(i) = header.position(key) {
                    if let Some(value) = header.entries[i].1.last_mut() {
                        value.push(' ');
                        value.push_str(line.trim());
                    }
                }
                continue;
            }

            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| B2FError::Parse(format!("malformed header line: '{line}'")))?;
            let key = canonical_key(key);
            if key.is_empty() {
                return Err(B2FError::Parse(format!("malformed header line: '{line}'")));
            }
            header.add(&key, value.trim());
            last_key = Some(key);
        }

        Ok(header)
    }
}
