//! Winlink message structure.
//!
//! A message on the wire is a header block, a blank line, exactly `Body`
//! bytes of body, and then (only when attachments exist) a CRLF followed by
//! each attachment's bytes and a CRLF, in `File` header order.
//!
//! ```text
//! Mid: 8SNZR5SLGNOJ\r\n
//! Date: 2016/12/29 21:04\r\n
//! From: LA5NTA\r\n
//! To: LA1B\r\n
//! Subject: Test\r\n
//! Body: 13\r\n
//! File: 5 hello.txt\r\n
//! \r\n
//! Hello world\r\n   <- Body bytes
//! \r\n              <- end of body
//! hello\r\n         <- attachment + end of file
//! ```

use std::fmt;
use std::io::{BufRead, BufReader, Read, Write};

use chrono::{DateTime, NaiveDateTime, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use super::address::Address;
use super::header::{
    decode_header_value, latin1_to_string, string_to_latin1, Header, HEADER_BODY, HEADER_CC,
    HEADER_CONTENT_TRANSFER_ENCODING, HEADER_CONTENT_TYPE, HEADER_DATE, HEADER_FILE,
    HEADER_FROM, HEADER_MBO, HEADER_MID, HEADER_SUBJECT, HEADER_TO, HEADER_TYPE,
};
use super::proposal::Proposal;
use crate::codec::ProposalCode;
use crate::error::{B2FError, Result};

/// Default body charset (what RMS Express sends).
pub const DEFAULT_CHARSET: &str = "ISO-8859-1";

/// Default body transfer encoding.
pub const DEFAULT_TRANSFER_ENCODING: &str = "8bit";

/// Date layout written to the `Date` header (UTC).
pub const DATE_LAYOUT: &str = "%Y/%m/%d %H:%M";

/// Alternative layout seen from store-and-forward relays.
const DATE_LAYOUT_DOTTED: &str = "%Y.%m.%d %H:%M";

/// Maximum MID length.
pub const MAX_MID_LENGTH: usize = 12;

/// Lines may not exceed 1000 bytes including CRLF.
const MAX_LINE_LENGTH: usize = 998;

/// Maximum length of an RFC 2047 encoded word.
const MAX_ENCODED_WORD_LENGTH: usize = 75;

/// Message type
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum MsgType {
    /// Private mail
    #[default]
    Private,
    /// Service message
    Service,
    /// Inquiry
    Inquiry,
    /// Position report
    PositionReport,
    /// Option
    Option,
    /// System message
    System,
    /// Anything else found in a received header
    Other(String),
}

impl MsgType {
    /// Header value for this type
    pub fn as_str(&self) -> &str {
        match self {
            MsgType::Private => "Private",
            MsgType::Service => "Service",
            MsgType::Inquiry => "Inquiry",
            MsgType::PositionReport => "Position Report",
            MsgType::Option => "Option",
            MsgType::System => "System",
            MsgType::Other(s) => s,
        }
    }
}

impl From<&str> for MsgType {
    fn from(s: &str) -> Self {
        match s {
            "" | "Private" => MsgType::Private,
            "Service" => MsgType::Service,
            "Inquiry" => MsgType::Inquiry,
            "Position Report" => MsgType::PositionReport,
            "Option" => MsgType::Option,
            "System" => MsgType::System,
            other => MsgType::Other(other.to_string()),
        }
    }
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message attachment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    name: String,
    data: Vec<u8>,
}

impl File {
    /// Create an attachment
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data,
        }
    }

    /// File name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// File content
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Generate a message ID: base32 of an MD5 over the current time and
/// callsign, truncated to [`MAX_MID_LENGTH`].
pub fn generate_mid(callsign: &str) -> String {
    const ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

    let mut hasher = Md5::new();
    hasher.update(format!("{}-{}", Utc::now().to_rfc3339(), callsign));
    hasher.update(uuid::Uuid::new_v4().as_bytes());
    let sum = hasher.finalize();

    let mut mid = String::with_capacity(MAX_MID_LENGTH);
    let mut buffer: u32 = 0;
    let mut bits: u32 = 0;
    for &byte in sum.iter() {
        if mid.len() == MAX_MID_LENGTH {
            break;
        }
        buffer = (buffer << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 && mid.len() < MAX_MID_LENGTH {
            bits -= 5;
            mid.push(ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
        buffer &= (1 << bits) - 1;
    }
    mid
}

/// Parse a `Date` header value.
///
/// Accepts `YYYY/MM/DD HH:MM`, `YYYY.MM.DD HH:MM` (both UTC) and RFC 5322
/// dates. An empty value yields `None`.
pub fn parse_date(value: &str) -> Result<Option<DateTime<Utc>>> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }

    for layout in [DATE_LAYOUT, DATE_LAYOUT_DOTTED] {
        if let Ok(t) = NaiveDateTime::parse_from_str(value, layout) {
            return Ok(Some(t.and_utc()));
        }
    }

    DateTime::parse_from_rfc2822(value)
        .map(|t| Some(t.with_timezone(&Utc)))
        .map_err(|_| B2FError::InvalidDate(value.to_string()))
}

/// Q-encode (RFC 2047) a subject containing non-ASCII characters.
///
/// ISO-8859-1 is used when every character fits, UTF-8 otherwise. Words are
/// split between characters to stay within 75 characters.
fn encode_subject(subject: &str) -> String {
    if subject.is_ascii() {
        return subject.to_string();
    }

    let latin1 = subject.chars().all(|c| u32::from(c) <= 0xff);
    let prefix = if latin1 {
        "=?ISO-8859-1?q?"
    } else {
        "=?UTF-8?q?"
    };

    let mut words = Vec::new();
    let mut word = prefix.to_string();
    for c in subject.chars() {
        let mut utf8 = [0u8; 4];
        let bytes: &[u8] = if latin1 {
            utf8[0] = u32::from(c) as u8;
            &utf8[..1]
        } else {
            c.encode_utf8(&mut utf8).as_bytes()
        };

        let mut encoded = String::new();
        for &b in bytes {
            match b {
                b' ' => encoded.push('_'),
                b'=' | b'?' | b'_' => encoded.push_str(&format!("={b:02X}")),
                b'!'..=b'~' => encoded.push(b as char),
                _ => encoded.push_str(&format!("={b:02X}")),
            }
        }

        if word.len() + encoded.len() + 2 > MAX_ENCODED_WORD_LENGTH && word.len() > prefix.len() {
            word.push_str("?=");
            words.push(word);
            word = prefix.to_string();
        }
        word.push_str(&encoded);
    }
    word.push_str("?=");
    words.push(word);
    words.join(" ")
}

/// Convert text to an ISO-8859-1 body with CRLF line endings, hard-wrapping
/// lines longer than the protocol limit.
fn string_to_body(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len() + 16);
    for line in text.lines() {
        let bytes = string_to_latin1(line);
        if bytes.is_empty() {
            out.extend_from_slice(b"\r\n");
            continue;
        }
        for chunk in bytes.chunks(MAX_LINE_LENGTH) {
            out.extend_from_slice(chunk);
            out.extend_from_slice(b"\r\n");
        }
    }
    out
}

fn body_from_bytes(data: &[u8], charset: &str) -> Result<String> {
    match charset.to_ascii_lowercase().as_str() {
        "utf-8" | "utf8" => String::from_utf8(data.to_vec())
            .map_err(|e| B2FError::Parse(format!("body is not valid UTF-8: {e}"))),
        "iso-8859-1" | "latin1" | "us-ascii" | "ascii" => Ok(latin1_to_string(data)),
        other => {
            tracing::warn!("Unsupported body charset '{}', decoding as {}", other, DEFAULT_CHARSET);
            Ok(latin1_to_string(data))
        },
    }
}

/// Read exactly `n` bytes followed by CRLF. A missing CRLF at end of
/// stream is tolerated.
fn read_section<R: BufRead>(reader: &mut R, n: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; n];
    reader.read_exact(&mut buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            B2FError::UnexpectedEof
        } else {
            B2FError::Io(e)
        }
    })?;

    let mut end = Vec::with_capacity(2);
    reader.read_until(b'\n', &mut end)?;
    if !end.is_empty() && end != b"\r\n" {
        return Err(B2FError::Parse("unexpected end of section".to_string()));
    }
    Ok(buf)
}

/// Winlink message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    /// Header fields. Prefer the typed accessors for common fields.
    pub header: Header,
    body: Vec<u8>,
    files: Vec<File>,
}

impl Message {
    /// Create a message with MID, Date, From, Mbo and Type set.
    pub fn new(msg_type: MsgType, mycall: &str) -> Self {
        let mut msg = Self::default();
        msg.header.set(HEADER_MID, generate_mid(mycall));
        msg.set_date(Utc::now());
        msg.set_from(mycall);
        msg.header.set(HEADER_MBO, mycall);
        msg.header.set(HEADER_TYPE, msg_type.as_str());
        msg
    }

    /// Message ID
    pub fn mid(&self) -> &str {
        self.header.get(HEADER_MID)
    }

    /// Set the subject, Q-encoding it when it contains non-ASCII text
    pub fn set_subject(&mut self, subject: &str) {
        self.header.set(HEADER_SUBJECT, encode_subject(subject));
    }

    /// Decoded subject
    pub fn subject(&self) -> String {
        decode_header_value(self.header.get(HEADER_SUBJECT))
    }

    /// Message type
    pub fn msg_type(&self) -> MsgType {
        MsgType::from(self.header.get(HEADER_TYPE))
    }

    /// Mailbox operator origin
    pub fn mbo(&self) -> &str {
        self.header.get(HEADER_MBO)
    }

    /// Set the sender
    pub fn set_from(&mut self, addr: &str) {
        self.header.set(HEADER_FROM, Address::parse(addr).to_string());
    }

    /// Sender
    pub fn from(&self) -> Address {
        Address::parse(self.header.get(HEADER_FROM))
    }

    /// Add primary receivers
    pub fn add_to<'a>(&mut self, addrs: impl IntoIterator<Item = &'a str>) {
        for a in addrs {
            self.header.add(HEADER_TO, Address::parse(a).to_string());
        }
    }

    /// Add carbon copy receivers
    pub fn add_cc<'a>(&mut self, addrs: impl IntoIterator<Item = &'a str>) {
        for a in addrs {
            self.header.add(HEADER_CC, Address::parse(a).to_string());
        }
    }

    /// Primary receivers
    pub fn to(&self) -> Vec<Address> {
        self.header.get_all(HEADER_TO).iter().map(|s| Address::parse(s)).collect()
    }

    /// Carbon copy receivers
    pub fn cc(&self) -> Vec<Address> {
        self.header.get_all(HEADER_CC).iter().map(|s| Address::parse(s)).collect()
    }

    /// All receivers: To followed by Cc
    pub fn receivers(&self) -> Vec<Address> {
        let mut all = self.to();
        all.extend(self.cc());
        all
    }

    /// Whether `addr` is the one and only receiver
    pub fn is_only_receiver(&self, addr: &Address) -> bool {
        match self.receivers().as_slice() {
            [only] => only.to_string() == addr.to_string(),
            _ => false,
        }
    }

    /// Set the date (stored as UTC)
    pub fn set_date(&mut self, t: DateTime<Utc>) {
        self.header.set(HEADER_DATE, t.format(DATE_LAYOUT).to_string());
    }

    /// Parsed date, if present and valid
    pub fn date(&self) -> Option<DateTime<Utc>> {
        parse_date(self.header.get(HEADER_DATE)).ok().flatten()
    }

    /// Set a text body encoded as ISO-8859-1 with CRLF line endings.
    pub fn set_body(&mut self, body: &str) {
        self.header
            .set(HEADER_CONTENT_TRANSFER_ENCODING, DEFAULT_TRANSFER_ENCODING);
        self.header.set(
            HEADER_CONTENT_TYPE,
            format!("text/plain; charset={DEFAULT_CHARSET}"),
        );
        self.set_body_bytes(string_to_body(body));
    }

    /// Set already encoded body bytes.
    pub fn set_body_bytes(&mut self, body: Vec<u8>) {
        self.header.set(HEADER_BODY, body.len().to_string());
        self.body = body;
    }

    /// Body decoded according to the Content-Type charset
    pub fn body(&self) -> Result<String> {
        body_from_bytes(&self.body, &self.charset())
    }

    /// Raw body bytes
    pub fn body_bytes(&self) -> &[u8] {
        &self.body
    }

    /// Body size as declared in the header
    pub fn body_size(&self) -> usize {
        self.header.get(HEADER_BODY).trim().parse().unwrap_or(0)
    }

    /// Body charset from Content-Type, defaulting to ISO-8859-1
    pub fn charset(&self) -> String {
        self.header
            .get(HEADER_CONTENT_TYPE)
            .split(';')
            .skip(1)
            .filter_map(|param| param.split_once('='))
            .find(|(k, _)| k.trim().eq_ignore_ascii_case("charset"))
            .map_or_else(
                || DEFAULT_CHARSET.to_string(),
                |(_, v)| v.trim().trim_matches('"').to_string(),
            )
    }

    /// Attachments
    pub fn files(&self) -> &[File] {
        &self.files
    }

    /// Attach a file and list it in the header
    pub fn add_file(&mut self, file: File) {
        self.header
            .add(HEADER_FILE, format!("{} {}", file.size(), file.name()));
        self.files.push(file);
    }

    /// Write the message in wire format.
    ///
    /// Fails if the MID is missing or the Date header is unparsable.
    pub fn write<W: Write>(&self, w: &mut W) -> Result<()> {
        parse_date(self.header.get(HEADER_DATE))?;

        self.header.write(w)?;
        w.write_all(b"\r\n")?;

        w.write_all(&self.body)?;
        if !self.files.is_empty() {
            w.write_all(b"\r\n")?;
        }
        for f in &self.files {
            w.write_all(&f.data)?;
            w.write_all(b"\r\n")?;
        }
        Ok(())
    }

    /// Wire format bytes
    pub fn bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.body.len() + 256);
        self.write(&mut buf)?;
        Ok(buf)
    }

    /// Parse a message from wire format.
    pub fn read_from<R: Read>(r: R) -> Result<Self> {
        let mut reader = BufReader::new(r);

        let header = Header::read_from(&mut reader)?;
        if header.get(HEADER_MID).is_empty() {
            return Err(B2FError::MissingMid);
        }

        let body_size = match header.get(HEADER_BODY).trim() {
            "" => 0,
            size => size
                .parse()
                .map_err(|_| B2FError::Parse(format!("invalid body size '{size}'")))?,
        };
        let body = read_section(&mut reader, body_size)?;

        let mut files = Vec::with_capacity(header.get_all(HEADER_FILE).len());
        for entry in header.get_all(HEADER_FILE) {
            let (size, name) = entry
                .split_once(' ')
                .filter(|(size, name)| !size.is_empty() && !name.is_empty())
                .ok_or_else(|| {
                    B2FError::Parse(format!("failed to parse file header. Got: {entry}"))
                })?;
            let size: usize = size
                .parse()
                .map_err(|_| B2FError::Parse(format!("invalid file size in '{entry}'")))?;
            let data = read_section(&mut reader, size)?;
            files.push(File::new(name, data));
        }

        parse_date(header.get(HEADER_DATE))?;

        Ok(Self {
            header,
            body,
            files,
        })
    }

    /// Build a proposal carrying this message, compressed with `code`.
    pub fn proposal(&self, code: ProposalCode) -> Result<Proposal> {
        let data = self.bytes()?;
        Proposal::new(self.mid(), &self.subject(), code, &data)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "MID: {}", self.mid())?;
        if let Some(date) = self.date() {
            writeln!(f, "Date: {}", date.format(DATE_LAYOUT))?;
        }
        writeln!(f, "From: {}", self.from())?;
        for to in self.to() {
            writeln!(f, "To: {to}")?;
        }
        for cc in self.cc() {
            writeln!(f, "Cc: {cc}")?;
        }
        writeln!(f, "Subject: {}", self.subject())?;

        let body = self.body().unwrap_or_else(|_| latin1_to_string(&self.body));
        writeln!(f, "\n{body}")?;

        writeln!(f, "Attachments:")?;
        for file in &self.files {
            writeln!(f, "\t{} [{} bytes]", file.name(), file.size())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> Message {
        let mut msg = Message::new(MsgType::Private, "LA5NTA");
        msg.add_to(["LA1B"]);
        msg.set_subject("Test 123 foo bar");
        msg.set_body("Hello\nWorld");
        msg
    }

    #[test]
    fn test_generate_mid() {
        let mids: Vec<String> = (0..64).map(|_| generate_mid("LA5NTA")).collect();
        for mid in &mids {
            assert_eq!(mid.len(), MAX_MID_LENGTH);
            assert!(mid.bytes().all(|b| b.is_ascii_uppercase() || (b'2'..=b'7').contains(&b)));
        }

        let mut unique = mids.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), mids.len());
    }

    #[test]
    fn test_new_message_defaults() {
        let msg = Message::new(MsgType::default(), "LA5NTA");
        assert_eq!(msg.mid().len(), MAX_MID_LENGTH);
        assert_eq!(msg.msg_type(), MsgType::Private);
        assert_eq!(msg.mbo(), "LA5NTA");
        assert_eq!(msg.from(), Address::new("LA5NTA"));
        assert!(msg.date().is_some());
    }

    #[test]
    fn test_subject_encoding() {
        let mut msg = sample();
        assert_eq!(msg.header.get(HEADER_SUBJECT), "Test 123 foo bar");

        msg.set_subject("Test æøå abc");
        assert_eq!(
            msg.header.get(HEADER_SUBJECT),
            "=?ISO-8859-1?q?Test_=E6=F8=E5_abc?="
        );
        assert_eq!(msg.subject(), "Test æøå abc");

        msg.set_subject("Hello, 世界");
        assert!(msg.header.get(HEADER_SUBJECT).starts_with("=?UTF-8?q?"));
        assert_eq!(msg.subject(), "Hello, 世界");
    }

    #[test]
    fn test_long_subject_is_split() {
        let subject = "æ".repeat(40);
        let encoded = encode_subject(&subject);
        assert!(encoded.split(' ').all(|w| w.len() <= MAX_ENCODED_WORD_LENGTH));
        assert!(encoded.split(' ').count() > 1);
    }

    #[test]
    fn test_body_crlf_and_size() {
        let msg = sample();
        assert_eq!(msg.body_bytes(), b"Hello\r\nWorld\r\n");
        assert_eq!(msg.body_size(), 14);
        assert_eq!(msg.charset(), "ISO-8859-1");
        assert_eq!(msg.body().unwrap(), "Hello\r\nWorld\r\n");
    }

    #[test]
    fn test_long_lines_wrapped() {
        let body = string_to_body(&"x".repeat(2000));
        let lines: Vec<&[u8]> = body.split(|&b| b == b'\n').collect();
        assert!(lines.iter().all(|l| l.len() <= MAX_LINE_LENGTH + 1));
    }

    #[test]
    fn test_roundtrip_with_files() {
        let mut msg = sample();
        msg.set_subject("Test æøå abc");
        msg.add_file(File::new("a.bin", vec![0, 1, 2, 255, b'\r', b'\n']));
        msg.add_file(File::new("hello world.txt", b"hello".to_vec()));

        let bytes = msg.bytes().unwrap();
        let parsed = Message::read_from(&bytes[..]).unwrap();

        assert_eq!(parsed.mid(), msg.mid());
        assert_eq!(parsed.subject(), "Test æøå abc");
        assert_eq!(parsed.body_bytes(), msg.body_bytes());
        assert_eq!(parsed.files(), msg.files());
        assert_eq!(parsed.to(), vec![Address::new("LA1B")]);
    }

    #[test]
    fn test_read_errors() {
        assert!(matches!(
            Message::read_from(&b"Subject: x\r\n\r\n"[..]),
            Err(B2FError::MissingMid)
        ));
        assert!(matches!(
            Message::read_from(&b"Mid: X\r\nBody: 10\r\n\r\nshort"[..]),
            Err(B2FError::UnexpectedEof)
        ));
        assert!(Message::read_from(&b"Mid: X\r\nBody: 2\r\nFile: 3\r\n\r\nhi\r\nabc\r\n"[..]).is_err());
        assert!(Message::read_from(&b"Mid: X\r\nBody: 2\r\nFile: 3 a\r\n\r\nhiXX"[..]).is_err());
        assert!(matches!(
            Message::read_from(&b"Mid: X\r\nDate: yesterday\r\n\r\n"[..]),
            Err(B2FError::InvalidDate(_))
        ));
        // Trailing CRLF may be omitted at end of stream.
        assert!(Message::read_from(&b"Mid: X\r\nBody: 2\r\n\r\nhi"[..]).is_ok());
    }

    #[test]
    fn test_date_formats() {
        let want = Utc.with_ymd_and_hms(2016, 12, 30, 1, 0, 0).unwrap();
        for s in [
            "2016/12/30 01:00",
            "2016.12.30 01:00",
            "Fri, 30 Dec 2016 01:00:00 -0000",
            "Fri, 30 Dec 2016 01:00:00 GMT",
        ] {
            assert_eq!(parse_date(s).unwrap(), Some(want), "{s}");
        }
    }

    #[test]
    fn test_receivers() {
        let mut msg = sample();
        assert!(msg.is_only_receiver(&Address::new("LA1B")));
        msg.add_cc(["user@example.com"]);
        assert_eq!(msg.receivers().len(), 2);
        assert_eq!(msg.receivers()[1].to_string(), "SMTP:user@example.com");
        assert!(!msg.is_only_receiver(&Address::new("LA1B")));
    }

    #[test]
    fn test_write_rejects_bad_date() {
        let mut msg = sample();
        msg.header.set(HEADER_DATE, "not a date");
        assert!(msg.bytes().is_err());
    }
}
