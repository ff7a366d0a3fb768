//! Proposals: the compressed transfer unit.
//!
//! # Announcement line
//!
//! ```text
//! FC EM TJKYEIMMHSRB 527 123 0
//! ││ │  │            │   │   └ reserved
//! ││ │  │            │   └ compressed size
//! ││ │  │            └ plaintext size
//! ││ │  └ MID
//! ││ └ message type (EM or CM)
//! │└ proposal code
//! └ command prefix
//! ```
//!
//! A block of at most [`MAX_BLOCK_SIZE`] announcements is closed by a
//! checksum line `F> XX`, answered with one `FS` line.
//!
//! # Answer tokens
//!
//! | Tokens        | Decision                   |
//! |---------------|----------------------------|
//! | `Y y H h +`   | Accept                     |
//! | `N n R r -`   | Reject (already received)  |
//! | `L l =`       | Defer                      |
//! | `A a !` + num | Accept from compressed offset |

use serde::{Deserialize, Serialize};

use super::message::Message;
use crate::codec::ProposalCode;
use crate::error::{B2FError, Result};

/// Maximum number of proposals per block.
pub const MAX_BLOCK_SIZE: usize = 5;

/// The binary protocol cannot express offsets beyond six digits.
pub const PROTOCOL_OFFSET_SIZE_LIMIT: usize = 999_999;

/// Smallest valid compressed payload (an empty LZHUF container).
pub const MIN_COMPRESSED_SIZE: usize = 6;

/// Decision on a proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ProposalAnswer {
    /// Send the message (possibly from an offset)
    Accept,
    /// Already received; don't send
    Reject,
    /// Send it later
    #[default]
    Defer,
}

impl ProposalAnswer {
    /// Wire token
    pub fn as_char(&self) -> char {
        match self {
            ProposalAnswer::Accept => '+',
            ProposalAnswer::Reject => '-',
            ProposalAnswer::Defer => '=',
        }
    }
}

/// Compressed message announced for transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    code: ProposalCode,
    msg_type: String,
    mid: String,
    answer: ProposalAnswer,
    title: String,
    offset: usize,
    sent: bool,
    size: usize,
    compressed_data: Vec<u8>,
    compressed_size: usize,
}

impl Proposal {
    /// Build an outbound proposal, compressing `data` eagerly.
    pub fn new(mid: &str, title: &str, code: ProposalCode, data: &[u8]) -> Result<Self> {
        let compressed = code.compress(data)?;
        let title = if title.is_empty() { "No title" } else { title };

        Ok(Self {
            code,
            msg_type: "EM".to_string(),
            mid: mid.to_string(),
            answer: ProposalAnswer::default(),
            title: title.to_string(),
            offset: 0,
            sent: false,
            size: data.len(),
            compressed_size: compressed.compressed_bytes,
            compressed_data: compressed.data,
        })
    }

    /// Parse an inbound announcement line.
    pub fn parse(line: &str) -> Result<Self> {
        let mut chars = line.chars();
        if chars.next() != Some('F') {
            return Err(B2FError::InvalidProposal(format!("not a proposal: '{line}'")));
        }
        let code = chars
            .next()
            .and_then(ProposalCode::from_char)
            .ok_or_else(|| {
                B2FError::InvalidProposal(format!("unsupported proposal code in '{line}'"))
            })?;

        let mut prop = Self {
            code,
            msg_type: String::new(),
            mid: String::new(),
            answer: ProposalAnswer::default(),
            title: String::new(),
            offset: 0,
            sent: false,
            size: 0,
            compressed_data: Vec::new(),
            compressed_size: 0,
        };

        // Legacy codes are accepted as bare markers.
        if !code.is_b2() {
            return Ok(prop);
        }

        let fields: Vec<&str> = line.get(3..).unwrap_or("").split(' ').collect();
        match fields.len() {
            n if n < 5 => {
                return Err(B2FError::InvalidProposal(format!("malformed proposal: '{line}'")))
            },
            5 => {},
            _ => {
                return Err(B2FError::InvalidProposal(format!(
                    "too many parts in proposal: '{line}'"
                )))
            },
        }

        if fields[0] != "EM" && fields[0] != "CM" {
            return Err(B2FError::InvalidProposal(format!(
                "expected message type CM or EM, but found '{}'",
                fields[0]
            )));
        }
        if fields[1].is_empty() {
            return Err(B2FError::InvalidProposal(format!("empty MID in '{line}'")));
        }

        prop.msg_type = fields[0].to_string();
        prop.mid = fields[1].to_string();
        prop.size = fields[2].parse().map_err(|_| {
            B2FError::InvalidProposal(format!("invalid size '{}'", fields[2]))
        })?;
        prop.compressed_size = fields[3].parse().map_err(|_| {
            B2FError::InvalidProposal(format!("invalid compressed size '{}'", fields[3]))
        })?;
        Ok(prop)
    }

    /// Outbound announcement line (without CR).
    pub fn announcement(&self) -> String {
        format!(
            "F{} {} {} {} {} 0",
            self.code.as_char(),
            self.msg_type,
            self.mid,
            self.size,
            self.compressed_size
        )
    }

    /// Proposal code
    pub fn code(&self) -> ProposalCode {
        self.code
    }

    /// Message type (`EM` or `CM`)
    pub fn msg_type(&self) -> &str {
        &self.msg_type
    }

    /// Message ID
    pub fn mid(&self) -> &str {
        &self.mid
    }

    /// Title (decoded subject)
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Set the title as received in the transfer header
    pub fn set_title(&mut self, title: impl Into<String>) {
        self.title = title.into();
    }

    /// Current answer
    pub fn answer(&self) -> ProposalAnswer {
        self.answer
    }

    /// Set the answer
    pub fn set_answer(&mut self, answer: ProposalAnswer) {
        self.answer = answer;
    }

    /// Requested resume offset into the compressed payload
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Whether the transfer completed
    pub fn is_sent(&self) -> bool {
        self.sent
    }

    /// Mark the transfer completed
    pub fn set_sent(&mut self, sent: bool) {
        self.sent = sent;
    }

    /// Plaintext size
    pub fn size(&self) -> usize {
        self.size
    }

    /// Declared compressed size
    pub fn compressed_size(&self) -> usize {
        self.compressed_size
    }

    /// Buffered compressed payload
    pub fn compressed_data(&self) -> &[u8] {
        &self.compressed_data
    }

    /// Store a received compressed payload.
    pub(crate) fn set_compressed_data(&mut self, data: Vec<u8>) {
        self.compressed_data = data;
    }

    /// Whether the buffered payload has the declared compressed size.
    pub fn data_is_complete(&self) -> bool {
        self.compressed_data.len() == self.compressed_size
    }

    /// Decompressed message bytes.
    pub fn data(&self) -> Result<Vec<u8>> {
        let data = self.code.decompress(&self.compressed_data)?;
        if self.size != 0 && data.len() != self.size {
            return Err(B2FError::Decompression(format!(
                "length mismatch: expected {} bytes, got {}",
                self.size,
                data.len()
            )));
        }
        Ok(data)
    }

    /// Decompress and parse the carried message.
    pub fn message(&self) -> Result<Message> {
        Message::read_from(&self.data()?[..])
    }
}

/// Checksum of an announcement block: negated sum of every line byte
/// including the trailing CR.
pub fn block_checksum<'a>(lines: impl IntoIterator<Item = &'a str>) -> u8 {
    let sum = lines.into_iter().fold(0i64, |acc, line| {
        acc + line.bytes().map(i64::from).sum::<i64>() + i64::from(b'\r')
    });
    ((-sum) & 0xff) as u8
}

/// Apply an `FS` answer line positionally to `proposals`.
pub fn parse_answer_line(line: &str, proposals: &mut [Proposal]) -> Result<()> {
    let tokens = line
        .strip_prefix("FS ")
        .ok_or_else(|| B2FError::InvalidAnswer(format!("not an answer line: '{line}'")))?;

    let mut chars = tokens.chars().peekable();
    let mut i = 0;
    while let Some(c) = chars.next() {
        let prop = proposals.get_mut(i).ok_or_else(|| {
            B2FError::InvalidAnswer("got answer for more proposals than expected".to_string())
        })?;
        i += 1;

        match c {
            'Y' | 'y' | 'H' | 'h' | '+' => {
                tracing::info!("Remote accepted {}", prop.mid);
                prop.answer = ProposalAnswer::Accept;
            },
            'N' | 'n' | 'R' | 'r' | '-' => {
                tracing::info!("Remote already received {}", prop.mid);
                prop.answer = ProposalAnswer::Reject;
            },
            'L' | 'l' | '=' => {
                tracing::info!("Remote deferred {}", prop.mid);
                prop.answer = ProposalAnswer::Defer;
            },
            'A' | 'a' | '!' => {
                let mut digits = String::new();
                while let Some(d) = chars.next_if(char::is_ascii_digit) {
                    digits.push(d);
                }
                if digits.is_empty() {
                    return Err(B2FError::InvalidAnswer(
                        "got offset request without offset index".to_string(),
                    ));
                }
                prop.answer = ProposalAnswer::Accept;
                let offset = digits.parse::<usize>().unwrap_or(usize::MAX);
                if offset > PROTOCOL_OFFSET_SIZE_LIMIT {
                    tracing::warn!(
                        "Remote requested {} at offset {} which exceeds the protocol offset limit. Ignoring offset.",
                        prop.mid,
                        digits
                    );
                    prop.offset = 0;
                } else {
                    tracing::info!("Remote accepted {} at offset {}", prop.mid, offset);
                    prop.offset = offset;
                }
            },
            other => {
                return Err(B2FError::InvalidAnswer(format!(
                    "unverified answer token '{other}' in proposal answer line"
                )))
            },
        }
    }
    Ok(())
}

/// Build an `FS` answer line (without CR) for `proposals`.
pub fn answer_line(proposals: &[Proposal]) -> String {
    let mut line = String::from("FS ");
    for prop in proposals {
        if prop.answer == ProposalAnswer::Accept && prop.offset > 0 {
            line.push('!');
            line.push_str(&prop.offset.to_string());
        } else {
            line.push(prop.answer.as_char());
        }
    }
    line
}
