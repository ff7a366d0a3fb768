//! Proposal codes and compression results.

use serde::{Deserialize, Serialize};

use super::{GzipCodec, LzhufCodec};
use crate::error::{B2FError, Result};

/// Proposal codes, as sent in the second byte of an `F?` announcement line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ProposalCode {
    /// Compressed v0/1 ASCII proposal (`FA`)
    Ascii,
    /// Basic ASCII proposal, or compressed binary in v0/1 (`FB`)
    Basic,
    /// Compressed v2 proposal, LZHUF (`FC`, Winlink extension)
    #[default]
    Wl2k,
    /// Gzip compressed v2 proposal (`FD`)
    Gzip,
}

impl ProposalCode {
    /// Wire character for this code.
    pub fn as_char(&self) -> char {
        match self {
            ProposalCode::Ascii => 'A',
            ProposalCode::Basic => 'B',
            ProposalCode::Wl2k => 'C',
            ProposalCode::Gzip => 'D',
        }
    }

    /// Parse a code from its wire character.
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'A' => Some(ProposalCode::Ascii),
            'B' => Some(ProposalCode::Basic),
            'C' => Some(ProposalCode::Wl2k),
            'D' => Some(ProposalCode::Gzip),
            _ => None,
        }
    }

    /// Whether the announcement line carries the detailed B2 fields
    /// (type, MID, sizes).
    pub fn is_b2(&self) -> bool {
        matches!(self, ProposalCode::Wl2k | ProposalCode::Gzip)
    }

    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            ProposalCode::Ascii => "ASCII",
            ProposalCode::Basic => "BASIC",
            ProposalCode::Wl2k => "LZHUF",
            ProposalCode::Gzip => "GZIP",
        }
    }

    /// Compress a plaintext message with this code's codec.
    pub fn compress(&self, data: &[u8]) -> Result<CompressionResult> {
        let compressed = match self {
            ProposalCode::Gzip => GzipCodec::new().compress_bytes(data)?,
            ProposalCode::Wl2k => LzhufCodec::new().compress_bytes(data)?,
            other => {
                return Err(B2FError::Compression(format!(
                    "{} proposals are not supported for outbound messages",
                    other.name()
                )))
            },
        };
        Ok(CompressionResult::new(compressed, *self, data.len()))
    }

    /// Decompress a payload produced by this code's codec.
    ///
    /// Corrupted payloads are a hard failure; no partial output is returned.
    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            ProposalCode::Gzip => GzipCodec::new().decompress_bytes(data),
            ProposalCode::Wl2k => LzhufCodec::new().decompress_bytes(data),
            other => Err(B2FError::Decompression(format!(
                "{} proposals are not supported",
                other.name()
            ))),
        }
    }
}

impl std::fmt::Display for ProposalCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Result of compression operation
#[derive(Debug, Clone)]
pub struct CompressionResult {
    /// Compressed payload
    pub data: Vec<u8>,
    /// Code (codec) used
    pub code: ProposalCode,
    /// Original size in bytes
    pub original_bytes: usize,
    /// Compressed size in bytes
    pub compressed_bytes: usize,
}

impl CompressionResult {
    /// Create new compression result
    pub fn new(data: Vec<u8>, code: ProposalCode, original_bytes: usize) -> Self {
        let compressed_bytes = data.len();
        Self {
            data,
            code,
            original_bytes,
            compressed_bytes,
        }
    }

    /// Calculate byte compression ratio
    pub fn byte_ratio(&self) -> f64 {
        if self.compressed_bytes == 0 {
            0.0
        } else {
            self.original_bytes as f64 / self.compressed_bytes as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_chars() {
        for code in [
            ProposalCode::Ascii,
            ProposalCode::Basic,
            ProposalCode::Wl2k,
            ProposalCode::Gzip,
        ] {
            assert_eq!(ProposalCode::from_char(code.as_char()), Some(code));
        }
        assert_eq!(ProposalCode::from_char('E'), None);
        assert!(ProposalCode::Wl2k.is_b2());
        assert!(!ProposalCode::Basic.is_b2());
    }

    #[test]
    fn test_compress_dispatch() {
        let data = b"Mid: ABC\r\nBody: 5\r\n\r\nhello".repeat(4);
        for code in [ProposalCode::Wl2k, ProposalCode::Gzip] {
            let result = code.compress(&data).unwrap();
            assert_eq!(result.code, code);
            assert_eq!(result.original_bytes, data.len());
            assert_eq!(code.decompress(&result.data).unwrap(), data);
        }
        assert!(ProposalCode::Basic.compress(&data).is_err());
    }
}
