//! Gzip compression codec (ProposalCode::Gzip).
//!
//! Only used when both ends advertise the gzip extension in their SID and
//! the feature is enabled locally.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

use crate::error::{B2FError, Result};

/// Gzip codec
#[derive(Clone)]
pub struct GzipCodec {
    /// Compression level (0-9)
    pub level: u32,
}

impl Default for GzipCodec {
    fn default() -> Self {
        Self { level: 9 }
    }
}

impl GzipCodec {
    /// Create new gzip codec with best compression
    pub fn new() -> Self {
        Self::default()
    }

    /// Compress bytes to gzip format
    pub fn compress_bytes(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::new(self.level.min(9)));
        encoder
            .write_all(data)
            .map_err(|e| B2FError::Compression(e.to_string()))?;
        encoder
            .finish()
            .map_err(|e| B2FError::Compression(e.to_string()))
    }

    /// Decompress gzip bytes
    pub fn decompress_bytes(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = GzDecoder::new(data);
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| B2FError::Decompression(e.to_string()))?;
        Ok(decompressed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_roundtrip() {
        let codec = GzipCodec::new();
        let original = b"Hello, gzip! This is a test of byte compression.";

        let compressed = codec.compress_bytes(original).unwrap();
        let decompressed = codec.decompress_bytes(&compressed).unwrap();

        assert_eq!(decompressed, original);
    }

    #[test]
    fn test_corrupt_payload_fails() {
        let codec = GzipCodec::new();
        let mut compressed = codec.compress_bytes(&b"some text ".repeat(20)).unwrap();
        let mid = compressed.len() / 2;
        compressed[mid] ^= 0xff;
        compressed.truncate(compressed.len() - 2);

        assert!(codec.decompress_bytes(&compressed).is_err());
    }
}
