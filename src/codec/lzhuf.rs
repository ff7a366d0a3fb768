//! LZHUF compression codec (ProposalCode::Wl2k).
//!
//! Adaptive Huffman coding over an LZSS sliding window, with the FBB
//! parameters (2 KiB window, 60 byte lookahead). B2 payloads are framed as:
//!
//! ```text
//! +--------+-----------------+----------------------+
//! | CRC16  | plaintext length | huffman bitstream   |
//! | 2B LE  | 4B LE            | ...                 |
//! +--------+-----------------+----------------------+
//! ```
//!
//! The CRC is CRC16-XMODEM (poly 0x1021, init 0) over everything after the
//! CRC itself. The smallest valid payload (empty plaintext) is 6 bytes.

use crate::error::{B2FError, Result};

/// Ring buffer size.
const N: usize = 2048;
/// Lookahead buffer size.
const F: usize = 60;
/// Matches of this length or shorter are emitted as literals.
const THRESHOLD: usize = 2;
/// Leaf marker in the binary search trees.
const NIL: usize = N;

/// Kinds of symbols: 256 literals plus match lengths.
const N_CHAR: usize = 256 - THRESHOLD + F;
/// Size of the Huffman table.
const T: usize = N_CHAR * 2 - 1;
/// Root position.
const R: usize = T - 1;
/// Frequencies are halved when the root reaches this.
const MAX_FREQ: u32 = 0x8000;

/// Container header: CRC16 + plaintext length.
pub const HEADER_LEN: usize = 6;

/// Code lengths for the upper 6 bits of a match position.
const P_LEN: [u8; 64] = {
    let mut t = [0u8; 64];
    let mut i = 0;
    while i < 64 {
        t[i] = match i {
            0 => 3,
            1..=3 => 4,
            4..=11 => 5,
            12..=23 => 6,
            24..=47 => 7,
            _ => 8,
        };
        i += 1;
    }
    t
};

/// Canonical codes for the upper 6 bits of a match position.
const P_CODE: [u8; 64] = {
    let mut t = [0u8; 64];
    let mut code: u32 = 0;
    let mut i = 0;
    while i < 64 {
        t[i] = code as u8;
        code += 256 >> P_LEN[i];
        i += 1;
    }
    t
};

/// Decoding tables indexed by the next 8 bits of input.
const D_CODE: [u8; 256] = {
    let mut t = [0u8; 256];
    let mut i = 0;
    while i < 64 {
        let start = P_CODE[i] as usize;
        let span = 256 >> P_LEN[i];
        let mut j = 0;
        while j < span {
            t[start + j] = i as u8;
            j += 1;
        }
        i += 1;
    }
    t
};

const D_LEN: [u8; 256] = {
    let mut t = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        t[i] = P_LEN[D_CODE[i] as usize];
        i += 1;
    }
    t
};

const CRC16_TABLE: [u16; 256] = {
    let mut t = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
            bit += 1;
        }
        t[i] = crc;
        i += 1;
    }
    t
};

/// CRC16-XMODEM of `data`.
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, &b| {
        (crc << 8) ^ CRC16_TABLE[(((crc >> 8) as u8) ^ b) as usize]
    })
}

/// Adaptive Huffman tree shared by the encoder and decoder.
struct Huffman {
    freq: Vec<u32>,
    prnt: Vec<usize>,
    son: Vec<usize>,
}

impl Huffman {
    fn new() -> Self {
        let mut h = Self {
            freq: vec![0; T + 1],
            prnt: vec![0; T + N_CHAR],
            son: vec![0; T],
        };
        for i in 0..N_CHAR {
            h.freq[i] = 1;
            h.son[i] = i + T;
            h.prnt[i + T] = i;
        }
        let mut i = 0;
        let mut j = N_CHAR;
        while j <= R {
            h.freq[j] = h.freq[i] + h.freq[i + 1];
            h.son[j] = i;
            h.prnt[i] = j;
            h.prnt[i + 1] = j;
            i += 2;
            j += 1;
        }
        h.freq[T] = 0xffff;
        h.prnt[R] = 0;
        h
    }

    /// Rebuild the tree with halved frequencies.
    fn reconst(&mut self) {
        let mut j = 0;
        for i in 0..T {
            if self.son[i] >= T {
                self.freq[j] = (self.freq[i] + 1) / 2;
                self.son[j] = self.son[i];
                j += 1;
            }
        }

        let mut i = 0;
        for j in N_CHAR..T {
            let first = self.freq[i] + self.freq[i + 1];
            self.freq[j] = first;
            let mut k = j - 1;
            while first < self.freq[k] {
                k -= 1;
            }
            k += 1;
            self.freq.copy_within(k..j, k + 1);
            self.freq[k] = first;
            self.son.copy_within(k..j, k + 1);
            self.son[k] = i;
            i += 2;
        }

        for i in 0..T {
            let k = self.son[i];
            self.prnt[k] = i;
            if k < T {
                self.prnt[k + 1] = i;
            }
        }
    }

    /// Increment the frequency of symbol `c` and restore the sibling order.
    fn update(&mut self, c: usize) {
        if self.freq[R] == MAX_FREQ {
            self.reconst();
        }
        let mut c = self.prnt[c + T];
        loop {
            self.freq[c] += 1;
            let k = self.freq[c];

            let mut l = c + 1;
            if k > self.freq[l] {
                while k > self.freq[l + 1] {
                    l += 1;
                }
                self.freq[c] = self.freq[l];
                self.freq[l] = k;

                let i = self.son[c];
                self.prnt[i] = l;
                if i < T {
                    self.prnt[i + 1] = l;
                }

                let j = self.son[l];
                self.son[l] = i;

                self.prnt[j] = c;
                if j < T {
                    self.prnt[j + 1] = c;
                }
                self.son[c] = j;

                c = l;
            }

            c = self.prnt[c];
            if c == 0 {
                break;
            }
        }
    }
}

/// MSB-first bit sink with a 16 bit staging buffer.
struct BitWriter {
    out: Vec<u8>,
    buf: u32,
    len: u32,
}

impl BitWriter {
    fn new(out: Vec<u8>) -> Self {
        Self { out, buf: 0, len: 0 }
    }

    /// Output the top `l` bits of the left-aligned 16 bit `c`.
    fn put(&mut self, l: u32, c: u32) {
        self.buf = (self.buf | (c >> self.len)) & 0xffff;
        self.len += l;
        if self.len >= 8 {
            self.out.push((self.buf >> 8) as u8);
            self.len -= 8;
            if self.len >= 8 {
                self.out.push(self.buf as u8);
                self.len -= 8;
                self.buf = (c << (l - self.len)) & 0xffff;
            } else {
                self.buf = (self.buf << 8) & 0xffff;
            }
        }
    }

    fn finish(mut self) -> Vec<u8> {
        if self.len > 0 {
            self.out.push((self.buf >> 8) as u8);
        }
        self.out
    }
}

/// MSB-first bit source. Reads past the end yield zero bits.
struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
    buf: u32,
    len: u32,
    overrun: usize,
}

impl<'a> BitReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            buf: 0,
            len: 0,
            overrun: 0,
        }
    }

    fn fill(&mut self) {
        while self.len <= 8 {
            let b = if let Some(&b) = self.data.get(self.pos) {
                self.pos += 1;
                b
            } else {
                self.overrun += 1;
                0
            };
            self.buf |= (b as u32) << (8 - self.len);
            self.len += 8;
        }
    }

    fn bit(&mut self) -> usize {
        self.fill();
        let bit = (self.buf & 0x8000) != 0;
        self.buf = (self.buf << 1) & 0xffff;
        self.len -= 1;
        usize::from(bit)
    }

    fn byte(&mut self) -> usize {
        self.fill();
        let b = (self.buf >> 8) & 0xff;
        self.buf = (self.buf << 8) & 0xffff;
        self.len -= 8;
        b as usize
    }
}

/// LZSS match finder using per-first-byte binary search trees.
struct MatchTree {
    text: Vec<u8>,
    dad: Vec<usize>,
    lson: Vec<usize>,
    rson: Vec<usize>,
    match_position: usize,
    match_length: usize,
}

impl MatchTree {
    fn new() -> Self {
        // Tree roots live at rson[N + 1 + first_byte].
        Self {
            text: vec![b' '; N + F - 1],
            dad: vec![NIL; N + 1],
            lson: vec![NIL; N + 1],
            rson: vec![NIL; N + 257],
            match_position: 0,
            match_length: 0,
        }
    }

    fn insert(&mut self, r: usize) {
        let mut cmp: i32 = 1;
        let mut p = N + 1 + self.text[r] as usize;
        self.rson[r] = NIL;
        self.lson[r] = NIL;
        self.match_length = 0;

        loop {
            if cmp >= 0 {
                if self.rson[p] == NIL {
                    self.rson[p] = r;
                    self.dad[r] = p;
                    return;
                }
                p = self.rson[p];
            } else {
                if self.lson[p] == NIL {
                    self.lson[p] = r;
                    self.dad[r] = p;
                    return;
                }
                p = self.lson[p];
            }

            let mut i = 1;
            while i < F {
                cmp = i32::from(self.text[r + i]) - i32::from(self.text[p + i]);
                if cmp != 0 {
                    break;
                }
                i += 1;
            }

            if i > THRESHOLD {
                let distance = ((r.wrapping_sub(p)) & (N - 1)).wrapping_sub(1);
                if i > self.match_length {
                    self.match_position = distance;
                    self.match_length = i;
                    if i >= F {
                        break;
                    }
                }
                if i == self.match_length && distance < self.match_position {
                    self.match_position = distance;
                }
            }
        }

        // Full-length match: replace p by r.
        self.dad[r] = self.dad[p];
        self.lson[r] = self.lson[p];
        self.rson[r] = self.rson[p];
        self.dad[self.lson[p]] = r;
        self.dad[self.rson[p]] = r;
        if self.rson[self.dad[p]] == p {
            self.rson[self.dad[p]] = r;
        } else {
            self.lson[self.dad[p]] = r;
        }
        self.dad[p] = NIL;
    }

    fn delete(&mut self, p: usize) {
        if self.dad[p] == NIL {
            return;
        }
        let q = if self.rson[p] == NIL {
            self.lson[p]
        } else if self.lson[p] == NIL {
            self.rson[p]
        } else {
            let mut q = self.lson[p];
            if self.rson[q] != NIL {
                while self.rson[q] != NIL {
                    q = self.rson[q];
                }
                self.rson[self.dad[q]] = self.lson[q];
                self.dad[self.lson[q]] = self.dad[q];
                self.lson[q] = self.lson[p];
                self.dad[self.lson[p]] = q;
            }
            self.rson[q] = self.rson[p];
            self.dad[self.rson[p]] = q;
            q
        };
        self.dad[q] = self.dad[p];
        if self.rson[self.dad[p]] == p {
            self.rson[self.dad[p]] = q;
        } else {
            self.lson[self.dad[p]] = q;
        }
        self.dad[p] = NIL;
    }
}

struct Encoder {
    huff: Huffman,
    bits: BitWriter,
}

impl Encoder {
    fn encode_char(&mut self, c: usize) {
        let mut code: u32 = 0;
        let mut len: u32 = 0;
        let mut k = self.huff.prnt[c + T];
        loop {
            code >>= 1;
            if k & 1 == 1 {
                code += 0x8000;
            }
            len += 1;
            k = self.huff.prnt[k];
            if k == R {
                break;
            }
        }
        self.bits.put(len, code);
        self.huff.update(c);
    }

    fn encode_position(&mut self, c: usize) {
        let i = c >> 6;
        self.bits
            .put(u32::from(P_LEN[i]), u32::from(P_CODE[i]) << 8);
        self.bits.put(6, ((c & 0x3f) as u32) << 10);
    }
}

/// LZHUF codec
#[derive(Clone, Default)]
pub struct LzhufCodec;

impl LzhufCodec {
    /// Create new LZHUF codec
    pub fn new() -> Self {
        Self
    }

    /// Compress bytes to a CRC-framed LZHUF payload
    pub fn compress_bytes(&self, data: &[u8]) -> Result<Vec<u8>> {
        let len = u32::try_from(data.len())
            .map_err(|_| B2FError::Compression("message too large".to_string()))?;

        let mut out = Vec::with_capacity(HEADER_LEN + data.len() / 2);
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&len.to_le_bytes());

        let mut enc = Encoder {
            huff: Huffman::new(),
            bits: BitWriter::new(out),
        };
        let mut tree = MatchTree::new();
        let mut input = data.iter().copied();

        let mut s = 0usize;
        let mut r = N - F;
        let mut len = 0usize;
        while len < F {
            match input.next() {
                Some(c) => tree.text[r + len] = c,
                None => break,
            }
            len += 1;
        }

        if len > 0 {
            for i in 1..=F {
                tree.insert(r - i);
            }
            tree.insert(r);
        }

        while len > 0 {
            if tree.match_length > len {
                tree.match_length = len;
            }
            if tree.match_length <= THRESHOLD {
                tree.match_length = 1;
                enc.encode_char(tree.text[r] as usize);
            } else {
                enc.encode_char(255 - THRESHOLD + tree.match_length);
                enc.encode_position(tree.match_position);
            }

            let last_match_length = tree.match_length;
            let mut i = 0;
            while i < last_match_length {
                let Some(c) = input.next() else { break };
                tree.delete(s);
                tree.text[s] = c;
                if s < F - 1 {
                    tree.text[s + N] = c;
                }
                s = (s + 1) & (N - 1);
                r = (r + 1) & (N - 1);
                tree.insert(r);
                i += 1;
            }
            while i < last_match_length {
                tree.delete(s);
                s = (s + 1) & (N - 1);
                r = (r + 1) & (N - 1);
                len -= 1;
                if len > 0 {
                    tree.insert(r);
                }
                i += 1;
            }
        }

        let mut out = enc.bits.finish();
        let crc = crc16(&out[2..]);
        out[..2].copy_from_slice(&crc.to_le_bytes());
        Ok(out)
    }

    /// Decompress a CRC-framed LZHUF payload
    pub fn decompress_bytes(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < HEADER_LEN {
            return Err(B2FError::Decompression(format!(
                "payload too short ({} bytes)",
                data.len()
            )));
        }

        let expected = u16::from_le_bytes([data[0], data[1]]);
        if crc16(&data[2..]) != expected {
            return Err(B2FError::Decompression("CRC mismatch".to_string()));
        }

        let size = u32::from_le_bytes([data[2], data[3], data[4], data[5]]) as usize;
        let mut out = Vec::with_capacity(size);

        let mut huff = Huffman::new();
        let mut bits = BitReader::new(&data[HEADER_LEN..]);
        let mut text = [b' '; N];
        let mut r = N - F;

        while out.len() < size {
            // The reader keeps at most two bytes of lookahead.
            if bits.overrun > 2 {
                return Err(B2FError::Decompression("truncated bitstream".to_string()));
            }

            let mut c = huff.son[R];
            while c < T {
                c += bits.bit();
                c = huff.son[c];
            }
            c -= T;
            huff.update(c);

            if c < 256 {
                out.push(c as u8);
                text[r] = c as u8;
                r = (r + 1) & (N - 1);
            } else {
                let i = bits.byte();
                let mut j = usize::from(D_LEN[i]) - 2;
                let upper = usize::from(D_CODE[i]) << 6;
                let mut low = i;
                while j > 0 {
                    low = (low << 1) + bits.bit();
                    j -= 1;
                }
                let position = upper | (low & 0x3f);

                let start = (r.wrapping_sub(position).wrapping_sub(1)) & (N - 1);
                let length = c - 255 + THRESHOLD;
                for k in 0..length {
                    let b = text[(start + k) & (N - 1)];
                    out.push(b);
                    text[r] = b;
                    r = (r + 1) & (N - 1);
                }
            }
        }

        out.truncate(size);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_tables() {
        assert_eq!(P_CODE[0], 0x00);
        assert_eq!(P_CODE[1], 0x20);
        assert_eq!(P_CODE[4], 0x50);
        assert_eq!(P_CODE[12], 0x90);
        assert_eq!(P_CODE[24], 0xC0);
        assert_eq!(P_CODE[48], 0xF0);
        assert_eq!(P_CODE[63], 0xFF);
        assert_eq!(D_CODE[0x20], 0x01);
        assert_eq!(D_CODE[0xC1], 0x18);
        assert_eq!(D_LEN[0x1F], 3);
        assert_eq!(D_LEN[0xFF], 8);
    }

    #[test]
    fn test_crc16_xmodem() {
        assert_eq!(crc16(b"123456789"), 0x31C3);
        assert_eq!(crc16(&[]), 0);
    }

    #[test]
    fn test_empty_roundtrip() {
        let codec = LzhufCodec::new();
        let compressed = codec.compress_bytes(&[]).unwrap();
        assert_eq!(compressed.len(), HEADER_LEN);
        assert!(codec.decompress_bytes(&compressed).unwrap().is_empty());
    }

    #[test]
    fn test_text_roundtrip() {
        let codec = LzhufCodec::new();
        let original = "Mid: 8SNZR5SLGNOJ\r\nDate: 2016/12/29 21:04\r\nFrom: LA5NTA\r\n\
                        To: LA1B\r\nSubject: Test\r\nBody: 12\r\n\r\nHello world!"
            .repeat(20);

        let compressed = codec.compress_bytes(original.as_bytes()).unwrap();
        assert!(compressed.len() < original.len() / 4);
        let decompressed = codec.decompress_bytes(&compressed).unwrap();
        assert_eq!(decompressed, original.as_bytes());
    }

    #[test]
    fn test_binary_roundtrip() {
        let codec = LzhufCodec::new();
        // Long enough to wrap the window and trigger tree reconstruction.
        let original: Vec<u8> = (0..80_000u32)
            .map(|i| (i.wrapping_mul(2654435761) >> 13) as u8)
            .collect();

        let compressed = codec.compress_bytes(&original).unwrap();
        assert_eq!(codec.decompress_bytes(&compressed).unwrap(), original);
    }

    #[test]
    fn test_corrupt_payload_fails() {
        let codec = LzhufCodec::new();
        let mut compressed = codec.compress_bytes(&b"corrupt me ".repeat(30)).unwrap();
        let last = compressed.len() - 1;
        compressed[last] ^= 0x55;

        assert!(codec.decompress_bytes(&compressed).is_err());
        assert!(codec.decompress_bytes(&[0, 0, 0]).is_err());
    }

    #[test]
    fn test_truncated_bitstream_fails() {
        let codec = LzhufCodec::new();
        let compressed = codec.compress_bytes(&b"abcdefgh".repeat(40)).unwrap();
        // Keep the header but drop the bitstream, fixing up the CRC.
        let mut truncated = compressed[..HEADER_LEN].to_vec();
        let crc = crc16(&truncated[2..]);
        truncated[..2].copy_from_slice(&crc.to_le_bytes());

        assert!(codec.decompress_bytes(&truncated).is_err());
    }
}
