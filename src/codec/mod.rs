//! Message payload codecs for B2 proposals.
//!
//! Every message crosses the wire compressed. The proposal code in the
//! announcement line selects the codec:
//!
//! | Code | Codec            | Notes                                     |
//! |------|------------------|-------------------------------------------|
//! | `FC` | [`LzhufCodec`]   | Default. CRC16 framed LZHUF (FBB variant) |
//! | `FD` | [`GzipCodec`]    | Only when both SIDs advertise gzip        |
//! | `FA` | -                | Legacy ASCII, answered with defer         |
//! | `FB` | -                | Legacy basic, answered with defer         |
//!
//! # Usage
//!
//! ```rust,ignore
//! use b2f::codec::ProposalCode;
//!
//! let result = ProposalCode::Wl2k.compress(message_bytes)?;
//! let original = ProposalCode::Wl2k.decompress(&result.data)?;
//! ```

mod algorithm;
mod gzip;
mod lzhuf;

pub use algorithm::{CompressionResult, ProposalCode};
pub use gzip::GzipCodec;
pub use lzhuf::{crc16, LzhufCodec};
