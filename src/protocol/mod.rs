//! B2F forwarding protocol: message format, proposals and the exchange session.
//!
//! # Protocol Overview
//!
//! A B2F exchange runs over any ordered byte stream. After a handshake the
//! two sides take turns offering messages in blocks of up to five
//! proposals. Accepted proposals are transferred as compressed blocks.
//!
//! ```text
//! Client (non-master)                    CMS / peer (master)
//!    |                                      |
//!    |<------ MOTD, SID, greeting> --------|  Master sends first
//!    |------- ;FW, SID, ;PR, greeting ---->|
//!    |                                      |
//!    |------- FC EM <mid> ... / F> XX ---->|  Local turn: propose
//!    |<------ FS +-= ----------------------|  Answers
//!    |======= SOH/STX.../EOT =============>|  Accepted data
//!    |                                      |
//!    |<------ FC ... / F> XX  or  FF ------|  Remote turn
//!    |------- FS ... --------------------->|
//!    |<====== SOH/STX.../EOT ==============|
//!    |                                      |
//!    |------- FQ ------------------------->|  Nothing left either way
//! ```
//!
//! ## State Machine
//!
//! | State         | Description                         | Next                     |
//! |---------------|-------------------------------------|--------------------------|
//! | `Init`        | Created, mailbox not yet prepared   | → Handshaking, Done      |
//! | `Handshaking` | Exchanging handshake blocks         | → LocalTurn, RemoteTurn  |
//! | `LocalTurn`   | Proposing outbound messages         | → RemoteTurn, Done       |
//! | `RemoteTurn`  | Answering inbound proposals         | → LocalTurn, Done        |
//! | `Done`        | Terminated (terminal)               |                          |
//!
//! ## Proposal Answers
//!
//! | Answer  | Sent | Also accepted     | Meaning                        |
//! |---------|------|-------------------|--------------------------------|
//! | Accept  | `+`  | `Y` `H` `!n` `An` | Send it (optionally at offset) |
//! | Reject  | `-`  | `N` `R`           | Already have it                |
//! | Defer   | `=`  | `L`               | Not now, try later             |
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use b2f::protocol::Session;
//!
//! let mut session = Session::new("LA5NTA", "LA1B-10", "JO39EQ")
//!     .with_mailbox(Arc::new(mailbox));
//! let stats = session.exchange(stream).await?;
//! println!("sent {:?}, received {:?}", stats.sent, stats.received);
//! ```

mod address;
mod capabilities;
mod handshake;
mod header;
mod line;
mod mailbox;
mod message;
mod proposal;
mod secure;
mod session;
mod transfer;

pub use address::Address;
pub use capabilities::{Capabilities, Sid, UserAgent, SID_BID, SID_FB_BASIC, SID_FB_COMP2, SID_GZIP, SID_HL, SID_MID};
pub use handshake::{parse_fw, RemoteHandshake};
pub use header::{
    canonical_key, decode_header_value, Header, HEADER_BODY, HEADER_CC, HEADER_CONTENT_TRANSFER_ENCODING,
    HEADER_CONTENT_TYPE, HEADER_DATE, HEADER_FILE, HEADER_FROM, HEADER_MBO, HEADER_MID, HEADER_SUBJECT, HEADER_TO,
    HEADER_TYPE,
};
pub use mailbox::{
    Direction, MailboxHandler, SecureLoginHandler, Status, StatusObserver, TrafficStats, STATUS_QUEUE_SIZE,
};
pub use message::{generate_mid, parse_date, File, Message, MsgType, DATE_LAYOUT, MAX_MID_LENGTH};
pub use proposal::{
    answer_line, block_checksum, parse_answer_line, Proposal, ProposalAnswer, MAX_BLOCK_SIZE,
    PROTOCOL_OFFSET_SIZE_LIMIT,
};
pub use secure::secure_login_response;
pub use session::{Session, SessionState};
pub use transfer::MAX_CHUNK_SIZE;
