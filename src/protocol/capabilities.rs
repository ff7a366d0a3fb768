//! SID (system identifier) parsing and codec negotiation.
//!
//! Each side announces its feature codes in the SID line of its handshake,
//! e.g. `[WL2K-2.8.4.8-B2FWIHJM$]`. The codes after the last dash are
//! compared case-insensitively.
//!
//! | Code | Meaning                                    |
//! |------|--------------------------------------------|
//! | `B2` | FBB compressed protocol v2 (B2F), required |
//! | `F`  | FBB basic ASCII protocol                   |
//! | `H`  | Hierarchical location designators          |
//! | `M`  | Message identifiers                        |
//! | `G`  | Gzip compressed proposals                  |
//! | `$`  | BID support, always last                   |

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::codec::ProposalCode;
use crate::error::{B2FError, Result};

/// FBB compressed protocol v2 (B2F)
pub const SID_FB_COMP2: &str = "B2";
/// FBB basic ASCII protocol
pub const SID_FB_BASIC: &str = "F";
/// Hierarchical location designators
pub const SID_HL: &str = "H";
/// Message identifiers
pub const SID_MID: &str = "M";
/// Gzip compressed proposals
pub const SID_GZIP: &str = "G";
/// BID support (must be the last code)
pub const SID_BID: &str = "$";

lazy_static! {
    static ref SID_PATTERN: Option<Regex> = Regex::new(r"\[.*-(.*)\]").ok();
}

/// Feature codes announced by a peer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sid(String);

impl Sid {
    /// Parse the feature codes from a SID line.
    pub fn parse(line: &str) -> Result<Self> {
        SID_PATTERN
            .as_ref()
            .and_then(|re| re.captures(line))
            .and_then(|c| c.get(1))
            .map(|m| Sid(m.as_str().to_uppercase()))
            .ok_or_else(|| B2FError::Parse(format!("bad SID line: {line}")))
    }

    /// Whether the peer announced `code`
    pub fn has(&self, code: &str) -> bool {
        self.0.contains(&code.to_uppercase())
    }

    /// Feature codes as announced
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether no SID has been seen
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for Sid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Application identity reported in the SID line.
///
/// Neither field may contain a dash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAgent {
    /// Application name
    pub name: String,
    /// Application version
    pub version: String,
}

impl Default for UserAgent {
    fn default() -> Self {
        Self {
            name: "b2f".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Local capabilities
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Capabilities {
    /// Identity reported to the remote
    pub user_agent: UserAgent,
    /// Offer and accept gzip compressed proposals
    pub gzip: bool,
}

impl Capabilities {
    /// Create with the default user agent and gzip disabled
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the user agent
    pub fn with_user_agent(mut self, name: &str, version: &str) -> Self {
        self.user_agent = UserAgent {
            name: name.replace('-', ""),
            version: version.replace('-', ""),
        };
        self
    }

    /// Enable gzip compressed proposals
    pub fn with_gzip(mut self, enabled: bool) -> Self {
        self.gzip = enabled;
        self
    }

    /// Local feature codes
    pub fn sid_codes(&self) -> String {
        let gzip = if self.gzip { SID_GZIP } else { "" };
        format!("{SID_FB_COMP2}{SID_FB_BASIC}{SID_HL}{SID_MID}{gzip}{SID_BID}")
    }

    /// Local SID line (without CR)
    pub fn sid_line(&self) -> String {
        format!(
            "[{}-{}-{}]",
            self.user_agent.name,
            self.user_agent.version,
            self.sid_codes()
        )
    }

    /// Proposal code to use for every outbound message in a session with
    /// a peer announcing `remote`.
    pub fn negotiate(&self, remote: &Sid) -> ProposalCode {
        if self.gzip && remote.has(SID_GZIP) {
            ProposalCode::Gzip
        } else {
            ProposalCode::Wl2k
        }
    }
}
