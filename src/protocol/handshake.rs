//! Handshake exchange.
//!
//! ```text
//! [b2f-0.1.0-B2FHM$]
//! ;FW: LA5NTA LE1OF|12345678
//! ;PR: 72768415
//! ; LA1B-10 DE LA5NTA (JO39EQ)
//! ```
//!
//! The master sends first, optionally preceded by MOTD lines, and ends its
//! block with a `>` prompt. Reading stops at a line ending with `>` or when
//! the remote starts its first turn with an `F` command.

use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};

use super::address::Address;
use super::capabilities::{Sid, SID_FB_COMP2};
use super::line::{peek_byte, read_line, write_line};
use crate::error::{B2FError, Result};

/// What the remote announced during its handshake
#[derive(Debug, Clone, Default)]
pub struct RemoteHandshake {
    /// Remote feature codes
    pub sid: Sid,
    /// Addresses the remote forwards for
    pub fw: Vec<Address>,
    /// Secure login challenge, if the remote sent one
    pub secure_challenge: Option<String>,
}

/// Local handshake block contents
#[derive(Debug, Clone, Default)]
pub(crate) struct LocalHandshake {
    pub motd: Vec<String>,
    /// `;FW` entries, each `addr` or `addr|token`
    pub fw: Vec<String>,
    pub sid_line: String,
    pub secure_response: Option<String>,
    pub targetcall: String,
    pub mycall: String,
    pub locator: String,
    pub master: bool,
}

impl LocalHandshake {
    /// Handshake lines in wire order, without CR.
    pub(crate) fn lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        if self.master {
            lines.extend(self.motd.iter().cloned());
        }
        if !self.fw.is_empty() {
            lines.push(format!(";FW: {}", self.fw.join(" ")));
        }
        lines.push(self.sid_line.clone());
        if let Some(token) = &self.secure_response {
            lines.push(format!(";PR: {token}"));
        }

        let mut greeting = format!("; {} DE {}", self.targetcall, self.mycall);
        if !self.locator.is_empty() {
            greeting.push_str(&format!(" ({})", self.locator));
        }
        if self.master {
            greeting.push('>');
        }
        lines.push(greeting);
        lines
    }
}

/// Write the local handshake block and flush.
pub(crate) async fn write_handshake<W: AsyncWrite + Unpin>(
    wr: &mut W,
    hs: &LocalHandshake,
) -> Result<()> {
    for line in hs.lines() {
        write_line(wr, &line).await?;
    }
    wr.flush().await?;
    Ok(())
}

/// Read the remote handshake block.
pub(crate) async fn read_handshake<R: AsyncBufRead + Unpin>(rd: &mut R) -> Result<RemoteHandshake> {
    let mut hs = RemoteHandshake::default();
    let mut seen_sid = false;

    loop {
        match peek_byte(rd).await? {
            Some(b'F') => break,
            None => return Err(B2FError::Eof),
            Some(_) => {},
        }

        let line = read_line(rd, false).await?;

        if line.starts_with("***") {
            tracing::info!("Remote: {}", line);
        } else if line.starts_with(";FW") {
            hs.fw = parse_fw(&line)?;
        } else if line.starts_with('[') {
            let sid = Sid::parse(&line)?;
            if !sid.has(SID_FB_COMP2) {
                return Err(B2FError::RemoteNotB2F);
            }
            hs.sid = sid;
            seen_sid = true;
        } else if let Some(challenge) = line.strip_prefix(";PQ:") {
            hs.secure_challenge = Some(challenge.trim().to_string());
        }

        if line.ends_with('>') {
            break;
        }
    }

    if !seen_sid {
        return Err(B2FError::Protocol("No sid in handshake".to_string()));
    }
    Ok(hs)
}

/// Parse a `;FW:` line into forwarder addresses. Tokens after `|` are dropped.
pub fn parse_fw(line: &str) -> Result<Vec<Address>> {
    let rest = line
        .strip_prefix(";FW:")
        .ok_or_else(|| B2FError::Parse(format!("malformed forward line: '{line}'")))?;

    Ok(rest
        .split_whitespace()
        .map(|entry| entry.split('|').next().unwrap_or(entry))
        .filter(|addr| !addr.is_empty())
        .map(Address::new)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[test]
    fn test_parse_fw() {
        let fw = parse_fw(";FW: LE1OF LA5NTA").unwrap();
        assert_eq!(fw, vec![Address::new("LE1OF"), Address::new("LA5NTA")]);

        let fw = parse_fw(";FW: LA5NTA|12345678 N0CALL").unwrap();
        assert_eq!(fw[0].addr, "LA5NTA");
        assert_eq!(fw.len(), 2);

        assert!(parse_fw(";FW:").unwrap().is_empty());
        assert!(parse_fw("FW: LA5NTA").is_err());
    }

    #[test]
    fn test_local_lines() {
        let hs = LocalHandshake {
            fw: vec!["LA5NTA".to_string()],
            sid_line: "[b2f-1.0-B2FHM$]".to_string(),
            targetcall: "LA1B-10".to_string(),
            mycall: "LA5NTA".to_string(),
            locator: "JO39EQ".to_string(),
            ..Default::default()
        };
        assert_eq!(
            hs.lines(),
            vec![";FW: LA5NTA", "[b2f-1.0-B2FHM$]", "; LA1B-10 DE LA5NTA (JO39EQ)"]
        );

        let master = LocalHandshake {
            master: true,
            motd: vec!["Welcome".to_string()],
            secure_response: Some("72768415".to_string()),
            ..hs
        };
        let lines = master.lines();
        assert_eq!(lines[0], "Welcome");
        assert_eq!(lines[3], ";PR: 72768415");
        assert!(lines[4].ends_with('>'));
    }

    #[tokio::test]
    async fn test_read_cms_handshake() {
        let input = b"*** Welcome\r[WL2K-5.0-B2FWIHJM$]\r;PQ: 23753528\rCMS>\r";
        let mut rd = BufReader::new(&input[..]);
        let hs = read_handshake(&mut rd).await.unwrap();
        assert!(hs.sid.has("B2"));
        assert_eq!(hs.secure_challenge.as_deref(), Some("23753528"));
        assert!(hs.fw.is_empty());
    }

    #[tokio::test]
    async fn test_read_peer_handshake_stops_at_f() {
        let input = b";FW: LE1OF\r[b2f-1-B2FHM$]\r; LA5NTA DE LE1OF\rFF\r";
        let mut rd = BufReader::new(&input[..]);
        let hs = read_handshake(&mut rd).await.unwrap();
        assert_eq!(hs.fw, vec![Address::new("LE1OF")]);
        assert_eq!(peek_byte(&mut rd).await.unwrap(), Some(b'F'));
    }

    #[tokio::test]
    async fn test_read_handshake_errors() {
        let mut rd = BufReader::new(&b"[FBB-7-FHM$]\rFF\r"[..]);
        assert!(matches!(read_handshake(&mut rd).await, Err(B2FError::RemoteNotB2F)));

        let mut rd = BufReader::new(&b"; hello>\r"[..]);
        assert!(matches!(read_handshake(&mut rd).await, Err(B2FError::Protocol(_))));

        let mut rd = BufReader::new(&b"[WL2K-5.0-B2FHM$]\r"[..]);
        assert!(read_handshake(&mut rd).await.unwrap_err().is_eof());
    }
}
