//! B2F exchange session.
//!
//! A session is used for exactly one exchange. It performs the handshake,
//! then alternates turns with the remote until one side quits or the
//! connection closes.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};

use super::address::Address;
use super::capabilities::{Capabilities, Sid};
use super::handshake::{read_handshake, write_handshake, LocalHandshake};
use super::line::{peek_byte, read_line, write_line};
use super::mailbox::{MailboxHandler, SecureLoginHandler, StatusObserver, StatusReporter, TrafficStats};
use super::proposal::{
    answer_line, block_checksum, parse_answer_line, Proposal, ProposalAnswer, MAX_BLOCK_SIZE,
};
use super::secure::secure_login_response;
use super::transfer::{read_compressed, write_compressed};
use crate::codec::ProposalCode;
use crate::error::{B2FError, Result};

/// Session state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not started
    Init,
    /// Exchanging handshake blocks
    Handshaking,
    /// Proposing our outbound messages
    LocalTurn,
    /// Answering the remote's proposals
    RemoteTurn,
    /// Finished, successfully or not
    Done,
}

/// B2F protocol session
pub struct Session {
    mycall: String,
    targetcall: String,
    locator: String,
    motd: Vec<String>,
    master: bool,
    capabilities: Capabilities,

    mailbox: Option<Arc<dyn MailboxHandler>>,
    observer: Option<Arc<dyn StatusObserver>>,
    secure_login: Option<Arc<dyn SecureLoginHandler>>,

    /// Login address first, then auxiliary addresses
    local_fw: Vec<Address>,
    remote_sid: Sid,
    remote_fw: Vec<Address>,
    code: ProposalCode,

    state: SessionState,
    stats: TrafficStats,
    quit_received: bool,
    quit_sent: bool,
    remote_no_msgs: bool,
    /// MIDs already offered during this session
    proposed: HashSet<String>,
}

impl Session {
    /// Create a session for `mycall` talking to `targetcall`.
    pub fn new(mycall: &str, targetcall: &str, locator: &str) -> Self {
        Self {
            mycall: mycall.to_string(),
            targetcall: targetcall.to_string(),
            locator: locator.to_string(),
            motd: Vec::new(),
            master: false,
            capabilities: Capabilities::default(),
            mailbox: None,
            observer: None,
            secure_login: None,
            local_fw: vec![Address::new(mycall)],
            remote_sid: Sid::default(),
            remote_fw: Vec::new(),
            code: ProposalCode::default(),
            state: SessionState::Init,
            stats: TrafficStats::default(),
            quit_received: false,
            quit_sent: false,
            remote_no_msgs: false,
            proposed: HashSet::new(),
        }
    }

    /// Set the mailbox. Without one, every inbound proposal is deferred and
    /// nothing is sent.
    pub fn with_mailbox(mut self, mailbox: Arc<dyn MailboxHandler>) -> Self {
        self.mailbox = Some(mailbox);
        self
    }

    /// Receive transfer progress updates
    pub fn with_status_observer(mut self, observer: Arc<dyn StatusObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Credential callback used when the remote issues a secure login challenge
    pub fn with_secure_login_handler(mut self, handler: Arc<dyn SecureLoginHandler>) -> Self {
        self.secure_login = Some(handler);
        self
    }

    /// Also fetch messages for these addresses
    pub fn with_aux_addresses(mut self, addrs: impl IntoIterator<Item = Address>) -> Self {
        self.local_fw.extend(addrs);
        self
    }

    /// Lines sent ahead of the handshake when master
    pub fn with_motd(mut self, motd: Vec<String>) -> Self {
        self.motd = motd;
        self
    }

    /// Local capabilities
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Act as the answering side
    pub fn with_master(mut self, master: bool) -> Self {
        self.master = master;
        self
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the exchange has finished
    pub fn done(&self) -> bool {
        self.state == SessionState::Done
    }

    /// Whether this is the answering side
    pub fn is_master(&self) -> bool {
        self.master
    }

    /// Local callsign
    pub fn mycall(&self) -> &str {
        &self.mycall
    }

    /// Remote callsign
    pub fn targetcall(&self) -> &str {
        &self.targetcall
    }

    /// Remote feature codes, empty before the handshake
    pub fn remote_sid(&self) -> &Sid {
        &self.remote_sid
    }

    /// Addresses the remote forwards for. Empty for a CMS.
    pub fn remote_forwarders(&self) -> &[Address] {
        &self.remote_fw
    }

    /// Proposal code negotiated for this session
    pub fn proposal_code(&self) -> ProposalCode {
        self.code
    }

    /// Traffic so far. Valid after `exchange` regardless of its outcome.
    pub fn stats(&self) -> TrafficStats {
        self.stats.clone()
    }

    /// Run the exchange over `stream` and close it.
    ///
    /// Calling this again after the session is done returns the final
    /// stats without touching the stream.
    pub async fn exchange<S>(&mut self, stream: S) -> Result<TrafficStats>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        if self.done() {
            return Ok(self.stats());
        }

        let (rd, wr) = tokio::io::split(stream);
        let mut rd = BufReader::new(rd);
        let mut wr = BufWriter::new(wr);
        let reporter = self.observer.clone().map(StatusReporter::spawn);

        let result = self.run(&mut rd, &mut wr, reporter.as_ref()).await;
        let handshake_done = matches!(
            self.state,
            SessionState::LocalTurn | SessionState::RemoteTurn
        );
        self.state = SessionState::Done;

        match result {
            Ok(()) => {
                let _ = wr.shutdown().await;
                Ok(self.stats())
            },
            Err(e) if e.is_eof() && handshake_done => {
                tracing::info!("Connection closed by {}", self.targetcall);
                Ok(self.stats())
            },
            Err(e) => {
                if !e.is_eof() {
                    let _ = write_line(&mut wr, &format!("*** {e}")).await;
                    let _ = wr.flush().await;
                }
                let _ = wr.shutdown().await;
                Err(e)
            },
        }
    }

    async fn run<R, W>(
        &mut self,
        rd: &mut R,
        wr: &mut W,
        reporter: Option<&StatusReporter>,
    ) -> Result<()>
    where
        R: AsyncBufRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        if let Some(mailbox) = &self.mailbox {
            mailbox.prepare().await?;
        }

        self.state = SessionState::Handshaking;
        self.handshake(rd, wr).await?;
        self.code = self.capabilities.negotiate(&self.remote_sid);
        tracing::info!(
            "Handshake with {} complete (sid {}, using {})",
            self.targetcall,
            self.remote_sid,
            self.code
        );

        let mut my_turn = !self.master;
        loop {
            if my_turn {
                self.state = SessionState::LocalTurn;
                self.quit_sent = self.handle_outbound(rd, wr, reporter).await?;
            } else {
                self.state = SessionState::RemoteTurn;
                self.quit_received = self.handle_inbound(rd, wr, reporter).await?;
            }

            if self.quit_sent || self.quit_received {
                return Ok(());
            }
            my_turn = !my_turn;
        }
    }

    fn local_handshake(&self, fw: Vec<String>, secure_response: Option<String>) -> LocalHandshake {
        LocalHandshake {
            motd: self.motd.clone(),
            fw,
            sid_line: self.capabilities.sid_line(),
            secure_response,
            targetcall: self.targetcall.clone(),
            mycall: self.mycall.clone(),
            locator: self.locator.clone(),
            master: self.master,
        }
    }

    async fn handshake<R, W>(&mut self, rd: &mut R, wr: &mut W) -> Result<()>
    where
        R: AsyncBufRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let plain_fw: Vec<String> = self.local_fw.iter().map(Address::to_string).collect();

        if self.master {
            write_handshake(wr, &self.local_handshake(plain_fw.clone(), None)).await?;
        }

        let remote = read_handshake(rd).await?;
        self.remote_sid = remote.sid;
        self.remote_fw = remote.fw;

        if !self.master {
            let (fw, response) = match &remote.secure_challenge {
                Some(challenge) => self.secure_login(challenge).await?,
                None => (plain_fw, None),
            };
            write_handshake(wr, &self.local_handshake(fw, response)).await?;
        } else if remote.secure_challenge.is_some() {
            tracing::warn!("Ignoring secure login challenge from {}", self.targetcall);
        }
        Ok(())
    }

    /// Resolve the login response and the `;FW` entries for a challenge.
    async fn secure_login(&self, challenge: &str) -> Result<(Vec<String>, Option<String>)> {
        let handler = self.secure_login.as_ref().ok_or_else(|| {
            B2FError::SecureLogin("got secure login challenge but no password handler is set".to_string())
        })?;

        let login = &self.local_fw[0];
        let password = handler.password(login).await?;
        let response = secure_login_response(challenge, &password);

        let mut fw = vec![login.to_string()];
        for aux in &self.local_fw[1..] {
            match handler.password(aux).await {
                Ok(password) if !password.is_empty() => {
                    fw.push(format!("{aux}|{}", secure_login_response(challenge, &password)));
                },
                Ok(_) => fw.push(aux.to_string()),
                Err(e) => {
                    tracing::warn!("No password for auxiliary address {}: {}", aux, e);
                    fw.push(aux.to_string());
                },
            }
        }
        Ok((fw, Some(response)))
    }

    /// Pending outbound proposals not yet offered in this session.
    async fn outbound(&self) -> Vec<Proposal> {
        let Some(mailbox) = &self.mailbox else {
            return Vec::new();
        };

        mailbox
            .get_outbound(&self.remote_fw)
            .await
            .into_iter()
            .filter(|msg| !self.proposed.contains(msg.mid()))
            .filter_map(|msg| match msg.proposal(self.code) {
                Ok(prop) => Some(prop),
                Err(e) => {
                    tracing::warn!("Ignoring outbound message {}: {}", msg.mid(), e);
                    None
                },
            })
            .collect()
    }

    /// Local turn. Returns true when we sent quit.
    async fn handle_outbound<R, W>(
        &mut self,
        rd: &mut R,
        wr: &mut W,
        reporter: Option<&StatusReporter>,
    ) -> Result<bool>
    where
        R: AsyncBufRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let delivered = loop {
            let outbound = self.outbound().await;
            if outbound.is_empty() {
                if self.remote_no_msgs {
                    write_line(wr, "FQ").await?;
                    wr.flush().await?;
                    return Ok(true);
                }
                write_line(wr, "FF").await?;
                wr.flush().await?;
                break Vec::new();
            }

            let delivered = self.send_block(rd, wr, outbound, reporter).await?;
            if !delivered.is_empty() {
                break delivered;
            }
        };

        // The remote must take its turn with an F command.
        match peek_byte(rd).await? {
            Some(b'F') => {},
            Some(_) => {
                let line = read_line(rd, true).await?;
                return Err(B2FError::UnexpectedResponse(line));
            },
            None => return Err(B2FError::Eof),
        }

        for mid in delivered {
            if let Some(mailbox) = &self.mailbox {
                mailbox.set_sent(&mid, false).await;
            }
            self.stats.sent.push(mid);
        }
        Ok(false)
    }

    /// Propose one block and transmit what the remote accepts.
    ///
    /// Returns the MIDs that were transmitted.
    async fn send_block<R, W>(
        &mut self,
        rd: &mut R,
        wr: &mut W,
        outbound: Vec<Proposal>,
        reporter: Option<&StatusReporter>,
    ) -> Result<Vec<String>>
    where
        R: AsyncBufRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let mut block: Vec<Proposal> = outbound.into_iter().take(MAX_BLOCK_SIZE).collect();
        let lines: Vec<String> = block.iter().map(Proposal::announcement).collect();

        for (prop, line) in block.iter().zip(&lines) {
            self.proposed.insert(prop.mid().to_string());
            write_line(wr, line).await?;
        }
        let checksum = block_checksum(lines.iter().map(String::as_str));
        write_line(wr, &format!("F> {checksum:02X}")).await?;
        wr.flush().await?;

        let reply = read_line(rd, true).await?;
        if !reply.starts_with("FS ") {
            return Err(B2FError::Protocol(format!(
                "Expected proposal answer from remote. Got: '{reply}'"
            )));
        }
        parse_answer_line(&reply, &mut block)?;

        let mut delivered = Vec::new();
        for prop in &block {
            match prop.answer() {
                ProposalAnswer::Defer => {
                    if let Some(mailbox) = &self.mailbox {
                        mailbox.set_deferred(prop.mid()).await;
                    }
                },
                ProposalAnswer::Reject => {
                    if let Some(mailbox) = &self.mailbox {
                        mailbox.set_sent(prop.mid(), true).await;
                    }
                },
                ProposalAnswer::Accept => {
                    write_compressed(wr, prop, reporter).await?;
                    delivered.push(prop.mid().to_string());
                },
            }
        }
        Ok(delivered)
    }

    /// Remote turn. Returns true when the remote sent quit.
    async fn handle_inbound<R, W>(
        &mut self,
        rd: &mut R,
        wr: &mut W,
        reporter: Option<&StatusReporter>,
    ) -> Result<bool>
    where
        R: AsyncBufRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let mut proposals: Vec<Proposal> = Vec::new();
        let mut lines: Vec<String> = Vec::new();
        let mut accepted = 0;
        let mut quit = false;

        loop {
            let line = read_line(rd, true).await?;
            if line.is_empty() || line.starts_with(';') {
                continue;
            }

            let cmd = line.as_bytes();
            if cmd[0] != b'F' || cmd.len() < 2 {
                return Err(B2FError::Protocol(format!(
                    "Got unexpected protocol line: '{line}'"
                )));
            }

            match cmd[1] {
                b'A' | b'B' | b'C' | b'D' => {
                    proposals.push(Proposal::parse(&line)?);
                    lines.push(line);
                },
                b'F' => break,
                b'Q' => {
                    quit = true;
                    break;
                },
                b'>' => {
                    let theirs = u8::from_str_radix(line.get(2..).unwrap_or("").trim(), 16)
                        .map_err(|_| B2FError::Protocol(format!("Malformed checksum line: '{line}'")))?;
                    if theirs != block_checksum(lines.iter().map(String::as_str)) {
                        return Err(B2FError::BadChecksum);
                    }
                    if proposals.is_empty() {
                        return Ok(false);
                    }

                    accepted = self.answer_block(wr, &mut proposals).await?;
                    if accepted > 0 {
                        break;
                    }
                    proposals.clear();
                    lines.clear();
                },
                other => {
                    return Err(B2FError::Protocol(format!(
                        "Unknown protocol command '{}'",
                        other as char
                    )));
                },
            }
        }

        if quit && accepted > 0 {
            return Err(B2FError::Protocol(
                "Got quit command while accepted proposals were pending".to_string(),
            ));
        }

        self.remote_no_msgs = accepted == 0;
        for prop in proposals
            .iter_mut()
            .filter(|p| p.answer() == ProposalAnswer::Accept)
        {
            read_compressed(rd, prop, reporter).await?;
            let msg = prop.message()?;
            tracing::info!("Received {} ({})", prop.mid(), prop.title());
            if let Some(mailbox) = &self.mailbox {
                mailbox.process_inbound(vec![msg]).await?;
            }
            self.stats.received.push(prop.mid().to_string());
        }
        Ok(quit)
    }

    /// Answer a proposal block. Returns the number accepted.
    async fn answer_block<W>(&self, wr: &mut W, proposals: &mut [Proposal]) -> Result<usize>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut supported = Vec::new();
        for (i, prop) in proposals.iter_mut().enumerate() {
            prop.set_answer(ProposalAnswer::Defer);
            if prop.code().is_b2() {
                supported.push(i);
            } else {
                tracing::info!("Deferring {} proposal (unsupported format)", prop.code());
            }
        }

        if let Some(mailbox) = &self.mailbox {
            let candidates: Vec<Proposal> = supported.iter().map(|&i| proposals[i].clone()).collect();
            if !candidates.is_empty() {
                let answers = mailbox.get_inbound_answers(&candidates).await;
                for (&i, answer) in supported.iter().zip(answers) {
                    proposals[i].set_answer(answer);
                }
            }
        }

        write_line(wr, &answer_line(proposals)).await?;
        wr.flush().await?;

        Ok(proposals
            .iter()
            .filter(|p| p.answer() == ProposalAnswer::Accept)
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_builder() {
        let session = Session::new("LA5NTA", "LA1B-10", "JO39EQ")
            .with_aux_addresses([Address::new("EMCOMM")])
            .with_master(true);
        assert!(session.is_master());
        assert_eq!(session.local_fw.len(), 2);
        assert_eq!(session.state(), SessionState::Init);
        assert!(session.remote_sid().is_empty());
    }

    #[tokio::test]
    async fn test_eof_before_handshake_fails() {
        let (local, remote) = tokio::io::duplex(1024);
        drop(remote);

        let mut session = Session::new("LA5NTA", "LA1B-10", "JO39EQ");
        let err = session.exchange(local).await.unwrap_err();
        assert!(err.is_eof());
        assert!(session.done());

        let (again, _remote) = tokio::io::duplex(16);
        assert_eq!(session.exchange(again).await.unwrap(), TrafficStats::default());
    }

    #[tokio::test]
    async fn test_non_b2f_remote_gets_error_line() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let mut session = Session::new("LA5NTA", "LA1B-10", "");

        let peer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            remote.write_all(b"[FBB-7.0-FHM$]\rLA1B>\r").await.unwrap();
            let mut out = Vec::new();
            remote.read_to_end(&mut out).await.unwrap();
            String::from_utf8_lossy(&out).to_string()
        });

        assert!(matches!(
            session.exchange(local).await,
            Err(B2FError::RemoteNotB2F)
        ));
        let wire = peer.await.unwrap();
        assert!(wire.starts_with("***"));
    }

    #[tokio::test]
    async fn test_challenge_without_handler() {
        let (local, mut remote) = tokio::io::duplex(4096);
        let mut session = Session::new("LA5NTA", "LA1B-10", "");

        let peer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            remote
                .write_all(b"[WL2K-5.0-B2FWIHJM$]\r;PQ: 23753528\rCMS>\r")
                .await
                .unwrap();
            let mut out = Vec::new();
            remote.read_to_end(&mut out).await.unwrap();
        });

        assert!(matches!(
            session.exchange(local).await,
            Err(B2FError::SecureLogin(_))
        ));
        peer.await.unwrap();
    }
}
