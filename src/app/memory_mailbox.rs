//! In-memory mailbox.

use std::collections::HashSet;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::protocol::{Address, MailboxHandler, Message, Proposal, ProposalAnswer};

#[derive(Default)]
struct Folders {
    outbox: Vec<Message>,
    inbox: Vec<Message>,
    sent: Vec<String>,
    deferred: HashSet<String>,
    received: HashSet<String>,
}

/// Mailbox keeping every folder in memory.
#[derive(Default)]
pub struct MemoryMailbox {
    folders: Mutex<Folders>,
}

impl MemoryMailbox {
    /// Create an empty mailbox
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a message for sending
    pub async fn post(&self, msg: Message) {
        self.folders.lock().await.outbox.push(msg);
    }

    /// Messages waiting to be sent
    pub async fn outbox(&self) -> Vec<Message> {
        self.folders.lock().await.outbox.clone()
    }

    /// Received messages, oldest first
    pub async fn inbox(&self) -> Vec<Message> {
        self.folders.lock().await.inbox.clone()
    }

    /// MIDs delivered (or already held by the remote)
    pub async fn sent(&self) -> Vec<String> {
        self.folders.lock().await.sent.clone()
    }

    /// Whether the remote deferred `mid`
    pub async fn is_deferred(&self, mid: &str) -> bool {
        self.folders.lock().await.deferred.contains(mid)
    }
}

#[async_trait]
impl MailboxHandler for MemoryMailbox {
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    async fn get_outbound(&self, fw: &[Address]) -> Vec<Message> {
        let folders = self.folders.lock().await;
        folders
            .outbox
            .iter()
            .filter(|msg| fw.is_empty() || fw.iter().any(|addr| msg.is_only_receiver(addr)))
            .cloned()
            .collect()
    }

    async fn set_sent(&self, mid: &str, rejected: bool) {
        let mut folders = self.folders.lock().await;
        folders.outbox.retain(|msg| msg.mid() != mid);
        folders.deferred.remove(mid);
        folders.sent.push(mid.to_string());
        if rejected {
            tracing::debug!("{} was already delivered", mid);
        }
    }

    async fn set_deferred(&self, mid: &str) {
        self.folders.lock().await.deferred.insert(mid.to_string());
    }

    async fn process_inbound(&self, msgs: Vec<Message>) -> Result<()> {
        let mut folders = self.folders.lock().await;
        for msg in msgs {
            folders.received.insert(msg.mid().to_string());
            folders.inbox.push(msg);
        }
        Ok(())
    }

    async fn get_inbound_answer(&self, proposal: &Proposal) -> ProposalAnswer {
        if self.folders.lock().await.received.contains(proposal.mid()) {
            ProposalAnswer::Reject
        } else {
            ProposalAnswer::Accept
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MsgType;

    fn message(to: &[&str]) -> Message {
        let mut msg = Message::new(MsgType::Private, "LA5NTA");
        msg.add_to(to.iter().copied());
        msg.set_subject("test");
        msg.set_body("hello");
        msg
    }

    #[tokio::test]
    async fn test_outbound_filtered_by_forwarders() {
        let mailbox = MemoryMailbox::new();
        mailbox.post(message(&["LE1OF"])).await;
        mailbox.post(message(&["LE1OF", "N0CALL"])).await;
        mailbox.post(message(&["N0CALL"])).await;

        assert_eq!(mailbox.get_outbound(&[]).await.len(), 3);
        let peer = mailbox.get_outbound(&[Address::new("LE1OF")]).await;
        assert_eq!(peer.len(), 1);
    }

    #[tokio::test]
    async fn test_sent_and_deferred() {
        let mailbox = MemoryMailbox::new();
        let msg = message(&["LE1OF"]);
        let mid = msg.mid().to_string();
        mailbox.post(msg).await;

        mailbox.set_deferred(&mid).await;
        assert!(mailbox.is_deferred(&mid).await);

        mailbox.set_sent(&mid, false).await;
        assert!(mailbox.outbox().await.is_empty());
        assert!(!mailbox.is_deferred(&mid).await);
        assert_eq!(mailbox.sent().await, vec![mid]);
    }

    #[tokio::test]
    async fn test_rejects_duplicates() {
        let mailbox = MemoryMailbox::new();
        let msg = message(&["LA5NTA"]);
        let prop = msg.proposal(crate::codec::ProposalCode::Wl2k).unwrap();

        assert_eq!(mailbox.get_inbound_answer(&prop).await, ProposalAnswer::Accept);
        mailbox.process_inbound(vec![msg]).await.unwrap();
        assert_eq!(mailbox.get_inbound_answer(&prop).await, ProposalAnswer::Reject);
        assert_eq!(mailbox.inbox().await.len(), 1);
    }
}
