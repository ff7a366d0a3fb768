//! Session collaborators: mailbox, credential callback, progress observer.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::address::Address;
use super::message::Message;
use super::proposal::{Proposal, ProposalAnswer};
use crate::error::Result;

/// Status updates queued for the observer before new ones are dropped.
pub const STATUS_QUEUE_SIZE: usize = 32;

/// Message store consulted by a session.
#[async_trait]
pub trait MailboxHandler: Send + Sync {
    /// Called before anything crosses the wire. An error aborts the
    /// exchange and is forwarded to the remote.
    async fn prepare(&self) -> Result<()>;

    /// Pending outbound messages addressed to (and only to) one of `fw`.
    ///
    /// An empty `fw` means the remote is a CMS and may take everything.
    async fn get_outbound(&self, fw: &[Address]) -> Vec<Message>;

    /// Mark a message as delivered. `rejected` means the remote already had it.
    async fn set_sent(&self, mid: &str, rejected: bool);

    /// Mark a message as deferred by the remote.
    async fn set_deferred(&self, mid: &str);

    /// Persist received messages.
    async fn process_inbound(&self, msgs: Vec<Message>) -> Result<()>;

    /// Decide on one inbound proposal. Already received MIDs should be
    /// rejected.
    async fn get_inbound_answer(&self, proposal: &Proposal) -> ProposalAnswer;

    /// Decide on a block of inbound proposals, positionally.
    async fn get_inbound_answers(&self, proposals: &[Proposal]) -> Vec<ProposalAnswer> {
        let mut answers = Vec::with_capacity(proposals.len());
        for p in proposals {
            answers.push(self.get_inbound_answer(p).await);
        }
        answers
    }
}

/// Resolves secure login passwords.
#[async_trait]
pub trait SecureLoginHandler: Send + Sync {
    /// Password for `addr`. May prompt an operator.
    async fn password(&self, addr: &Address) -> Result<String>;
}

/// Receives transfer progress.
pub trait StatusObserver: Send + Sync {
    /// Called from a dedicated task; must not assume it runs on the session task.
    fn update_status(&self, status: Status);
}

/// Transfer direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Outbound transfer
    Sending,
    /// Inbound transfer
    Receiving,
}

/// Progress snapshot of one proposal transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// Message ID
    pub mid: String,
    /// Proposal title
    pub title: String,
    /// Compressed bytes moved so far
    pub bytes_transferred: usize,
    /// Compressed size
    pub bytes_total: usize,
    /// Transfer direction
    pub direction: Direction,
    /// Final snapshot for this transfer
    pub done: bool,
}

/// Message traffic of one exchange
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficStats {
    /// MIDs fully delivered to the remote
    pub sent: Vec<String>,
    /// MIDs fully received from the remote
    pub received: Vec<String>,
}

/// Bounded, non-blocking status delivery to an observer task.
pub(crate) struct StatusReporter {
    tx: mpsc::Sender<Status>,
}

impl StatusReporter {
    /// Start the draining task. Stops when the reporter is dropped.
    pub(crate) fn spawn(observer: Arc<dyn StatusObserver>) -> Self {
        let (tx, mut rx) = mpsc::channel::<Status>(STATUS_QUEUE_SIZE);
        tokio::spawn(async move {
            while let Some(status) = rx.recv().await {
                observer.update_status(status);
            }
        });
        Self { tx }
    }

    /// Queue a snapshot, dropping it if the observer is behind.
    pub(crate) fn report(&self, status: Status) {
        if self.tx.try_send(status).is_err() {
            tracing::trace!("Status observer lagging, dropping update");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Collect(Mutex<Vec<Status>>);

    impl StatusObserver for Collect {
        fn update_status(&self, status: Status) {
            self.0.lock().unwrap().push(status);
        }
    }

    fn status(n: usize) -> Status {
        Status {
            mid: "MID".to_string(),
            title: "t".to_string(),
            bytes_transferred: n,
            bytes_total: 10,
            direction: Direction::Sending,
            done: n == 10,
        }
    }

    #[tokio::test]
    async fn test_reporter_delivers() {
        let observer = Arc::new(Collect(Mutex::new(Vec::new())));
        let reporter = StatusReporter::spawn(observer.clone());
        reporter.report(status(5));
        reporter.report(status(10));
        drop(reporter);

        for _ in 0..50 {
            if observer.0.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        let seen = observer.0.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen[1].done);
    }

    #[tokio::test]
    async fn test_reporter_never_blocks() {
        struct Slow;
        impl StatusObserver for Slow {
            fn update_status(&self, _: Status) {
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
        }

        let reporter = StatusReporter::spawn(Arc::new(Slow));
        let start = std::time::Instant::now();
        for i in 0..(STATUS_QUEUE_SIZE * 4) {
            reporter.report(status(i));
        }
        assert!(start.elapsed() < std::time::Duration::from_millis(100));
    }
}
