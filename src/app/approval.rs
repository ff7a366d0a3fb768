//! Operator approval of large inbound messages.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::prompt::{PromptHub, PromptKind, PromptOption, PromptOutcome};
use crate::error::Result;
use crate::protocol::{Address, MailboxHandler, Message, Proposal, ProposalAnswer};

/// How long the operator has to pick messages.
pub const DOWNLOAD_PROMPT_TIMEOUT: Duration = Duration::from_secs(60);

/// Mailbox wrapper that asks before downloading messages at or above a size
/// limit.
///
/// When every proposal in a block is below the limit the inner mailbox
/// decides alone. Otherwise everything the inner mailbox accepted is
/// deferred unless the operator selects it. If the prompt times out, the
/// messages below the limit are taken.
pub struct DownloadApproval {
    inner: Arc<dyn MailboxHandler>,
    prompts: PromptHub,
    /// Compressed size limit in bytes. Negative disables prompting.
    size_limit: i64,
    prompt_timeout: Duration,
}

impl DownloadApproval {
    /// Wrap `inner`
    pub fn new(inner: Arc<dyn MailboxHandler>, prompts: PromptHub, size_limit: i64) -> Self {
        Self {
            inner,
            prompts,
            size_limit,
            prompt_timeout: DOWNLOAD_PROMPT_TIMEOUT,
        }
    }

    /// Override the prompt deadline
    pub fn with_prompt_timeout(mut self, timeout: Duration) -> Self {
        self.prompt_timeout = timeout;
        self
    }

    fn below_limit(&self, p: &Proposal) -> bool {
        (p.compressed_size() as i64) < self.size_limit
    }
}

#[async_trait]
impl MailboxHandler for DownloadApproval {
    async fn prepare(&self) -> Result<()> {
        self.inner.prepare().await
    }

    async fn get_outbound(&self, fw: &[Address]) -> Vec<Message> {
        self.inner.get_outbound(fw).await
    }

    async fn set_sent(&self, mid: &str, rejected: bool) {
        self.inner.set_sent(mid, rejected).await
    }

    async fn set_deferred(&self, mid: &str) {
        self.inner.set_deferred(mid).await
    }

    async fn process_inbound(&self, msgs: Vec<Message>) -> Result<()> {
        self.inner.process_inbound(msgs).await
    }

    async fn get_inbound_answer(&self, proposal: &Proposal) -> ProposalAnswer {
        self.inner.get_inbound_answer(proposal).await
    }

    async fn get_inbound_answers(&self, proposals: &[Proposal]) -> Vec<ProposalAnswer> {
        let mut answers = self.inner.get_inbound_answers(proposals).await;
        answers.resize(proposals.len(), ProposalAnswer::Defer);

        if self.size_limit < 0 || proposals.iter().all(|p| self.below_limit(p)) {
            return answers;
        }

        let mut options = Vec::new();
        for (p, answer) in proposals.iter().zip(answers.iter_mut()) {
            if *answer != ProposalAnswer::Accept {
                continue;
            }
            *answer = ProposalAnswer::Defer;
            options.push(PromptOption {
                value: p.mid().to_string(),
                desc: format!("{} ({} bytes)", p.mid(), p.compressed_size()),
                checked: self.below_limit(p),
            });
        }
        if options.is_empty() {
            return answers;
        }

        let handle = self
            .prompts
            .prompt(
                self.prompt_timeout,
                PromptKind::MultiSelect,
                "Select messages for download",
                options.clone(),
            )
            .await;

        let selected: Vec<String> = match handle.outcome().await {
            PromptOutcome::Answered(value) => value
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            PromptOutcome::TimedOut => options
                .iter()
                .filter(|o| o.checked)
                .map(|o| o.value.clone())
                .collect(),
            PromptOutcome::Cancelled => Vec::new(),
        };

        // Only messages the inner mailbox accepted can be selected.
        for (p, answer) in proposals.iter().zip(answers.iter_mut()) {
            let offered = options.iter().any(|o| o.value == p.mid());
            if offered && selected.iter().any(|mid| mid == p.mid()) {
                *answer = ProposalAnswer::Accept;
            }
        }
        answers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::memory_mailbox::MemoryMailbox;
    use crate::app::prompt::PromptEvent;

    fn proposal(mid: &str, compressed: usize) -> Proposal {
        Proposal::parse(&format!("FC EM {mid} {} {compressed} 0", compressed * 2)).unwrap()
    }

    fn approval(limit: i64) -> (DownloadApproval, PromptHub) {
        let hub = PromptHub::new();
        let inner: Arc<dyn MailboxHandler> = Arc::new(MemoryMailbox::new());
        let approval = DownloadApproval::new(inner, hub.clone(), limit)
            .with_prompt_timeout(Duration::from_millis(50));
        (approval, hub)
    }

    #[tokio::test]
    async fn test_below_limit_passes_through() {
        let (approval, _hub) = approval(1000);
        let answers = approval
            .get_inbound_answers(&[proposal("A", 10), proposal("B", 999)])
            .await;
        assert_eq!(answers, vec![ProposalAnswer::Accept, ProposalAnswer::Accept]);
    }

    #[tokio::test]
    async fn test_negative_limit_disables() {
        let (approval, _hub) = approval(-1);
        let answers = approval.get_inbound_answers(&[proposal("A", 5000)]).await;
        assert_eq!(answers, vec![ProposalAnswer::Accept]);
    }

    #[tokio::test]
    async fn test_operator_selection() {
        let (approval, hub) = approval(1000);
        let mut prompts = hub.add_prompter().await;
        let responder = hub.clone();
        tokio::spawn(async move {
            let Some(PromptEvent::Open(prompt)) = prompts.recv().await else {
                panic!("expected a prompt");
            };
            assert_eq!(prompt.kind, PromptKind::MultiSelect);
            assert_eq!(prompt.options.len(), 2);
            responder.respond(prompt.id, "BIG").await;
        });

        let answers = approval
            .get_inbound_answers(&[proposal("SMALL", 10), proposal("BIG", 5000)])
            .await;
        assert_eq!(answers, vec![ProposalAnswer::Defer, ProposalAnswer::Accept]);
    }

    #[tokio::test]
    async fn test_timeout_takes_defaults() {
        let (approval, _hub) = approval(1000);
        let answers = approval
            .get_inbound_answers(&[proposal("SMALL", 10), proposal("BIG", 5000)])
            .await;
        assert_eq!(answers, vec![ProposalAnswer::Accept, ProposalAnswer::Defer]);
    }
}
