//! Operator decision rendezvous.
//!
//! Code that needs an operator decision (a password, a download selection)
//! opens a prompt with a deadline. Registered prompters receive the prompt
//! through bounded queues and may answer it by id. Only one prompt is
//! pending at a time; later prompts wait for the slot.
//!
//! | Outcome       | When                                              |
//! |---------------|---------------------------------------------------|
//! | `Answered`    | A prompter responded before the deadline          |
//! | `TimedOut`    | The deadline passed                               |
//! | `Cancelled`   | The hub was closed or the prompt's owner went away |
//!
//! Prompters are told when a prompt they were shown is no longer pending
//! without an answer, so they can stop waiting for operator input.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, OwnedMutexGuard};

/// Prompts queued per prompter before new ones are dropped.
pub const PROMPTER_QUEUE_SIZE: usize = 8;

/// What is being asked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    /// A secret string
    Password,
    /// Comma separated subset of the option values
    MultiSelect,
    /// Whether to transmit on a busy channel
    BusyChannel,
}

/// Selectable option of a multi-select prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptOption {
    /// Value returned when selected
    pub value: String,
    /// Human readable description
    pub desc: String,
    /// Selected by default
    pub checked: bool,
}

/// A prompt as seen by prompters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prompt {
    /// Id used when responding
    pub id: u64,
    /// Prompt kind
    pub kind: PromptKind,
    /// Question shown to the operator
    pub message: String,
    /// Options for multi-select prompts
    pub options: Vec<PromptOption>,
    /// Time the operator has to answer
    pub timeout: Duration,
}

/// What prompters receive on their queue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PromptEvent {
    /// A new prompt awaits an answer
    Open(Prompt),
    /// The prompt `id` expired or was abandoned unanswered
    Cancelled { id: u64 },
}

/// Result of a prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptOutcome {
    /// The operator answered
    Answered(String),
    /// Nobody answered in time
    TimedOut,
    /// The prompt was abandoned
    Cancelled,
}

struct Pending {
    id: u64,
    reply: oneshot::Sender<String>,
}

#[derive(Default)]
struct HubState {
    next_id: u64,
    pending: Option<Pending>,
    prompters: Vec<mpsc::Sender<PromptEvent>>,
    closed: bool,
}

impl HubState {
    fn broadcast(&mut self, event: PromptEvent) {
        self.prompters.retain(|p| !p.is_closed());
        for prompter in &self.prompters {
            if prompter.try_send(event.clone()).is_err() {
                tracing::warn!("Prompter queue full, dropping {:?}", event);
            }
        }
    }
}

/// Shared prompt rendezvous point
#[derive(Clone, Default)]
pub struct PromptHub {
    state: Arc<Mutex<HubState>>,
    slot: Arc<tokio::sync::Mutex<()>>,
}

impl PromptHub {
    /// Create an open hub with no prompters
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a prompter. Its queue closes when the hub closes.
    pub async fn add_prompter(&self) -> mpsc::Receiver<PromptEvent> {
        let (tx, rx) = mpsc::channel(PROMPTER_QUEUE_SIZE);
        let mut state = self.lock();
        if !state.closed {
            state.prompters.push(tx);
        }
        rx
    }

    /// Open a prompt. Waits while another prompt is pending.
    pub async fn prompt(
        &self,
        timeout: Duration,
        kind: PromptKind,
        message: &str,
        options: Vec<PromptOption>,
    ) -> PromptHandle {
        let slot = self.slot.clone().lock_owned().await;
        let (tx, rx) = oneshot::channel();

        let mut state = self.lock();
        state.next_id += 1;
        let prompt = Prompt {
            id: state.next_id,
            kind,
            message: message.to_string(),
            options,
            timeout,
        };

        if state.closed {
            drop(tx);
        } else {
            state.pending = Some(Pending { id: prompt.id, reply: tx });
            state.broadcast(PromptEvent::Open(prompt.clone()));
        }
        drop(state);

        tracing::debug!("New prompt {} ({:?}): {}", prompt.id, prompt.kind, prompt.message);
        PromptHandle {
            prompt,
            rx,
            hub: self.clone(),
            _slot: slot,
        }
    }

    /// Answer the pending prompt `id`. Returns false if it is no longer
    /// pending or its owner went away.
    pub async fn respond(&self, id: u64, value: impl Into<String>) -> bool {
        let mut state = self.lock();
        match state.pending.take() {
            Some(pending) if pending.id == id => pending.reply.send(value.into()).is_ok(),
            other => {
                state.pending = other;
                false
            },
        }
    }

    /// Cancel the pending prompt and stop accepting new ones.
    pub async fn close(&self) {
        let mut state = self.lock();
        state.closed = true;
        state.pending = None;
        state.prompters.clear();
    }

    /// Whether a prompt is waiting for an answer
    pub fn is_pending(&self) -> bool {
        self.lock().pending.is_some()
    }

    fn cancel(&self, id: u64) {
        let mut state = self.lock();
        if state.pending.as_ref().is_some_and(|p| p.id == id) {
            state.pending = None;
            state.broadcast(PromptEvent::Cancelled { id });
            tracing::debug!("Prompt {} cancelled", id);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Awaitable side of an open prompt.
///
/// Dropping the handle before an answer arrives cancels the prompt.
pub struct PromptHandle {
    prompt: Prompt,
    rx: oneshot::Receiver<String>,
    hub: PromptHub,
    _slot: OwnedMutexGuard<()>,
}

impl PromptHandle {
    /// The prompt that was sent to prompters
    pub fn prompt(&self) -> &Prompt {
        &self.prompt
    }

    /// Wait for the answer, the deadline or cancellation.
    pub async fn outcome(mut self) -> PromptOutcome {
        match tokio::time::timeout(self.prompt.timeout, &mut self.rx).await {
            Ok(Ok(value)) => PromptOutcome::Answered(value),
            Ok(Err(_)) => PromptOutcome::Cancelled,
            Err(_) => {
                tracing::info!("Prompt {} timed out", self.prompt.id);
                PromptOutcome::TimedOut
            },
        }
    }
}

impl Drop for PromptHandle {
    fn drop(&mut self) {
        self.hub.cancel(self.prompt.id);
    }
}
