//! Application layer around the exchange engine.
//!
//! - [`ExchangeWorker`] / [`Exchanger`]: serialized exchange scheduling
//! - [`PromptHub`]: operator decisions with deadlines
//! - [`ListenerHub`]: supervised inbound listeners
//! - [`CredentialResolver`]: secure login passwords from config or prompt
//! - [`DownloadApproval`]: operator approval of large downloads
//! - [`MemoryMailbox`]: in-memory mailbox

mod approval;
mod credentials;
mod exchange;
mod listener;
mod memory_mailbox;
mod prompt;

pub use approval::{DownloadApproval, DOWNLOAD_PROMPT_TIMEOUT};
pub use credentials::{AuxAddress, CredentialResolver, PASSWORD_PROMPT_TIMEOUT};
pub use exchange::{ExchangeWorker, Exchanger, SessionFactory};
pub use listener::{ListenerHub, LISTENER_RETRY_INTERVAL};
pub use memory_mailbox::MemoryMailbox;
pub use prompt::{
    Prompt, PromptEvent, PromptHandle, PromptHub, PromptKind, PromptOption, PromptOutcome, PROMPTER_QUEUE_SIZE,
};
