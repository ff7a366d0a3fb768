//! Secure login password resolution.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::prompt::{PromptHub, PromptKind, PromptOutcome};
use crate::error::{B2FError, Result};
use crate::protocol::{Address, SecureLoginHandler};

/// How long the operator has to enter a password.
pub const PASSWORD_PROMPT_TIMEOUT: Duration = Duration::from_secs(60);

/// Auxiliary address and its optional own password
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxAddress {
    /// Address to fetch messages for
    pub address: String,
    /// Password when it differs from the station password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Resolves passwords from configuration, falling back to an operator prompt.
///
/// Lookup order:
/// 1. the login address gets the station password
/// 2. an auxiliary address gets its own password, else the station password
/// 3. anything else is asked for through the prompt hub
pub struct CredentialResolver {
    mycall: String,
    password: Option<String>,
    aux: Vec<AuxAddress>,
    prompts: Option<PromptHub>,
    prompt_timeout: Duration,
}

impl CredentialResolver {
    /// Create a resolver for `mycall` with an optional station password
    pub fn new(mycall: &str, password: Option<String>) -> Self {
        Self {
            mycall: mycall.to_string(),
            password: password.filter(|p| !p.is_empty()),
            aux: Vec::new(),
            prompts: None,
            prompt_timeout: PASSWORD_PROMPT_TIMEOUT,
        }
    }

    /// Auxiliary address table
    pub fn with_aux_addresses(mut self, aux: Vec<AuxAddress>) -> Self {
        self.aux = aux;
        self
    }

    /// Prompt the operator when nothing is configured
    pub fn with_prompt_hub(mut self, hub: PromptHub) -> Self {
        self.prompts = Some(hub);
        self
    }

    /// Override the prompt deadline
    pub fn with_prompt_timeout(mut self, timeout: Duration) -> Self {
        self.prompt_timeout = timeout;
        self
    }

    fn configured(&self, addr: &Address) -> Option<String> {
        if addr.proto.is_empty() && addr.addr.eq_ignore_ascii_case(&self.mycall) {
            if let Some(password) = &self.password {
                return Some(password.clone());
            }
        }

        self.aux
            .iter()
            .filter(|aux| addr.equal_string(&aux.address))
            .find_map(|aux| aux.password.clone().or_else(|| self.password.clone()))
    }
}

#[async_trait]
impl SecureLoginHandler for CredentialResolver {
    async fn password(&self, addr: &Address) -> Result<String> {
        if let Some(password) = self.configured(addr) {
            return Ok(password);
        }

        let hub = self
            .prompts
            .as_ref()
            .ok_or_else(|| B2FError::SecureLogin(format!("no password configured for {addr}")))?;

        let handle = hub
            .prompt(
                self.prompt_timeout,
                PromptKind::Password,
                &format!("Enter secure login password for {addr}"),
                Vec::new(),
            )
            .await;

        match handle.outcome().await {
            PromptOutcome::Answered(password) => Ok(password),
            PromptOutcome::TimedOut => Err(B2FError::PromptTimeout),
            PromptOutcome::Cancelled => Err(B2FError::PromptCancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::prompt::PromptEvent;

    fn resolver() -> CredentialResolver {
        CredentialResolver::new("LA5NTA", Some("station".to_string())).with_aux_addresses(vec![
            AuxAddress {
                address: "EMCOMM".to_string(),
                password: Some("emcomm".to_string()),
            },
            AuxAddress {
                address: "LA5NTA-1".to_string(),
                password: None,
            },
        ])
    }

    #[tokio::test]
    async fn test_configured_passwords() {
        let r = resolver();
        assert_eq!(r.password(&Address::new("LA5NTA")).await.unwrap(), "station");
        assert_eq!(r.password(&Address::new("EMCOMM")).await.unwrap(), "emcomm");
        assert_eq!(r.password(&Address::new("LA5NTA-1")).await.unwrap(), "station");
    }

    #[tokio::test]
    async fn test_unknown_without_hub() {
        let r = resolver();
        assert!(matches!(
            r.password(&Address::new("N0CALL")).await,
            Err(B2FError::SecureLogin(_))
        ));
    }

    #[tokio::test]
    async fn test_prompt_answer_and_timeout() {
        let hub = PromptHub::new();
        let mut prompts = hub.add_prompter().await;
        let r = CredentialResolver::new("LA5NTA", None)
            .with_prompt_hub(hub.clone())
            .with_prompt_timeout(Duration::from_millis(50));

        let responder = hub.clone();
        tokio::spawn(async move {
            let Some(PromptEvent::Open(prompt)) = prompts.recv().await else {
                panic!("expected a prompt");
            };
            assert!(prompt.message.contains("LA5NTA"));
            responder.respond(prompt.id, "typed").await;
        });
        assert_eq!(r.password(&Address::new("LA5NTA")).await.unwrap(), "typed");

        assert!(matches!(
            r.password(&Address::new("LA5NTA")).await,
            Err(B2FError::PromptTimeout)
        ));
    }
}
