use applock_core::credentials::CredentialStore;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info, warn};
use zeroize::Zeroizing;

use crate::desktop::AuthenticationGate;

/// Prompts for the unlock password on the controlling terminal.
pub struct PasswordGate {
    store: Arc<CredentialStore>,
    prompt: String,
}

impl PasswordGate {
    pub fn new(store: Arc<CredentialStore>) -> Self {
        Self {
            store,
            prompt: "Unlock password: ".to_string(),
        }
    }
}

#[async_trait]
impl AuthenticationGate for PasswordGate {
    async fn authenticate(&self) -> bool {
        if !self.store.is_configured() {
            warn!("no unlock password configured; run `applock set-password`");
            return false;
        }
        let store = self.store.clone();
        let prompt = self.prompt.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let password = Zeroizing::new(rpassword::prompt_password(prompt)?);
            store
                .verify(&password)
                .map_err(|e| std::io::Error::other(e.to_string()))
        })
        .await;
        match outcome {
            Ok(Ok(true)) => {
                info!("password accepted");
                true
            }
            Ok(Ok(false)) => {
                info!("password rejected");
                false
            }
            Ok(Err(err)) => {
                warn!(error = %err, "password prompt failed");
                false
            }
            Err(err) => {
                error!(error = %err, "password prompt task failed");
                false
            }
        }
    }
}
