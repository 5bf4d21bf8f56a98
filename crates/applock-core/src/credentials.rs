//! Unlock password storage.
//!
//! Only an argon2 PHC string is persisted. An unconfigured store never
//! verifies anything, which keeps locked applications locked.

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;
use zeroize::Zeroizing;

use crate::error::CredentialError;
use crate::storage::write_json_atomic;

pub const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredCredential {
    phc: String,
    updated_at: DateTime<Utc>,
}

pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.path.exists()
    }

    pub fn set_password(&self, password: &str) -> Result<(), CredentialError> {
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(CredentialError::TooShort(MIN_PASSWORD_LEN));
        }
        let salt = SaltString::generate(&mut rand_core::OsRng);
        let phc = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| CredentialError::Malformed(e.to_string()))?
            .to_string();
        let stored = StoredCredential {
            phc,
            updated_at: Utc::now(),
        };
        write_json_atomic(&self.path, &stored)
            .map_err(|e| CredentialError::Io(std::io::Error::other(format!("{e:#}"))))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }
        info!(path = %self.path.display(), "unlock password updated");
        Ok(())
    }

    pub fn verify(&self, password: &str) -> Result<bool, CredentialError> {
        if !self.is_configured() {
            return Err(CredentialError::NotConfigured);
        }
        let data = Zeroizing::new(std::fs::read(&self.path)?);
        let stored: StoredCredential = serde_json::from_slice(&data)?;
        let parsed =
            PasswordHash::new(&stored.phc).map_err(|e| CredentialError::Malformed(e.to_string()))?;
        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    }
}
