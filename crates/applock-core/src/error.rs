use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("registry at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("registry backend unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("password too short; minimum {0} characters")]
    TooShort(usize),
    #[error("no unlock password configured")]
    NotConfigured,
    #[error("stored credential is malformed: {0}")]
    Malformed(String),
    #[error("credential io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("credential encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}
