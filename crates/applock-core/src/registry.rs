//! Persisted registry of applications under lock.
//!
//! The registry is a JSON file holding one [`LockedApp`] record per
//! application identifier. A running service and the command-line tool may
//! both hold the file open; every query re-reads the file and only re-parses
//! it when its content digest changed since the last load, so lock changes
//! take effect without restarting the engine. Timestamps are not trusted:
//! two writes within one filesystem clock tick look identical.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::RegistryError;
use crate::storage::write_json_atomic;

/// Stable identifier of an application (not of a running instance).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppId(String);

impl AppId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

impl From<&str> for AppId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockedApp {
    pub bundle_identifier: AppId,
    pub name: String,
    pub path: String,
    pub date_added: DateTime<Utc>,
    pub is_locked: bool,
}

impl LockedApp {
    pub fn new(bundle_identifier: AppId, name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            bundle_identifier,
            name: name.into(),
            path: path.into(),
            date_added: Utc::now(),
            is_locked: true,
        }
    }
}

/// Read side of the registry as the enforcement engine sees it.
pub trait LockRegistry: Send + Sync {
    fn is_locked(&self, id: &AppId) -> Result<bool, RegistryError>;
}

type ContentDigest = [u8; 32];

#[derive(Debug, Default)]
struct Loaded {
    apps: Vec<LockedApp>,
    /// `None` while the file does not exist.
    digest: Option<ContentDigest>,
}

pub struct AppRegistry {
    path: PathBuf,
    inner: Mutex<Loaded>,
}

impl AppRegistry {
    /// Opens the registry at `path`. A missing file is an empty registry.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RegistryError> {
        let registry = Self {
            path: path.as_ref().to_path_buf(),
            inner: Mutex::new(Loaded::default()),
        };
        {
            let mut inner = registry.inner.lock();
            registry.refresh(&mut inner)?;
        }
        Ok(registry)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_file(&self) -> Result<Option<Vec<u8>>, RegistryError> {
        match std::fs::read(&self.path) {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(RegistryError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn refresh(&self, inner: &mut Loaded) -> Result<(), RegistryError> {
        let data = self.read_file()?;
        let digest = data.as_deref().map(digest_of);
        if digest == inner.digest {
            return Ok(());
        }
        let apps = match data {
            None => Vec::new(),
            Some(data) => serde_json::from_slice(&data).map_err(|source| {
                RegistryError::Corrupt {
                    path: self.path.clone(),
                    source,
                }
            })?,
        };
        debug!(path = %self.path.display(), count = apps.len(), "registry reloaded");
        inner.apps = apps;
        inner.digest = digest;
        Ok(())
    }

    fn persist(&self, inner: &mut Loaded) -> Result<(), RegistryError> {
        write_json_atomic(&self.path, &inner.apps)
            .map_err(|err| RegistryError::Unavailable(format!("{err:#}")))?;
        inner.digest = self.read_file()?.as_deref().map(digest_of);
        Ok(())
    }

    /// Adds `app`. Returns `false` when the identifier is already present.
    pub fn add(&self, app: LockedApp) -> Result<bool, RegistryError> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner)?;
        if inner
            .apps
            .iter()
            .any(|a| a.bundle_identifier == app.bundle_identifier)
        {
            warn!(app = %app.bundle_identifier, "app already registered, skipping add");
            return Ok(false);
        }
        info!(app = %app.bundle_identifier, name = %app.name, "app added to registry");
        inner.apps.push(app);
        self.persist(&mut inner)?;
        Ok(true)
    }

    pub fn remove(&self, id: &AppId) -> Result<bool, RegistryError> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner)?;
        let before = inner.apps.len();
        inner.apps.retain(|a| &a.bundle_identifier != id);
        if inner.apps.len() == before {
            return Ok(false);
        }
        self.persist(&mut inner)?;
        info!(app = %id, "app removed from registry");
        Ok(true)
    }

    /// All records, sorted by display name.
    pub fn list(&self) -> Result<Vec<LockedApp>, RegistryError> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner)?;
        let mut apps = inner.apps.clone();
        apps.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(apps)
    }

    pub fn get(&self, id: &AppId) -> Result<Option<LockedApp>, RegistryError> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner)?;
        Ok(inner
            .apps
            .iter()
            .find(|a| &a.bundle_identifier == id)
            .cloned())
    }

    /// Returns `false` when no record exists for `id`.
    pub fn set_locked(&self, id: &AppId, locked: bool) -> Result<bool, RegistryError> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner)?;
        let Some(app) = inner.apps.iter_mut().find(|a| &a.bundle_identifier == id) else {
            return Ok(false);
        };
        app.is_locked = locked;
        self.persist(&mut inner)?;
        Ok(true)
    }

    /// Flips the lock flag, returning the new value.
    pub fn toggle(&self, id: &AppId) -> Result<Option<bool>, RegistryError> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner)?;
        let Some(app) = inner.apps.iter_mut().find(|a| &a.bundle_identifier == id) else {
            return Ok(None);
        };
        app.is_locked = !app.is_locked;
        let now_locked = app.is_locked;
        self.persist(&mut inner)?;
        Ok(Some(now_locked))
    }
}

fn digest_of(data: &[u8]) -> ContentDigest {
    Sha256::digest(data).into()
}

impl LockRegistry for AppRegistry {
    fn is_locked(&self, id: &AppId) -> Result<bool, RegistryError> {
        let mut inner = self.inner.lock();
        self.refresh(&mut inner)?;
        Ok(inner
            .apps
            .iter()
            .any(|a| &a.bundle_identifier == id && a.is_locked))
    }
}
