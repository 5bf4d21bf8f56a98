use directories::ProjectDirs;
use std::path::PathBuf;

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "applock";
pub const APP_NAME: &str = "applock";

pub fn data_dir() -> anyhow::Result<PathBuf> {
    if let Ok(override_dir) = std::env::var("APPLOCK_DATA_DIR") {
        if !override_dir.is_empty() {
            return Ok(PathBuf::from(override_dir));
        }
    }
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| anyhow::anyhow!("cannot determine data directory"))?;
    Ok(dirs.data_dir().to_path_buf())
}

/// Resolved on-disk locations for one data directory.
#[derive(Debug, Clone)]
pub struct DataPaths {
    root: PathBuf,
}

impl DataPaths {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Uses `override_dir` when given, otherwise the platform data directory.
    pub fn resolve(override_dir: Option<PathBuf>) -> anyhow::Result<Self> {
        let root = match override_dir {
            Some(dir) => dir,
            None => data_dir()?,
        };
        Ok(Self::new(root))
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    pub fn ensure(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.log_dir())?;
        Ok(())
    }

    pub fn registry(&self) -> PathBuf {
        self.root.join("locked-apps.json")
    }

    pub fn settings(&self) -> PathBuf {
        self.root.join("settings.json")
    }

    pub fn credential(&self) -> PathBuf {
        self.root.join("credential.json")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn event_log(&self) -> PathBuf {
        self.log_dir().join("events.log")
    }

    pub fn status_socket(&self) -> PathBuf {
        if let Ok(override_path) = std::env::var("APPLOCK_STATUS_SOCKET") {
            return PathBuf::from(override_path);
        }
        self.root.join("applock-status.ipc")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_rooted_at_data_dir() {
        let paths = DataPaths::new(PathBuf::from("/tmp/applock-test"));
        assert_eq!(
            paths.registry(),
            PathBuf::from("/tmp/applock-test/locked-apps.json")
        );
        assert_eq!(
            paths.event_log(),
            PathBuf::from("/tmp/applock-test/logs/events.log")
        );
    }
}
