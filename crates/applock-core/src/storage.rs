use anyhow::Context;
use serde::Serialize;
use std::io::Write;
use std::path::Path;

use crate::settings::LockerSettings;

pub fn load_settings(path: &Path) -> anyhow::Result<LockerSettings> {
    if !path.exists() {
        return Ok(LockerSettings::default());
    }
    let data = std::fs::read(path).with_context(|| format!("read settings {}", path.display()))?;
    let settings: LockerSettings = serde_json::from_slice(&data)
        .with_context(|| format!("parse settings {}", path.display()))?;
    settings.validate()?;
    Ok(settings)
}

pub fn save_settings(path: &Path, settings: &LockerSettings) -> anyhow::Result<()> {
    settings.validate()?;
    write_json_atomic(path, settings)
}

/// Writes `value` next to `path` and renames it into place.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("no parent directory for {}", path.display()))?;
    std::fs::create_dir_all(parent)?;
    let mut staging = tempfile::NamedTempFile::new_in(parent)?;
    let data = serde_json::to_vec_pretty(value)?;
    staging.write_all(&data)?;
    staging.as_file().sync_all()?;
    staging
        .persist(path)
        .with_context(|| format!("persist {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let settings = load_settings(&dir.path().join("settings.json")).unwrap();
        assert_eq!(settings, LockerSettings::default());
    }

    #[test]
    fn save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut settings = LockerSettings::default();
        settings.monitor_on_start = false;
        settings.enforcement.auth_timeout_secs = Some(30);
        save_settings(&path, &settings).unwrap();
        assert_eq!(load_settings(&path).unwrap(), settings);
    }

    #[test]
    fn invalid_settings_are_not_written() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut settings = LockerSettings::default();
        settings.enforcement.reassert_interval_ms = 1;
        assert!(save_settings(&path, &settings).is_err());
        assert!(!path.exists());
    }
}
