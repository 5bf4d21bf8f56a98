use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnforcementSettings {
    /// Period of the re-assertion loop.
    pub reassert_interval_ms: u64,
    /// Hide commands issued when a process is first locked.
    pub hide_attempts: u32,
    pub hide_retry_delay_ms: u64,
    /// Unset means a challenge may stay outstanding indefinitely.
    #[serde(default)]
    pub auth_timeout_secs: Option<u64>,
}

impl EnforcementSettings {
    pub fn reassert_interval(&self) -> Duration {
        Duration::from_millis(self.reassert_interval_ms)
    }

    pub fn hide_retry_delay(&self) -> Duration {
        Duration::from_millis(self.hide_retry_delay_ms)
    }

    pub fn auth_timeout(&self) -> Option<Duration> {
        self.auth_timeout_secs.map(Duration::from_secs)
    }
}

impl Default for EnforcementSettings {
    fn default() -> Self {
        Self {
            reassert_interval_ms: 500,
            hide_attempts: 5,
            hide_retry_delay_ms: 50,
            auth_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockerSettings {
    #[serde(default)]
    pub enforcement: EnforcementSettings,
    #[serde(default = "default_monitor_on_start")]
    pub monitor_on_start: bool,
}

fn default_monitor_on_start() -> bool {
    true
}

impl Default for LockerSettings {
    fn default() -> Self {
        Self {
            enforcement: EnforcementSettings::default(),
            monitor_on_start: true,
        }
    }
}

/// Keys accepted by [`LockerSettings::set`].
pub const SETTING_KEYS: &[&str] = &[
    "reassert_interval_ms",
    "hide_attempts",
    "hide_retry_delay_ms",
    "auth_timeout_secs",
    "monitor_on_start",
];

impl LockerSettings {
    /// Updates one setting from its textual form. `auth_timeout_secs`
    /// accepts `none` to clear the timeout. The result is not validated.
    pub fn set(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        fn parse<T: std::str::FromStr>(key: &str, value: &str) -> anyhow::Result<T> {
            value
                .trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid value `{value}` for {key}"))
        }
        let e = &mut self.enforcement;
        match key {
            "reassert_interval_ms" => e.reassert_interval_ms = parse(key, value)?,
            "hide_attempts" => e.hide_attempts = parse(key, value)?,
            "hide_retry_delay_ms" => e.hide_retry_delay_ms = parse(key, value)?,
            "auth_timeout_secs" => {
                e.auth_timeout_secs = match value.trim() {
                    "none" | "off" => None,
                    other => Some(parse(key, other)?),
                }
            }
            "monitor_on_start" => self.monitor_on_start = parse(key, value)?,
            other => anyhow::bail!(
                "unknown setting `{other}` (expected one of: {})",
                SETTING_KEYS.join(", ")
            ),
        }
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let e = &self.enforcement;
        if !(100..=5000).contains(&e.reassert_interval_ms) {
            anyhow::bail!("Re-assertion interval must be between 100 and 5000 ms");
        }
        if !(1..=20).contains(&e.hide_attempts) {
            anyhow::bail!("Hide attempts must be between 1 and 20");
        }
        if !(10..=1000).contains(&e.hide_retry_delay_ms) {
            anyhow::bail!("Hide retry delay must be between 10 and 1000 ms");
        }
        if let Some(timeout) = e.auth_timeout_secs {
            if !(5..=600).contains(&timeout) {
                anyhow::bail!("Authentication timeout must be between 5 and 600 seconds");
            }
        }
        Ok(())
    }
}
