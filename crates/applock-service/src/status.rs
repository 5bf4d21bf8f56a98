use anyhow::Result;
use applock_core::AppId;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::task::JoinHandle;

use crate::desktop::ProcessId;
use crate::engine::EngineHandle;

#[cfg(unix)]
use tokio::{io::AsyncWriteExt, net::UnixListener};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LockedProcessStatus {
    pub pid: ProcessId,
    pub app: AppId,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub monitoring: bool,
    /// Activation order.
    pub locked: Vec<LockedProcessStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overlay_bound_to: Option<ProcessId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unlocked_session: Option<AppId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authenticating: Option<ProcessId>,
}

impl EngineStatus {
    pub fn is_locked(&self, pid: ProcessId) -> bool {
        self.locked.iter().any(|p| p.pid == pid)
    }

    pub fn error(message: &str) -> serde_json::Value {
        serde_json::json!({"error": message})
    }
}

/// Local-only status endpoint: each connection receives one JSON snapshot.
#[cfg(unix)]
pub fn spawn_status_server(socket_path: &Path, engine: EngineHandle) -> Result<JoinHandle<()>> {
    if socket_path.exists() {
        let _ = std::fs::remove_file(socket_path);
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    use std::os::unix::fs::PermissionsExt;
    let listener = UnixListener::bind(socket_path)?;
    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;

    let task = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut stream, _)) => {
                    let payload = match engine.status().await {
                        Ok(status) => serde_json::to_vec(&status),
                        Err(err) => serde_json::to_vec(&EngineStatus::error(&format!(
                            "engine unavailable: {err}"
                        ))),
                    };
                    if let Ok(bytes) = payload {
                        let _ = stream.write_all(&bytes).await;
                    }
                    let _ = stream.shutdown().await;
                }
                Err(err) => {
                    tracing::error!(error = %err, "status socket accept error");
                    break;
                }
            }
        }
    });

    Ok(task)
}

#[cfg(not(unix))]
pub fn spawn_status_server(_: &Path, _: EngineHandle) -> Result<JoinHandle<()>> {
    Err(anyhow::anyhow!(
        "status server is only available on unix via UDS transport"
    ))
}
