//! Application lock enforcement engine.
//!
//! One actor task owns every piece of lock state. Activation events, the
//! re-assertion timer, overlay intents and authentication results all
//! arrive as [`EngineCommand`]s through a single unbounded mailbox, and
//! each command is handled synchronously to completion. Work that has to
//! wait (the authentication challenge, hide retries) runs in spawned tasks
//! that only talk to collaborators and report back through the mailbox, so
//! no state is ever held across a suspension point.
//!
//! When several applications are locked at once the overlay is bound to
//! the oldest unresolved one; it moves to the next in activation order once
//! that one is unlocked, quit or terminated.

mod hide;
pub mod reassert;
mod state;

use anyhow::{anyhow, Result};
use applock_core::event_log::{self, EventLog, EventSeverity};
use applock_core::settings::EnforcementSettings;
use applock_core::{AppId, LockRegistry};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::desktop::{
    ActivationEvent, ActivationEventSource, AuthenticationGate, FocusController, OverlayPresenter,
    ProcessDirectory, ProcessId, SharedProcess,
};
use crate::status::{EngineStatus, LockedProcessStatus};
use reassert::{spawn_reassert_loop, ReassertLoopHandle};
use state::{LockTable, TrackedProcess};

pub enum EngineCommand {
    Activated(SharedProcess),
    Deactivated(SharedProcess),
    UnlockRequested(ProcessId),
    QuitRequested(ProcessId),
    AuthCompleted {
        pid: ProcessId,
        authenticated: bool,
    },
    /// The challenge outlived its timeout; the gate is still running.
    AuthTimedOut(ProcessId),
    /// A timed-out gate finally returned; its answer is discarded.
    AuthAbandoned(ProcessId),
    Tick,
    StartMonitoring,
    StopMonitoring,
    Status(oneshot::Sender<EngineStatus>),
    Shutdown,
}

/// Everything the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub registry: Arc<dyn LockRegistry>,
    pub events: Arc<dyn ActivationEventSource>,
    pub directory: Arc<dyn ProcessDirectory>,
    pub focus: Arc<dyn FocusController>,
    pub overlay: Arc<dyn OverlayPresenter>,
    pub gate: Arc<dyn AuthenticationGate>,
}

/// The overlay's callbacks, bound to one locked process.
#[derive(Clone)]
pub struct OverlayBinding {
    pid: ProcessId,
    display_name: String,
    mailbox: mpsc::UnboundedSender<EngineCommand>,
}

impl OverlayBinding {
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn request_unlock(&self) {
        if self
            .mailbox
            .send(EngineCommand::UnlockRequested(self.pid))
            .is_err()
        {
            debug!(pid = self.pid, "unlock requested after engine stopped");
        }
    }

    pub fn request_quit(&self) {
        if self
            .mailbox
            .send(EngineCommand::QuitRequested(self.pid))
            .is_err()
        {
            debug!(pid = self.pid, "quit requested after engine stopped");
        }
    }
}

impl fmt::Debug for OverlayBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverlayBinding")
            .field("pid", &self.pid)
            .field("display_name", &self.display_name)
            .finish()
    }
}

/// Cloneable front door to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    mailbox: mpsc::UnboundedSender<EngineCommand>,
}

impl EngineHandle {
    fn send(&self, cmd: EngineCommand) -> Result<()> {
        self.mailbox
            .send(cmd)
            .map_err(|_| anyhow!("enforcement engine is not running"))
    }

    pub fn start_monitoring(&self) -> Result<()> {
        self.send(EngineCommand::StartMonitoring)
    }

    /// Pauses enforcement entirely; every tracked process is released.
    pub fn stop_monitoring(&self) -> Result<()> {
        self.send(EngineCommand::StopMonitoring)
    }

    /// Runs a re-assertion pass now instead of waiting for the timer.
    pub fn reassert_now(&self) -> Result<()> {
        self.send(EngineCommand::Tick)
    }

    pub fn request_unlock(&self, pid: ProcessId) -> Result<()> {
        self.send(EngineCommand::UnlockRequested(pid))
    }

    pub fn request_quit(&self, pid: ProcessId) -> Result<()> {
        self.send(EngineCommand::QuitRequested(pid))
    }

    pub async fn status(&self) -> Result<EngineStatus> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineCommand::Status(tx))?;
        rx.await
            .map_err(|_| anyhow!("enforcement engine stopped before answering"))
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(EngineCommand::Shutdown)
    }
}

pub struct Engine {
    table: LockTable,
    collab: Collaborators,
    settings: EnforcementSettings,
    audit: Option<Arc<EventLog>>,
    mailbox: mpsc::UnboundedSender<EngineCommand>,
    monitor_task: Option<JoinHandle<()>>,
    hide_tasks: HashMap<ProcessId, JoinHandle<()>>,
}

impl Engine {
    /// Starts the engine actor and its re-assertion loop. Monitoring is off
    /// until [`EngineHandle::start_monitoring`] is called.
    pub fn spawn(
        collab: Collaborators,
        settings: EnforcementSettings,
        audit: Option<Arc<EventLog>>,
    ) -> (EngineHandle, JoinHandle<()>) {
        let (mailbox, rx) = mpsc::unbounded_channel();
        let reassert = spawn_reassert_loop(mailbox.clone(), settings.reassert_interval());
        let engine = Engine {
            table: LockTable::default(),
            collab,
            settings,
            audit,
            mailbox: mailbox.clone(),
            monitor_task: None,
            hide_tasks: HashMap::new(),
        };
        let task = tokio::spawn(engine.run(rx, reassert));
        (EngineHandle { mailbox }, task)
    }

    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<EngineCommand>,
        reassert: (JoinHandle<()>, ReassertLoopHandle),
    ) {
        info!("enforcement engine started");
        while let Some(cmd) = rx.recv().await {
            if !self.handle(cmd) {
                break;
            }
        }
        let (reassert_task, reassert_handle) = reassert;
        let _ = reassert_handle.shutdown_tx.send(true);
        if let Err(err) = reassert_task.await {
            error!(error = %err, "re-assertion loop ended abnormally");
        }
        self.stop_monitoring();
        info!("enforcement engine stopped");
    }

    /// Returns `false` once the engine should stop.
    fn handle(&mut self, cmd: EngineCommand) -> bool {
        match cmd {
            EngineCommand::Activated(handle) => {
                // may still be queued from before a stop
                if self.monitor_task.is_some() {
                    self.on_activated(handle);
                }
            }
            EngineCommand::Deactivated(handle) => self.on_deactivated(handle),
            EngineCommand::UnlockRequested(pid) => self.on_unlock_requested(pid),
            EngineCommand::QuitRequested(pid) => self.on_quit_requested(pid),
            EngineCommand::AuthCompleted { pid, authenticated } => {
                self.on_auth_completed(pid, authenticated)
            }
            EngineCommand::AuthTimedOut(pid) => self.on_auth_timed_out(pid),
            EngineCommand::AuthAbandoned(pid) => self.on_auth_abandoned(pid),
            EngineCommand::Tick => self.reassert(),
            EngineCommand::StartMonitoring => self.start_monitoring(),
            EngineCommand::StopMonitoring => self.stop_monitoring(),
            EngineCommand::Status(reply) => {
                let _ = reply.send(self.snapshot());
            }
            EngineCommand::Shutdown => return false,
        }
        true
    }

    // ── monitoring ─────────────────────────────────────────────────────

    fn start_monitoring(&mut self) {
        if self.monitor_task.is_some() {
            debug!("monitoring already active");
            return;
        }
        let mut events = self.collab.events.subscribe();
        let mailbox = self.mailbox.clone();
        self.monitor_task = Some(tokio::spawn(async move {
            use tokio::sync::broadcast::error::RecvError;
            loop {
                let cmd = match events.recv().await {
                    Ok(ActivationEvent::Activated(p)) => EngineCommand::Activated(p),
                    Ok(ActivationEvent::Deactivated(p)) => EngineCommand::Deactivated(p),
                    Err(RecvError::Lagged(n)) => {
                        warn!(missed = n, "activation stream lagged; re-assertion loop will catch up");
                        continue;
                    }
                    Err(RecvError::Closed) => {
                        debug!("activation stream closed");
                        return;
                    }
                };
                if mailbox.send(cmd).is_err() {
                    return;
                }
            }
        }));
        info!("monitoring started");
        self.audit(
            event_log::MONITORING_STARTED,
            EventSeverity::Info,
            serde_json::json!({}),
        );

        // Only what is in front right now is re-evaluated.
        if let Some(front) = self.collab.directory.frontmost() {
            self.on_activated(front);
        }
    }

    fn stop_monitoring(&mut self) {
        let was_monitoring = match self.monitor_task.take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        };
        for tracked in self.table.clear() {
            self.cancel_hide(tracked.pid);
            debug!(pid = tracked.pid, app = %tracked.app_id, "released on monitoring stop");
        }
        self.table.clear_session();
        if self.table.overlay_bound.take().is_some() {
            self.collab.overlay.dismiss();
        }
        if was_monitoring {
            info!("monitoring stopped");
            self.audit(
                event_log::MONITORING_STOPPED,
                EventSeverity::Info,
                serde_json::json!({}),
            );
        }
    }

    // ── activation handler ─────────────────────────────────────────────

    fn on_activated(&mut self, handle: SharedProcess) {
        let Some(app_id) = handle.app_id() else {
            return;
        };
        if self.table.session_matches(&app_id) {
            debug!(app = %app_id, "app holds the unlocked session, allowing");
            return;
        }
        let locked = match self.collab.registry.is_locked(&app_id) {
            Ok(locked) => locked,
            Err(err) => {
                warn!(app = %app_id, error = %err, "registry lookup failed; treating app as locked");
                self.audit(
                    event_log::REGISTRY_FAIL_CLOSED,
                    EventSeverity::Warn,
                    serde_json::json!({"app": app_id, "error": err.to_string()}),
                );
                true
            }
        };
        if !locked || handle.is_terminated() {
            return;
        }
        self.lock(handle, app_id);
    }

    fn on_deactivated(&mut self, handle: SharedProcess) {
        let Some(app_id) = handle.app_id() else {
            return;
        };
        if self.table.revoke_session_for(&app_id) {
            info!(app = %app_id, "unlocked app deactivated, session revoked");
            self.audit(
                event_log::SESSION_REVOKED,
                EventSeverity::Info,
                serde_json::json!({"app": app_id, "pid": handle.pid()}),
            );
        }
    }

    // ── lock state machine ─────────────────────────────────────────────

    fn lock(&mut self, handle: SharedProcess, app_id: AppId) {
        let pid = handle.pid();
        if self.table.contains(pid) {
            debug!(pid, app = %app_id, "already locked, re-affirming");
            self.collab.focus.steal_focus();
            self.engage_hide(handle);
            return;
        }

        self.table.insert(handle.clone(), app_id.clone());
        warn!(pid, app = %app_id, "locked app activated");
        self.audit(
            event_log::LOCK_ENGAGED,
            EventSeverity::Info,
            serde_json::json!({"app": app_id, "pid": pid, "name": handle.display_name()}),
        );

        self.collab.focus.steal_focus();
        self.present_front();
        self.engage_hide(handle);
    }

    /// First hide right away, the rest of the burst in the background.
    fn engage_hide(&mut self, handle: SharedProcess) {
        let pid = handle.pid();
        self.cancel_hide(pid);
        if !hide::hide_once(handle.as_ref()) {
            return;
        }
        let retries = self.settings.hide_attempts.saturating_sub(1);
        if retries == 0 {
            return;
        }
        let delay = self.settings.hide_retry_delay();
        let task = tokio::spawn(async move {
            hide::hide_with_retries(handle.as_ref(), retries, delay).await;
        });
        self.hide_tasks.insert(pid, task);
    }

    fn cancel_hide(&mut self, pid: ProcessId) {
        if let Some(task) = self.hide_tasks.remove(&pid) {
            task.abort();
        }
    }

    fn on_unlock_requested(&mut self, pid: ProcessId) {
        let Some(tracked) = self.table.get(pid) else {
            debug!(pid, "unlock requested for a process that is not locked");
            return;
        };
        if tracked.handle.is_terminated() {
            self.release_terminated(pid);
            self.sync_overlay();
            return;
        }
        if let Some(pending) = self.table.authenticating {
            debug!(pid, pending, "authentication already in progress, ignoring");
            return;
        }
        info!(pid, app = %tracked.app_id, "authentication requested");
        self.table.authenticating = Some(pid);

        let gate = self.collab.gate.clone();
        let mailbox = self.mailbox.clone();
        let timeout = self.settings.auth_timeout();
        tokio::spawn(async move {
            let mut challenge = tokio::spawn(async move { gate.authenticate().await });
            let joined = match timeout {
                Some(limit) => match tokio::time::timeout(limit, &mut challenge).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!(pid, "authentication timed out");
                        let _ = mailbox.send(EngineCommand::AuthTimedOut(pid));
                        // A prompt can not be interrupted; the challenge
                        // stays pending until the gate gives up the terminal.
                        let _ = challenge.await;
                        let _ = mailbox.send(EngineCommand::AuthAbandoned(pid));
                        return;
                    }
                },
                None => challenge.await,
            };
            let authenticated = match joined {
                Ok(result) => result,
                Err(err) => {
                    error!(pid, error = %err, "authentication task failed");
                    false
                }
            };
            let _ = mailbox.send(EngineCommand::AuthCompleted { pid, authenticated });
        });
    }

    fn on_auth_completed(&mut self, pid: ProcessId, authenticated: bool) {
        if self.table.authenticating == Some(pid) {
            self.table.authenticating = None;
        }
        let Some(tracked) = self.table.get(pid).cloned() else {
            debug!(pid, authenticated, "late authentication result discarded");
            return;
        };
        if tracked.handle.is_terminated() {
            self.release_terminated(pid);
            self.sync_overlay();
            return;
        }

        if !authenticated {
            self.challenge_failed(&tracked, "rejected");
            return;
        }

        // Other instances of the same app are covered by the grant too.
        for released in self.table.remove_app(&tracked.app_id) {
            self.cancel_hide(released.pid);
        }
        self.table.grant_session(tracked.app_id.clone());
        info!(pid, app = %tracked.app_id, "authentication succeeded, unlocking");
        self.audit(
            event_log::UNLOCK_GRANTED,
            EventSeverity::Info,
            serde_json::json!({"app": tracked.app_id, "pid": pid}),
        );
        // The granted app goes in front of a rebound overlay. The process
        // the overlay moved to stays hidden; focus is taken back when it
        // activates again or the re-assertion loop finds it revealed.
        self.sync_overlay();
        tracked.handle.unhide();
        tracked.handle.activate();
    }

    /// Counts as a failed attempt, but a new challenge can not start until
    /// the gate has returned.
    fn on_auth_timed_out(&mut self, pid: ProcessId) {
        let Some(tracked) = self.table.get(pid).cloned() else {
            return;
        };
        if tracked.handle.is_terminated() {
            self.release_terminated(pid);
            self.sync_overlay();
            return;
        }
        self.challenge_failed(&tracked, "timed out");
    }

    fn on_auth_abandoned(&mut self, pid: ProcessId) {
        if self.table.authenticating == Some(pid) {
            self.table.authenticating = None;
        }
        debug!(pid, "timed-out challenge returned, result discarded");
    }

    fn challenge_failed(&self, tracked: &TrackedProcess, reason: &str) {
        info!(pid = tracked.pid, app = %tracked.app_id, reason, "authentication failed, keeping app locked");
        self.audit(
            event_log::AUTH_FAILED,
            EventSeverity::Warn,
            serde_json::json!({"app": tracked.app_id, "pid": tracked.pid, "reason": reason}),
        );
        self.collab.overlay.authentication_failed(&tracked.name);
        self.collab.focus.steal_focus();
    }

    fn on_quit_requested(&mut self, pid: ProcessId) {
        let Some(tracked) = self.table.remove(pid) else {
            debug!(pid, "quit requested for a process that is not locked");
            return;
        };
        self.cancel_hide(pid);
        if !tracked.handle.is_terminated() {
            tracked.handle.terminate();
        }
        info!(pid, app = %tracked.app_id, "locked app quit by user");
        self.audit(
            event_log::APP_QUIT,
            EventSeverity::Info,
            serde_json::json!({"app": tracked.app_id, "pid": pid}),
        );
        self.sync_overlay();
    }

    fn release_terminated(&mut self, pid: ProcessId) -> Option<TrackedProcess> {
        let tracked = self.table.remove(pid)?;
        self.cancel_hide(pid);
        info!(pid, app = %tracked.app_id, "locked app terminated, releasing");
        self.audit(
            event_log::LOCK_RELEASED_TERMINATED,
            EventSeverity::Info,
            serde_json::json!({"app": tracked.app_id, "pid": pid}),
        );
        Some(tracked)
    }

    // ── re-assertion ───────────────────────────────────────────────────

    fn reassert(&mut self) {
        if self.table.is_empty() {
            return;
        }
        let mut terminated = Vec::new();
        let mut revealed = false;
        for tracked in self.table.iter() {
            if tracked.handle.is_terminated() {
                terminated.push(tracked.pid);
            } else if !tracked.handle.is_hidden() {
                debug!(pid = tracked.pid, app = %tracked.app_id, "re-hiding locked app");
                tracked.handle.hide();
                revealed = true;
            }
        }
        for pid in terminated {
            self.release_terminated(pid);
        }
        if revealed && !self.table.is_empty() {
            self.collab.focus.steal_focus();
            self.present_front();
        } else {
            self.sync_overlay();
        }
    }

    // ── overlay ────────────────────────────────────────────────────────

    /// Presents the overlay bound to the oldest locked process, or dismisses
    /// it when nothing is locked.
    fn present_front(&mut self) {
        let binding = self.table.front().map(|front| OverlayBinding {
            pid: front.pid,
            display_name: front.name.clone(),
            mailbox: self.mailbox.clone(),
        });
        match binding {
            Some(binding) => {
                self.table.overlay_bound = Some(binding.pid);
                self.collab.overlay.present(binding);
            }
            None => {
                if self.table.overlay_bound.take().is_some() {
                    self.collab.overlay.dismiss();
                }
            }
        }
    }

    /// Rebinds or dismisses the overlay after processes left tracking.
    fn sync_overlay(&mut self) {
        let front = self.table.front().map(|t| t.pid);
        if front != self.table.overlay_bound {
            self.present_front();
        }
    }

    // ── misc ───────────────────────────────────────────────────────────

    fn snapshot(&self) -> EngineStatus {
        EngineStatus {
            monitoring: self.monitor_task.is_some(),
            locked: self
                .table
                .iter()
                .map(|t| LockedProcessStatus {
                    pid: t.pid,
                    app: t.app_id.clone(),
                    name: t.name.clone(),
                })
                .collect(),
            overlay_bound_to: self.table.overlay_bound,
            unlocked_session: self.table.unlocked_session().cloned(),
            authenticating: self.table.authenticating,
        }
    }

    fn audit(&self, event_type: &str, severity: EventSeverity, data: serde_json::Value) {
        if let Some(log) = &self.audit {
            if let Err(err) = log.append(event_type, severity, data) {
                warn!(error = %err, event_type, "failed to append audit event");
            }
        }
    }
}
