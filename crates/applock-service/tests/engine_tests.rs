use applock_core::error::RegistryError;
use applock_core::event_log::{self, EventLog};
use applock_core::settings::EnforcementSettings;
use applock_core::{AppId, LockRegistry};
use applock_service::desktop::{
    ActivationEvent, ActivationEventSource, AuthenticationGate, FocusController, OverlayPresenter,
    ProcessDirectory, ProcessHandle, ProcessId, SharedProcess,
};
use applock_service::{Collaborators, Engine, EngineHandle, EngineStatus, OverlayBinding};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

// ── fakes ──────────────────────────────────────────────────────────────

struct FakeProcess {
    pid: ProcessId,
    app: AppId,
    name: String,
    hidden: AtomicBool,
    terminated: AtomicBool,
    stubborn: AtomicBool,
    hides: AtomicU32,
    unhides: AtomicU32,
    activations: AtomicU32,
    terminations: AtomicU32,
}

impl FakeProcess {
    fn new(pid: ProcessId, app: &str, name: &str) -> Arc<Self> {
        Arc::new(Self {
            pid,
            app: AppId::from(app),
            name: name.to_string(),
            hidden: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            stubborn: AtomicBool::new(false),
            hides: AtomicU32::new(0),
            unhides: AtomicU32::new(0),
            activations: AtomicU32::new(0),
            terminations: AtomicU32::new(0),
        })
    }

    /// Ignores hide commands.
    fn stubborn(pid: ProcessId, app: &str, name: &str) -> Arc<Self> {
        let process = Self::new(pid, app, name);
        process.stubborn.store(true, Ordering::SeqCst);
        process
    }

    fn reveal(&self) {
        self.hidden.store(false, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    fn hides(&self) -> u32 {
        self.hides.load(Ordering::SeqCst)
    }

    fn unhides(&self) -> u32 {
        self.unhides.load(Ordering::SeqCst)
    }

    fn activations(&self) -> u32 {
        self.activations.load(Ordering::SeqCst)
    }

    fn terminations(&self) -> u32 {
        self.terminations.load(Ordering::SeqCst)
    }
}

impl ProcessHandle for FakeProcess {
    fn pid(&self) -> ProcessId {
        self.pid
    }

    fn app_id(&self) -> Option<AppId> {
        Some(self.app.clone())
    }

    fn display_name(&self) -> String {
        self.name.clone()
    }

    fn is_hidden(&self) -> bool {
        self.hidden.load(Ordering::SeqCst)
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    fn hide(&self) {
        self.hides.fetch_add(1, Ordering::SeqCst);
        if !self.stubborn.load(Ordering::SeqCst) {
            self.hidden.store(true, Ordering::SeqCst);
        }
    }

    fn unhide(&self) {
        self.unhides.fetch_add(1, Ordering::SeqCst);
        self.hidden.store(false, Ordering::SeqCst);
    }

    fn activate(&self) {
        self.activations.fetch_add(1, Ordering::SeqCst);
        self.hidden.store(false, Ordering::SeqCst);
    }

    fn terminate(&self) {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        self.terminated.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FakeRegistry {
    locked: Mutex<HashSet<AppId>>,
    failing: AtomicBool,
}

impl FakeRegistry {
    fn lock(&self, app: &str) {
        self.locked.lock().insert(AppId::from(app));
    }
}

impl LockRegistry for FakeRegistry {
    fn is_locked(&self, id: &AppId) -> Result<bool, RegistryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RegistryError::Unavailable("store offline".into()));
        }
        Ok(self.locked.lock().contains(id))
    }
}

#[derive(Default)]
struct FakeGate {
    results: Mutex<VecDeque<bool>>,
    delay: Mutex<Duration>,
    calls: AtomicU32,
}

impl FakeGate {
    fn answer(&self, result: bool) {
        self.results.lock().push_back(result);
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthenticationGate for FakeGate {
    async fn authenticate(&self) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.results.lock().pop_front().unwrap_or(false)
    }
}

#[derive(Default)]
struct FakeOverlay {
    current: Mutex<Option<OverlayBinding>>,
    presented: Mutex<Vec<ProcessId>>,
    dismissals: AtomicU32,
    failures: Mutex<Vec<String>>,
}

impl FakeOverlay {
    fn binding(&self) -> OverlayBinding {
        self.current.lock().clone().expect("overlay is not shown")
    }

    fn is_shown(&self) -> bool {
        self.current.lock().is_some()
    }

    fn presented(&self) -> Vec<ProcessId> {
        self.presented.lock().clone()
    }

    fn dismissals(&self) -> u32 {
        self.dismissals.load(Ordering::SeqCst)
    }
}

impl OverlayPresenter for FakeOverlay {
    fn present(&self, binding: OverlayBinding) {
        self.presented.lock().push(binding.pid());
        *self.current.lock() = Some(binding);
    }

    fn dismiss(&self) {
        self.dismissals.fetch_add(1, Ordering::SeqCst);
        *self.current.lock() = None;
    }

    fn authentication_failed(&self, display_name: &str) {
        self.failures.lock().push(display_name.to_string());
    }
}

#[derive(Default)]
struct FakeFocus {
    steals: AtomicU32,
}

impl FocusController for FakeFocus {
    fn steal_focus(&self) {
        self.steals.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakeDesktop {
    events: broadcast::Sender<ActivationEvent>,
    front: Mutex<Option<SharedProcess>>,
}

impl Default for FakeDesktop {
    fn default() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            events,
            front: Mutex::new(None),
        }
    }
}

impl ActivationEventSource for FakeDesktop {
    fn subscribe(&self) -> broadcast::Receiver<ActivationEvent> {
        self.events.subscribe()
    }
}

impl ProcessDirectory for FakeDesktop {
    fn frontmost(&self) -> Option<SharedProcess> {
        self.front.lock().clone()
    }
}

// ── harness ────────────────────────────────────────────────────────────

struct Harness {
    engine: EngineHandle,
    task: JoinHandle<()>,
    registry: Arc<FakeRegistry>,
    gate: Arc<FakeGate>,
    overlay: Arc<FakeOverlay>,
    focus: Arc<FakeFocus>,
    desktop: Arc<FakeDesktop>,
}

impl Harness {
    fn new() -> Self {
        Self::build(EnforcementSettings::default(), None)
    }

    fn build(settings: EnforcementSettings, audit: Option<Arc<EventLog>>) -> Self {
        let registry = Arc::new(FakeRegistry::default());
        let gate = Arc::new(FakeGate::default());
        let overlay = Arc::new(FakeOverlay::default());
        let focus = Arc::new(FakeFocus::default());
        let desktop = Arc::new(FakeDesktop::default());
        let collab = Collaborators {
            registry: registry.clone(),
            events: desktop.clone(),
            directory: desktop.clone(),
            focus: focus.clone(),
            overlay: overlay.clone(),
            gate: gate.clone(),
        };
        let (engine, task) = Engine::spawn(collab, settings, audit);
        Self {
            engine,
            task,
            registry,
            gate,
            overlay,
            focus,
            desktop,
        }
    }

    async fn start(&self) {
        self.engine.start_monitoring().unwrap();
        // subscribed once the engine has answered
        self.status().await;
    }

    fn activate(&self, process: &Arc<FakeProcess>) {
        let _ = self
            .desktop
            .events
            .send(ActivationEvent::Activated(process.clone()));
    }

    fn deactivate(&self, process: &Arc<FakeProcess>) {
        let _ = self
            .desktop
            .events
            .send(ActivationEvent::Deactivated(process.clone()));
    }

    async fn status(&self) -> EngineStatus {
        settle().await;
        self.engine.status().await.unwrap()
    }

    fn steals(&self) -> u32 {
        self.focus.steals.load(Ordering::SeqCst)
    }

    async fn shutdown(self) {
        self.engine.shutdown().unwrap();
        self.task.await.unwrap();
    }
}

/// Lets the forwarder, the actor and spawned challenges run to idle.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

// ── activation ─────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn unlocked_app_is_left_alone() {
    let h = Harness::new();
    h.start().await;
    let notes = FakeProcess::new(100, "com.vendor.Notes", "Notes");

    h.activate(&notes);
    let status = h.status().await;

    assert!(status.locked.is_empty());
    assert!(!h.overlay.is_shown());
    assert_eq!(notes.hides(), 0);
    assert_eq!(h.steals(), 0);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn locked_app_is_hidden_before_first_tick() {
    let h = Harness::new();
    h.registry.lock("com.vendor.Notes");
    h.start().await;
    let notes = FakeProcess::new(100, "com.vendor.Notes", "Notes");

    h.activate(&notes);
    let status = h.status().await;

    assert!(status.is_locked(100));
    assert_eq!(status.overlay_bound_to, Some(100));
    assert!(notes.is_hidden());
    assert!(notes.hides() >= 1);
    assert!(h.steals() >= 1);
    assert_eq!(h.overlay.binding().display_name(), "Notes");
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn duplicate_activation_is_idempotent() {
    let h = Harness::new();
    h.registry.lock("com.vendor.Notes");
    h.start().await;
    let notes = FakeProcess::new(100, "com.vendor.Notes", "Notes");

    h.activate(&notes);
    h.activate(&notes);
    let status = h.status().await;

    assert_eq!(status.locked.len(), 1);
    assert_eq!(h.overlay.presented(), vec![100]);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn stubborn_window_gets_the_full_hide_burst() {
    let h = Harness::new();
    h.registry.lock("com.vendor.Notes");
    h.start().await;
    let notes = FakeProcess::stubborn(100, "com.vendor.Notes", "Notes");

    h.activate(&notes);
    settle().await;
    // four retries 50 ms apart, well before the first tick
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(notes.hides(), 5);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn registry_failure_fails_closed() {
    let h = Harness::new();
    h.registry.failing.store(true, Ordering::SeqCst);
    h.start().await;
    let notes = FakeProcess::new(100, "com.vendor.Notes", "Notes");

    h.activate(&notes);
    let status = h.status().await;

    assert!(status.is_locked(100));
    assert!(notes.is_hidden());
    h.shutdown().await;
}

// ── unlock / quit ──────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn successful_unlock_grants_a_session() {
    let h = Harness::new();
    h.registry.lock("com.vendor.Notes");
    h.gate.answer(true);
    h.start().await;
    let notes = FakeProcess::new(100, "com.vendor.Notes", "Notes");

    h.activate(&notes);
    settle().await;
    h.overlay.binding().request_unlock();
    let status = h.status().await;

    assert!(status.locked.is_empty());
    assert_eq!(status.unlocked_session, Some(AppId::from("com.vendor.Notes")));
    assert_eq!(status.authenticating, None);
    assert!(!h.overlay.is_shown());
    assert_eq!(h.overlay.dismissals(), 1);
    assert_eq!(notes.activations(), 1);
    assert!(!notes.is_hidden());

    // the session lets the app through while it stays in front
    h.activate(&notes);
    let status = h.status().await;
    assert!(status.locked.is_empty());
    assert_eq!(h.gate.calls(), 1);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failed_unlock_keeps_the_app_locked() {
    let h = Harness::new();
    h.registry.lock("com.vendor.Notes");
    h.gate.answer(false);
    h.start().await;
    let notes = FakeProcess::new(100, "com.vendor.Notes", "Notes");

    h.activate(&notes);
    settle().await;
    h.overlay.binding().request_unlock();
    let status = h.status().await;

    assert!(status.is_locked(100));
    assert_eq!(status.unlocked_session, None);
    assert_eq!(status.authenticating, None);
    assert!(h.overlay.is_shown());
    assert_eq!(h.overlay.failures.lock().clone(), vec!["Notes".to_string()]);
    assert!(notes.is_hidden());
    assert_eq!(notes.activations(), 0);
    assert_eq!(notes.unhides(), 0);

    // the overlay can be used again
    h.gate.answer(true);
    h.overlay.binding().request_unlock();
    let status = h.status().await;
    assert!(status.locked.is_empty());
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn quit_terminates_once_without_a_challenge() {
    let h = Harness::new();
    h.registry.lock("com.vendor.Notes");
    h.start().await;
    let notes = FakeProcess::new(100, "com.vendor.Notes", "Notes");

    h.activate(&notes);
    settle().await;
    let binding = h.overlay.binding();
    binding.request_quit();
    binding.request_quit();
    let status = h.status().await;

    assert!(status.locked.is_empty());
    assert_eq!(notes.terminations(), 1);
    assert_eq!(h.gate.calls(), 0);
    assert_eq!(h.overlay.dismissals(), 1);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn relocks_after_deactivate_and_reactivate() {
    let h = Harness::new();
    h.registry.lock("com.vendor.Notes");
    h.gate.answer(true);
    h.start().await;
    let notes = FakeProcess::new(100, "com.vendor.Notes", "Notes");

    h.activate(&notes);
    settle().await;
    h.overlay.binding().request_unlock();
    assert!(h.status().await.locked.is_empty());

    h.deactivate(&notes);
    let status = h.status().await;
    assert_eq!(status.unlocked_session, None);

    h.activate(&notes);
    let status = h.status().await;
    assert!(status.is_locked(100));
    assert!(h.overlay.is_shown());
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn session_covers_only_the_unlocked_app() {
    let h = Harness::new();
    h.registry.lock("com.vendor.Notes");
    h.registry.lock("com.vendor.Mail");
    h.gate.answer(true);
    h.start().await;
    let notes = FakeProcess::new(100, "com.vendor.Notes", "Notes");
    let mail = FakeProcess::new(200, "com.vendor.Mail", "Mail");

    h.activate(&notes);
    settle().await;
    h.overlay.binding().request_unlock();
    settle().await;

    h.activate(&mail);
    let status = h.status().await;

    assert!(status.is_locked(200));
    assert!(!status.is_locked(100));
    assert_eq!(status.unlocked_session, Some(AppId::from("com.vendor.Notes")));
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unlock_releases_every_instance_of_the_app() {
    let h = Harness::new();
    h.registry.lock("com.vendor.Notes");
    h.gate.answer(true);
    h.start().await;
    let first = FakeProcess::new(100, "com.vendor.Notes", "Notes");
    let second = FakeProcess::new(101, "com.vendor.Notes", "Notes");

    h.activate(&first);
    h.activate(&second);
    assert_eq!(h.status().await.locked.len(), 2);

    h.engine.request_unlock(100).unwrap();
    let status = h.status().await;

    assert!(status.locked.is_empty());
    assert!(!h.overlay.is_shown());
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn second_unlock_while_pending_is_ignored() {
    let h = Harness::new();
    h.registry.lock("com.vendor.Notes");
    *h.gate.delay.lock() = Duration::from_millis(100);
    h.gate.answer(true);
    h.start().await;
    let notes = FakeProcess::new(100, "com.vendor.Notes", "Notes");

    h.activate(&notes);
    settle().await;
    let binding = h.overlay.binding();
    binding.request_unlock();
    binding.request_unlock();
    let status = h.status().await;

    assert_eq!(status.authenticating, Some(100));
    assert_eq!(h.gate.calls(), 1);

    tokio::time::sleep(Duration::from_millis(150)).await;
    let status = h.status().await;
    assert!(status.locked.is_empty());
    assert_eq!(h.gate.calls(), 1);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn timed_out_challenge_blocks_retries_until_the_gate_returns() {
    let settings = EnforcementSettings {
        auth_timeout_secs: Some(5),
        ..EnforcementSettings::default()
    };
    let h = Harness::build(settings, None);
    h.registry.lock("com.vendor.Notes");
    *h.gate.delay.lock() = Duration::from_secs(30);
    h.gate.answer(true);
    h.start().await;
    let notes = FakeProcess::new(100, "com.vendor.Notes", "Notes");

    h.activate(&notes);
    settle().await;
    h.overlay.binding().request_unlock();
    tokio::time::sleep(Duration::from_secs(6)).await;
    let status = h.status().await;

    // reported as a failure, but the gate still owns the prompt
    assert!(status.is_locked(100));
    assert_eq!(status.authenticating, Some(100));
    assert_eq!(h.overlay.failures.lock().len(), 1);

    h.overlay.binding().request_unlock();
    settle().await;
    assert_eq!(h.gate.calls(), 1);

    // the slow gate answers `true` well after the timeout
    tokio::time::sleep(Duration::from_secs(25)).await;
    let status = h.status().await;
    assert!(status.is_locked(100));
    assert_eq!(status.authenticating, None);
    assert_eq!(status.unlocked_session, None);
    assert_eq!(h.overlay.failures.lock().len(), 1);
    assert_eq!(notes.activations(), 0);
    assert_eq!(notes.unhides(), 0);

    *h.gate.delay.lock() = Duration::ZERO;
    h.gate.answer(true);
    h.overlay.binding().request_unlock();
    let status = h.status().await;
    assert!(status.locked.is_empty());
    assert_eq!(h.gate.calls(), 2);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn deactivation_of_an_unseen_process_changes_nothing() {
    let h = Harness::new();
    h.registry.lock("com.vendor.Notes");
    h.registry.lock("com.vendor.Mail");
    h.gate.answer(true);
    h.start().await;
    let notes = FakeProcess::new(100, "com.vendor.Notes", "Notes");
    let mail = FakeProcess::new(200, "com.vendor.Mail", "Mail");
    let stranger = FakeProcess::new(300, "com.vendor.Calendar", "Calendar");

    h.activate(&notes);
    settle().await;
    h.overlay.binding().request_unlock();
    settle().await;
    h.activate(&mail);
    let before = h.status().await;

    h.deactivate(&stranger);
    let after = h.status().await;

    assert_eq!(after, before);
    assert_eq!(after.unlocked_session, Some(AppId::from("com.vendor.Notes")));
    assert!(after.is_locked(200));
    assert!(!after.is_locked(300));
    assert_eq!(stranger.hides(), 0);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn rebound_overlay_takes_focus_back_when_its_app_returns() {
    let h = Harness::new();
    h.registry.lock("com.vendor.Notes");
    h.registry.lock("com.vendor.Mail");
    h.gate.answer(true);
    h.start().await;
    let notes = FakeProcess::new(100, "com.vendor.Notes", "Notes");
    let mail = FakeProcess::new(200, "com.vendor.Mail", "Mail");

    h.activate(&notes);
    h.activate(&mail);
    settle().await;
    h.engine.request_unlock(100).unwrap();
    let status = h.status().await;

    assert_eq!(status.overlay_bound_to, Some(200));
    assert_eq!(notes.activations(), 1);
    assert!(mail.is_hidden());

    let steals = h.steals();
    h.activate(&mail);
    let status = h.status().await;
    assert!(h.steals() > steals);
    assert_eq!(status.overlay_bound_to, Some(200));
    assert!(mail.is_hidden());

    let steals = h.steals();
    mail.reveal();
    h.engine.reassert_now().unwrap();
    h.status().await;
    assert!(h.steals() > steals);
    assert!(mail.is_hidden());
    h.shutdown().await;
}

// ── termination and re-assertion ──────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn terminated_app_is_purged_on_the_next_tick() {
    let h = Harness::new();
    h.registry.lock("com.vendor.Notes");
    h.start().await;
    let notes = FakeProcess::new(100, "com.vendor.Notes", "Notes");

    h.activate(&notes);
    settle().await;
    notes.exit();
    tokio::time::sleep(Duration::from_millis(600)).await;
    let status = h.status().await;

    assert!(status.locked.is_empty());
    assert!(!h.overlay.is_shown());
    assert_eq!(notes.terminations(), 0);
    assert_eq!(h.gate.calls(), 0);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn late_challenge_result_for_terminated_app_is_discarded() {
    let h = Harness::new();
    h.registry.lock("com.vendor.Notes");
    *h.gate.delay.lock() = Duration::from_millis(100);
    h.gate.answer(true);
    h.start().await;
    let notes = FakeProcess::new(100, "com.vendor.Notes", "Notes");

    h.activate(&notes);
    settle().await;
    h.overlay.binding().request_unlock();
    settle().await;
    notes.exit();
    h.engine.reassert_now().unwrap();
    assert!(h.status().await.locked.is_empty());

    tokio::time::sleep(Duration::from_millis(150)).await;
    let status = h.status().await;

    assert_eq!(status.unlocked_session, None);
    assert_eq!(status.authenticating, None);
    assert_eq!(notes.activations(), 0);
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn revealed_window_is_hidden_again() {
    let h = Harness::new();
    h.registry.lock("com.vendor.Notes");
    h.start().await;
    let notes = FakeProcess::new(100, "com.vendor.Notes", "Notes");

    h.activate(&notes);
    settle().await;
    let hides = notes.hides();
    let steals = h.steals();

    notes.reveal();
    h.engine.reassert_now().unwrap();
    let status = h.status().await;

    assert!(status.is_locked(100));
    assert!(notes.is_hidden());
    assert_eq!(notes.hides(), hides + 1);
    assert!(h.steals() > steals);
    h.shutdown().await;
}

// ── overlay policy ─────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn overlay_moves_to_the_next_locked_app_in_activation_order() {
    let h = Harness::new();
    h.registry.lock("com.vendor.Notes");
    h.registry.lock("com.vendor.Mail");
    h.start().await;
    let notes = FakeProcess::new(100, "com.vendor.Notes", "Notes");
    let mail = FakeProcess::new(200, "com.vendor.Mail", "Mail");

    h.activate(&notes);
    h.activate(&mail);
    let status = h.status().await;
    assert_eq!(status.overlay_bound_to, Some(100));
    assert_eq!(
        status.locked.iter().map(|p| p.pid).collect::<Vec<_>>(),
        vec![100, 200]
    );

    h.engine.request_quit(100).unwrap();
    let status = h.status().await;
    assert_eq!(status.overlay_bound_to, Some(200));
    assert_eq!(h.overlay.binding().display_name(), "Mail");

    h.engine.request_quit(200).unwrap();
    let status = h.status().await;
    assert_eq!(status.overlay_bound_to, None);
    assert!(!h.overlay.is_shown());
    assert_eq!(mail.terminations(), 1);
    h.shutdown().await;
}

// ── monitoring lifecycle ───────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn stop_monitoring_releases_everything() {
    let h = Harness::new();
    h.registry.lock("com.vendor.Notes");
    h.start().await;
    let notes = FakeProcess::new(100, "com.vendor.Notes", "Notes");

    h.activate(&notes);
    settle().await;
    h.engine.stop_monitoring().unwrap();
    let status = h.status().await;

    assert!(!status.monitoring);
    assert!(status.locked.is_empty());
    assert!(!h.overlay.is_shown());

    h.activate(&notes);
    assert!(h.status().await.locked.is_empty());
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn start_monitoring_checks_the_frontmost_app() {
    let h = Harness::new();
    h.registry.lock("com.vendor.Notes");
    let notes = FakeProcess::new(100, "com.vendor.Notes", "Notes");
    *h.desktop.front.lock() = Some(notes.clone());

    h.start().await;
    let status = h.status().await;

    assert!(status.monitoring);
    assert!(status.is_locked(100));
    h.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn events_before_monitoring_are_ignored() {
    let h = Harness::new();
    h.registry.lock("com.vendor.Notes");
    let notes = FakeProcess::new(100, "com.vendor.Notes", "Notes");

    h.activate(&notes);
    let status = h.status().await;

    assert!(!status.monitoring);
    assert!(status.locked.is_empty());
    h.shutdown().await;
}

// ── audit ──────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn lock_decisions_are_audited() {
    let dir = tempfile::tempdir().unwrap();
    let log = Arc::new(EventLog::new(dir.path().join("events.log"), 1024 * 1024).unwrap());
    let h = Harness::build(EnforcementSettings::default(), Some(log.clone()));
    h.registry.lock("com.vendor.Notes");
    h.gate.answer(false);
    h.start().await;
    let notes = FakeProcess::new(100, "com.vendor.Notes", "Notes");

    h.activate(&notes);
    settle().await;
    h.overlay.binding().request_unlock();
    settle().await;
    h.overlay.binding().request_quit();
    h.status().await;

    let types: Vec<String> = log
        .read_recent(None, None)
        .unwrap()
        .into_iter()
        .rev()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(
        types,
        vec![
            event_log::MONITORING_STARTED,
            event_log::LOCK_ENGAGED,
            event_log::AUTH_FAILED,
            event_log::APP_QUIT,
        ]
    );
    assert_eq!(log.verify_chain().unwrap(), 4);
    h.shutdown().await;
}
