//! Headless desktop driven from a line-oriented console.
//!
//! Processes are simulated: hiding, activating and terminating only flip
//! flags and move the frontmost marker, emitting the same activation and
//! deactivation notifications a real window server would. Activating a
//! process deactivates whatever was in front before it; the locker taking
//! focus leaves no process in front.

use anyhow::{anyhow, bail, Result};
use applock_core::AppId;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::broadcast;
use tracing::debug;

use crate::desktop::{
    ActivationEvent, ActivationEventSource, FocusController, OverlayPresenter, ProcessDirectory,
    ProcessHandle, ProcessId, SharedProcess,
};
use crate::engine::{EngineHandle, OverlayBinding};

const FIRST_PID: ProcessId = 1000;
const AUTH_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct ConsoleProcess {
    pid: ProcessId,
    app_id: AppId,
    name: String,
    hidden: AtomicBool,
    terminated: AtomicBool,
    desktop: Weak<Shared>,
}

impl ConsoleProcess {
    /// The window shows up again without the app being activated, as
    /// when a window manager animation wins the race.
    pub fn reveal(&self) {
        if !self.is_terminated() {
            self.hidden.store(false, Ordering::SeqCst);
        }
    }

    /// Terminated from outside the locker.
    pub fn kill(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        if let Some(desktop) = self.desktop.upgrade() {
            let mut front = desktop.frontmost.lock();
            if *front == Some(self.pid) {
                *front = None;
            }
        }
    }
}

impl ProcessHandle for ConsoleProcess {
    fn pid(&self) -> ProcessId {
        self.pid
    }

    fn app_id(&self) -> Option<AppId> {
        Some(self.app_id.clone())
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
        if self.is_terminated() {
            return;
        }
        self.hidden.store(true, Ordering::SeqCst);
        if let Some(desktop) = self.desktop.upgrade() {
            if desktop.frontmost_pid() == Some(self.pid) {
                desktop.bring_to_front(None);
            }
        }
    }

    fn unhide(&self) {
        self.reveal();
    }

    fn activate(&self) {
        if self.is_terminated() {
            return;
        }
        self.hidden.store(false, Ordering::SeqCst);
        if let Some(desktop) = self.desktop.upgrade() {
            desktop.bring_to_front(Some(self.pid));
        }
    }

    fn terminate(&self) {
        self.kill();
    }
}

struct Shared {
    events: broadcast::Sender<ActivationEvent>,
    processes: Mutex<BTreeMap<ProcessId, Arc<ConsoleProcess>>>,
    frontmost: Mutex<Option<ProcessId>>,
    overlay: Mutex<Option<OverlayBinding>>,
    next_pid: AtomicU32,
}

impl Shared {
    fn process(&self, pid: ProcessId) -> Option<Arc<ConsoleProcess>> {
        self.processes.lock().get(&pid).cloned()
    }

    fn frontmost_pid(&self) -> Option<ProcessId> {
        *self.frontmost.lock()
    }

    fn bring_to_front(&self, pid: Option<ProcessId>) {
        let previous = {
            let mut front = self.frontmost.lock();
            if *front == pid {
                return;
            }
            std::mem::replace(&mut *front, pid)
        };
        if let Some(prev) = previous.and_then(|p| self.process(p)) {
            let _ = self.events.send(ActivationEvent::Deactivated(prev));
        }
        if let Some(next) = pid.and_then(|p| self.process(p)) {
            let _ = self.events.send(ActivationEvent::Activated(next));
        }
    }
}

#[derive(Clone)]
pub struct ConsoleDesktop {
    shared: Arc<Shared>,
}

impl Default for ConsoleDesktop {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleDesktop {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(Shared {
                events,
                processes: Mutex::new(BTreeMap::new()),
                frontmost: Mutex::new(None),
                overlay: Mutex::new(None),
                next_pid: AtomicU32::new(FIRST_PID),
            }),
        }
    }

    /// Starts a process and brings it to the front.
    pub fn launch(&self, app_id: AppId, name: impl Into<String>) -> Arc<ConsoleProcess> {
        let pid = self.shared.next_pid.fetch_add(1, Ordering::SeqCst);
        let process = Arc::new(ConsoleProcess {
            pid,
            app_id,
            name: name.into(),
            hidden: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            desktop: Arc::downgrade(&self.shared),
        });
        self.shared.processes.lock().insert(pid, process.clone());
        self.shared.bring_to_front(Some(pid));
        process
    }

    pub fn process(&self, pid: ProcessId) -> Option<Arc<ConsoleProcess>> {
        self.shared.process(pid)
    }

    pub fn frontmost_pid(&self) -> Option<ProcessId> {
        self.shared.frontmost_pid()
    }

    pub fn overlay_binding(&self) -> Option<OverlayBinding> {
        self.shared.overlay.lock().clone()
    }

    fn require(&self, pid: ProcessId) -> Result<Arc<ConsoleProcess>> {
        self.process(pid)
            .ok_or_else(|| anyhow!("no process with pid {pid}"))
    }
}

impl ActivationEventSource for ConsoleDesktop {
    fn subscribe(&self) -> broadcast::Receiver<ActivationEvent> {
        self.shared.events.subscribe()
    }
}

impl ProcessDirectory for ConsoleDesktop {
    fn frontmost(&self) -> Option<SharedProcess> {
        self.frontmost_pid()
            .and_then(|pid| self.process(pid))
            .map(|p| p as SharedProcess)
    }
}

impl FocusController for ConsoleDesktop {
    fn steal_focus(&self) {
        debug!("locker takes focus");
        self.shared.bring_to_front(None);
    }
}

impl OverlayPresenter for ConsoleDesktop {
    fn present(&self, binding: OverlayBinding) {
        let mut slot = self.shared.overlay.lock();
        let rebinding = slot.as_ref().map(|b| b.pid()) != Some(binding.pid());
        if rebinding {
            println!(
                "[overlay] {} (pid {}) is locked. Type `unlock` or `quit`.",
                binding.display_name(),
                binding.pid()
            );
        }
        *slot = Some(binding);
    }

    fn dismiss(&self) {
        if self.shared.overlay.lock().take().is_some() {
            println!("[overlay] dismissed");
        }
    }

    fn authentication_failed(&self, display_name: &str) {
        println!("[overlay] Authentication failed for {display_name}, try again.");
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Launch { app_id: AppId, name: String },
    Activate(ProcessId),
    Show(ProcessId),
    Kill(ProcessId),
    Unlock,
    Quit,
    Pause,
    Resume,
    Ps,
    Status,
    Wait(u64),
    Help,
    Exit,
}

const HELP: &str = "\
commands:
  launch <bundle-id> <name>   start an app and bring it to the front
  activate <pid>              bring a running app to the front
  show <pid>                  reveal an app's window without activating it
  kill <pid>                  terminate an app from outside the locker
  unlock                      overlay: ask to unlock the locked app
  quit                        overlay: quit the locked app
  pause                       stop monitoring and release every locked app
  resume                      start monitoring again
  ps                          list processes
  status                      print the engine status
  wait <ms>                   pause before the next command
  exit                        stop";

/// Blank lines and `#` comments parse to `None`.
pub fn parse_command(line: &str) -> Result<Option<ConsoleCommand>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let mut parts = line.split_whitespace();
    let verb = parts.next().unwrap_or_default();
    let pid_arg = |arg: Option<&str>| -> Result<ProcessId> {
        let raw = arg.ok_or_else(|| anyhow!("`{verb}` needs a pid"))?;
        raw.parse()
            .map_err(|_| anyhow!("`{raw}` is not a valid pid"))
    };
    let cmd = match verb {
        "launch" => {
            let app_id = parts
                .next()
                .ok_or_else(|| anyhow!("`launch` needs a bundle identifier"))?;
            let name = parts.collect::<Vec<_>>().join(" ");
            let name = if name.is_empty() {
                app_id.rsplit('.').next().unwrap_or(app_id).to_string()
            } else {
                name
            };
            ConsoleCommand::Launch {
                app_id: AppId::from(app_id),
                name,
            }
        }
        "activate" => ConsoleCommand::Activate(pid_arg(parts.next())?),
        "show" => ConsoleCommand::Show(pid_arg(parts.next())?),
        "kill" => ConsoleCommand::Kill(pid_arg(parts.next())?),
        "unlock" => ConsoleCommand::Unlock,
        "quit" => ConsoleCommand::Quit,
        "pause" => ConsoleCommand::Pause,
        "resume" => ConsoleCommand::Resume,
        "ps" => ConsoleCommand::Ps,
        "status" => ConsoleCommand::Status,
        "wait" => {
            let raw = parts.next().ok_or_else(|| anyhow!("`wait` needs milliseconds"))?;
            ConsoleCommand::Wait(
                raw.parse()
                    .map_err(|_| anyhow!("`{raw}` is not a duration in ms"))?,
            )
        }
        "help" | "?" => ConsoleCommand::Help,
        "exit" => ConsoleCommand::Exit,
        other => bail!("unknown command `{other}` (try `help`)"),
    };
    Ok(Some(cmd))
}

/// Reads commands from `input` until `exit` or end of input.
pub async fn run_console<R>(desktop: &ConsoleDesktop, engine: &EngineHandle, input: R) -> Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let cmd = match parse_command(&line) {
            Ok(Some(cmd)) => cmd,
            Ok(None) => continue,
            Err(err) => {
                println!("error: {err:#}");
                continue;
            }
        };
        if cmd == ConsoleCommand::Exit {
            break;
        }
        if let Err(err) = execute(desktop, engine, cmd).await {
            println!("error: {err:#}");
        }
    }
    Ok(())
}

async fn execute(desktop: &ConsoleDesktop, engine: &EngineHandle, cmd: ConsoleCommand) -> Result<()> {
    match cmd {
        ConsoleCommand::Launch { app_id, name } => {
            let process = desktop.launch(app_id, name);
            println!("launched {} as pid {}", process.display_name(), process.pid());
        }
        ConsoleCommand::Activate(pid) => desktop.require(pid)?.activate(),
        ConsoleCommand::Show(pid) => desktop.require(pid)?.reveal(),
        ConsoleCommand::Kill(pid) => desktop.require(pid)?.kill(),
        ConsoleCommand::Unlock => {
            let binding = desktop
                .overlay_binding()
                .ok_or_else(|| anyhow!("no overlay is shown"))?;
            binding.request_unlock();
            // the password prompt owns the terminal until the challenge ends
            wait_for_authentication(engine, binding.pid()).await?;
        }
        ConsoleCommand::Quit => desktop
            .overlay_binding()
            .ok_or_else(|| anyhow!("no overlay is shown"))?
            .request_quit(),
        ConsoleCommand::Pause => {
            engine.stop_monitoring()?;
            println!("monitoring paused");
        }
        ConsoleCommand::Resume => {
            engine.start_monitoring()?;
            println!("monitoring resumed");
        }
        ConsoleCommand::Ps => {
            let front = desktop.frontmost_pid();
            let processes: Vec<_> = desktop.shared.processes.lock().values().cloned().collect();
            for p in processes {
                let state = if p.is_terminated() {
                    "terminated"
                } else if p.is_hidden() {
                    "hidden"
                } else {
                    "visible"
                };
                let marker = if front == Some(p.pid()) { "*" } else { " " };
                println!("{marker} {:>6}  {:<10}  {}  {}", p.pid(), state, p.app_id, p.name);
            }
        }
        ConsoleCommand::Status => {
            let status = engine.status().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        ConsoleCommand::Wait(ms) => tokio::time::sleep(Duration::from_millis(ms)).await,
        ConsoleCommand::Help => println!("{HELP}"),
        ConsoleCommand::Exit => {}
    }
    Ok(())
}

async fn wait_for_authentication(engine: &EngineHandle, pid: ProcessId) -> Result<()> {
    while engine.status().await?.authenticating == Some(pid) {
        tokio::time::sleep(AUTH_POLL_INTERVAL).await;
    }
    Ok(())
}
