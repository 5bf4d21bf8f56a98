use anyhow::{anyhow, bail, Context, Result};
use applock_core::credentials::{CredentialStore, MIN_PASSWORD_LEN};
use applock_core::event_log::EventLog;
use applock_core::paths::DataPaths;
use applock_core::settings::SETTING_KEYS;
use applock_core::storage::{load_settings, save_settings};
use applock_core::{AppId, AppRegistry, LockedApp};
use applock_service::auth::PasswordGate;
use applock_service::platform::{console, ConsoleDesktop};
use applock_service::{Collaborators, Engine};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

const EVENT_LOG_MAX_BYTES: u64 = 5 * 1024 * 1024;
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(name = "applock", author, version, about = "Password-protect applications", long_about = None)]
struct Cli {
    /// Data directory (defaults to the platform data directory)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `applock_service=trace`
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum SettingsAction {
    /// Change one setting, e.g. `settings set auth_timeout_secs 60`
    Set { key: String, value: String },
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the locker against the console desktop
    Run,
    /// Set the unlock password
    SetPassword,
    /// Lock an application
    Add {
        bundle_id: String,
        /// Display name (defaults to the last component of the identifier)
        #[arg(long)]
        name: Option<String>,
        /// Location of the application bundle
        #[arg(long, default_value = "")]
        path: String,
    },
    /// Forget an application
    Remove { bundle_id: String },
    /// List registered applications
    List,
    /// Flip an application between locked and unlocked
    Toggle { bundle_id: String },
    /// Lock a registered application
    Lock { bundle_id: String },
    /// Keep a registered application listed but stop locking it
    Unlock { bundle_id: String },
    /// Print or change settings
    Settings {
        #[command(subcommand)]
        action: Option<SettingsAction>,
    },
    /// Query a running locker
    Status,
    /// Show recent audit events
    Events {
        /// Maximum number of events to show
        #[arg(short, long, default_value = "50")]
        limit: usize,
        /// Check the hash chain of the current log file
        #[arg(long)]
        verify: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref());
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start async runtime")?;
    let result = runtime.block_on(dispatch(cli));
    // An abandoned password prompt keeps its blocking thread until a line
    // is typed; do not wait for it.
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    result
}

async fn dispatch(cli: Cli) -> Result<()> {
    let paths = DataPaths::resolve(cli.data_dir)?;
    match cli.command {
        Commands::Run => run_command(paths).await,
        Commands::SetPassword => set_password_command(&paths),
        Commands::Add {
            bundle_id,
            name,
            path,
        } => add_command(&paths, bundle_id, name, path),
        Commands::Remove { bundle_id } => remove_command(&paths, bundle_id),
        Commands::List => list_command(&paths),
        Commands::Toggle { bundle_id } => toggle_command(&paths, bundle_id),
        Commands::Lock { bundle_id } => set_locked_command(&paths, bundle_id, true),
        Commands::Unlock { bundle_id } => set_locked_command(&paths, bundle_id, false),
        Commands::Settings { action } => settings_command(&paths, action),
        Commands::Status => status_command(&paths).await,
        Commands::Events { limit, verify } => events_command(&paths, limit, verify),
    }
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run_command(paths: DataPaths) -> Result<()> {
    paths.ensure()?;
    let settings = load_settings(&paths.settings())?;
    let registry = Arc::new(AppRegistry::open(paths.registry())?);
    let credentials = Arc::new(CredentialStore::new(paths.credential()));
    if !credentials.is_configured() {
        warn!("no unlock password configured; locked apps cannot be unlocked until `applock set-password` is run");
    }
    let event_log = Arc::new(EventLog::new(paths.event_log(), EVENT_LOG_MAX_BYTES)?);

    let desktop = Arc::new(ConsoleDesktop::new());
    let collab = Collaborators {
        registry,
        events: desktop.clone(),
        directory: desktop.clone(),
        focus: desktop.clone(),
        overlay: desktop.clone(),
        gate: Arc::new(PasswordGate::new(credentials)),
    };
    let (engine, engine_task) = Engine::spawn(collab, settings.enforcement.clone(), Some(event_log));
    if settings.monitor_on_start {
        engine.start_monitoring()?;
    }

    #[cfg(unix)]
    let status_task = Some(applock_service::status::spawn_status_server(
        &paths.status_socket(),
        engine.clone(),
    )?);
    #[cfg(not(unix))]
    let status_task: Option<tokio::task::JoinHandle<()>> = None;

    info!(data_dir = %paths.root().display(), "locker started; type `help` for commands");
    let input = tokio::io::BufReader::new(tokio::io::stdin());
    tokio::select! {
        res = console::run_console(&desktop, &engine, input) => res?,
        res = signal::ctrl_c() => res?,
    }

    info!("locker stopping");
    engine.shutdown()?;
    if let Err(err) = engine_task.await {
        warn!(error = %err, "engine task ended abnormally");
    }
    if let Some(task) = status_task {
        task.abort();
    }
    #[cfg(unix)]
    let _ = std::fs::remove_file(paths.status_socket());
    Ok(())
}

fn set_password_command(paths: &DataPaths) -> Result<()> {
    paths.ensure()?;
    let password = prompt_password_twice("New unlock password: ")?;
    CredentialStore::new(paths.credential())
        .set_password(&password)
        .context("store unlock password")?;
    println!("Unlock password updated");
    Ok(())
}

fn prompt_password_twice(prompt: &str) -> Result<Zeroizing<String>> {
    if let Ok(pw) = std::env::var("APPLOCK_PASSWORD") {
        if !pw.is_empty() {
            return Ok(Zeroizing::new(pw));
        }
    }
    let first = Zeroizing::new(
        rpassword::prompt_password(prompt).map_err(|e| anyhow!("password prompt: {e}"))?,
    );
    if first.chars().count() < MIN_PASSWORD_LEN {
        bail!("password too short; minimum {MIN_PASSWORD_LEN} characters");
    }
    let second = Zeroizing::new(
        rpassword::prompt_password("Confirm password: ")
            .map_err(|e| anyhow!("password prompt: {e}"))?,
    );
    if *first != *second {
        bail!("passwords do not match");
    }
    Ok(first)
}

fn open_registry(paths: &DataPaths) -> Result<AppRegistry> {
    paths.ensure()?;
    AppRegistry::open(paths.registry())
        .with_context(|| format!("open registry {}", paths.registry().display()))
}

fn add_command(paths: &DataPaths, bundle_id: String, name: Option<String>, path: String) -> Result<()> {
    let registry = open_registry(paths)?;
    let name = name.unwrap_or_else(|| {
        bundle_id
            .rsplit('.')
            .next()
            .unwrap_or(bundle_id.as_str())
            .to_string()
    });
    let app = LockedApp::new(AppId::new(bundle_id.as_str()), name.as_str(), path);
    if registry.add(app)? {
        println!("Locked {name} ({bundle_id})");
    } else if let Some(existing) = registry.get(&AppId::new(bundle_id.as_str()))? {
        let state = if existing.is_locked { "locked" } else { "unlocked" };
        println!("{bundle_id} is already registered as {} ({state})", existing.name);
    }
    Ok(())
}

fn remove_command(paths: &DataPaths, bundle_id: String) -> Result<()> {
    let registry = open_registry(paths)?;
    if !registry.remove(&AppId::new(bundle_id.as_str()))? {
        bail!("{bundle_id} is not registered");
    }
    println!("Removed {bundle_id}");
    Ok(())
}

fn list_command(paths: &DataPaths) -> Result<()> {
    let registry = open_registry(paths)?;
    let apps = registry.list()?;
    if apps.is_empty() {
        println!("No applications registered");
        return Ok(());
    }
    for app in apps {
        let state = if app.is_locked { "locked" } else { "unlocked" };
        println!(
            "{:<8}  {:<40}  {}  (added {})",
            state,
            app.bundle_identifier,
            app.name,
            app.date_added.format("%Y-%m-%d")
        );
    }
    Ok(())
}

fn toggle_command(paths: &DataPaths, bundle_id: String) -> Result<()> {
    let registry = open_registry(paths)?;
    match registry.toggle(&AppId::new(bundle_id.as_str()))? {
        Some(true) => println!("{bundle_id} is now locked"),
        Some(false) => println!("{bundle_id} is now unlocked"),
        None => bail!("{bundle_id} is not registered"),
    }
    Ok(())
}

fn set_locked_command(paths: &DataPaths, bundle_id: String, locked: bool) -> Result<()> {
    let registry = open_registry(paths)?;
    if !registry.set_locked(&AppId::new(bundle_id.as_str()), locked)? {
        bail!("{bundle_id} is not registered; use `applock add` first");
    }
    let state = if locked { "locked" } else { "unlocked" };
    println!("{bundle_id} is now {state}");
    Ok(())
}

fn settings_command(paths: &DataPaths, action: Option<SettingsAction>) -> Result<()> {
    let mut settings = load_settings(&paths.settings())?;
    match action {
        None => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            println!("keys: {}", SETTING_KEYS.join(", "));
        }
        Some(SettingsAction::Set { key, value }) => {
            settings.set(&key, &value)?;
            paths.ensure()?;
            save_settings(&paths.settings(), &settings)?;
            println!("{key} updated; restart `applock run` to apply");
        }
    }
    Ok(())
}

#[cfg(unix)]
async fn status_command(paths: &DataPaths) -> Result<()> {
    use tokio::io::AsyncReadExt;
    use tokio::net::UnixStream;

    let socket_path = paths.status_socket();
    let mut stream = UnixStream::connect(&socket_path)
        .await
        .with_context(|| format!("connect to {} (is `applock run` active?)", socket_path.display()))?;
    let mut data = Vec::new();
    stream.read_to_end(&mut data).await?;
    let status: serde_json::Value = serde_json::from_slice(&data)?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

#[cfg(not(unix))]
async fn status_command(_: &DataPaths) -> Result<()> {
    bail!("status queries are only available on unix")
}

fn events_command(paths: &DataPaths, limit: usize, verify: bool) -> Result<()> {
    let log = EventLog::new(paths.event_log(), EVENT_LOG_MAX_BYTES)?;
    if verify {
        let count = log.verify_chain()?;
        println!("Chain intact ({count} events)");
        return Ok(());
    }
    for entry in log.read_recent(None, Some(limit))? {
        println!(
            "{}  {:<26}  {:?}  {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.event_type,
            entry.severity,
            entry.data
        );
    }
    Ok(())
}
