//! sync-daemon: Headless sync client for a notes workspace.
//!
//! Uses the same sync-core as the desktop app, but runs as a native
//! binary: it watches a workspace directory and keeps it in sync with
//! the remote store.

use anyhow::{Result, bail};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use clap::{Parser, Subcommand};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use sync_daemon::native_fs::NativeFs;
use sync_daemon::watcher::{FileEventKind, WorkspaceWatcher};

use sync_core::auth::AuthService;
use sync_core::config::{JsonFileStore, SyncSettings};
use sync_core::device::DeviceManager;
use sync_core::encryption::derive_workspace_salt;
use sync_core::events::SyncState;
use sync_core::manager::{SyncManager, SyncOutcome};
use sync_core::remote::HttpRemoteStore;
use sync_core::tokens::TokenManager;

/// Engine state lives next to the index, inside the workspace.
const CONFIG_RELATIVE: &str = ".sync/config.json";

/// Floor for the periodic cycle, so a mangled config cannot hot-loop.
const MIN_INTERVAL_SECS: u64 = 5;

#[derive(Parser, Debug)]
#[command(name = "sync-daemon")]
#[command(about = "Encrypted workspace sync daemon")]
struct Cli {
    /// Path to the workspace directory
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch the workspace and sync continuously
    Run,
    /// Run a single sync cycle and exit
    Sync,
    /// Log in and enable sync for this workspace
    Login {
        #[arg(long)]
        email: String,
        /// Server URL (defaults to the configured one)
        #[arg(long)]
        server: Option<String>,
        /// Password (prompted when omitted)
        #[arg(long)]
        password: Option<String>,
    },
    /// Create an account
    Register {
        #[arg(long)]
        email: String,
        #[arg(long)]
        server: Option<String>,
        #[arg(long)]
        password: Option<String>,
    },
    /// End the session on this device
    Logout,
    /// Re-enter the sync password to restore the content key
    Unlock {
        #[arg(long)]
        password: Option<String>,
    },
    /// Show sync state, pending work, and unresolved conflicts
    Status,
    /// Inspect or prune devices known to this account
    Devices {
        #[command(subcommand)]
        command: DevicesCommand,
    },
}

#[derive(Subcommand, Debug)]
enum DevicesCommand {
    /// List devices seen on this account
    List,
    /// Drop a device from the local registry
    Revoke { id: String },
}

type Store = Arc<JsonFileStore>;
type Remote = Arc<HttpRemoteStore>;
type Manager = SyncManager<Arc<NativeFs>, Store, Remote>;

/// Fully wired engine for one workspace.
struct Engine {
    root: PathBuf,
    store: Store,
    remote: Remote,
    tokens: Arc<TokenManager<Store, Remote>>,
    manager: Manager,
}

fn open_store(workspace: &Path) -> Result<Store> {
    Ok(Arc::new(JsonFileStore::open(workspace.join(CONFIG_RELATIVE))?))
}

async fn build_engine(workspace: &Path) -> Result<Engine> {
    let root = workspace
        .canonicalize()
        .unwrap_or_else(|_| workspace.to_path_buf());
    let store = open_store(&root)?;
    let settings = SyncSettings::load(&store);
    let remote = Arc::new(HttpRemoteStore::new(&settings.server_url)?);
    let tokens = Arc::new(TokenManager::new(Arc::clone(&store), Arc::clone(&remote)));
    let fs = Arc::new(NativeFs::new(root.clone()));

    let manager = SyncManager::init(fs, Arc::clone(&store), Arc::clone(&remote), Arc::clone(&tokens))
        .await?;

    Ok(Engine {
        root,
        store,
        remote,
        tokens,
        manager,
    })
}

/// Use the flag value when given, otherwise prompt on stdin.
fn resolve_password(flag: Option<String>, label: &str) -> Result<String> {
    if let Some(password) = flag {
        return Ok(password);
    }
    print!("{label}: ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose).
    let default_filter = if cli.verbose {
        "debug,sync_daemon=debug"
    } else {
        "info,sync_daemon=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::Run => cmd_run(&cli.workspace).await,
        Command::Sync => cmd_sync(&cli.workspace).await,
        Command::Login {
            email,
            server,
            password,
        } => cmd_login(&cli.workspace, &email, server, password).await,
        Command::Register {
            email,
            server,
            password,
        } => cmd_register(&cli.workspace, &email, server, password).await,
        Command::Logout => cmd_logout(&cli.workspace).await,
        Command::Unlock { password } => cmd_unlock(&cli.workspace, password).await,
        Command::Status => cmd_status(&cli.workspace).await,
        Command::Devices { command } => cmd_devices(&cli.workspace, command),
    }
}

async fn cmd_run(workspace: &Path) -> Result<()> {
    let engine = build_engine(workspace).await?;
    let manager = engine.manager;

    match manager.start() {
        SyncState::Disabled => {
            bail!("sync is not enabled for this workspace; run `sync-daemon login` first")
        }
        SyncState::LoggedOut => {
            bail!("no session on this device; run `sync-daemon login`")
        }
        SyncState::Locked => {
            warn!("workspace is locked; run `sync-daemon unlock` to resume");
        }
        _ => {}
    }

    let settings = SyncSettings::load(&engine.store);
    let mut watcher = WorkspaceWatcher::new(engine.root.clone())?;
    info!("Watching {:?}", watcher.root());
    info!("Daemon running. Press Ctrl+C to stop.");

    let mut interval = tokio::time::interval(Duration::from_secs(
        settings.sync_interval_secs.max(MIN_INTERVAL_SECS),
    ));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            // Periodic cycle; the first tick fires immediately.
            _ = interval.tick() => {
                run_sync(&manager).await;
            }

            Some(event) = watcher.event_rx().recv() => {
                if manager.consume_sync_write(&event.path) {
                    debug!(path = %event.path, "own write echoed back; ignoring");
                } else {
                    if event.kind == FileEventKind::Modified {
                        manager.mark_edited(&event.path);
                    }
                    run_sync(&manager).await;
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                manager.cancel_token().cancel();
                break;
            }
        }
    }

    info!("Shutting down");
    Ok(())
}

/// Trigger a cycle and log anything that needs the user's attention.
/// Cycle summaries are logged by the engine itself.
async fn run_sync(manager: &Manager) {
    match manager.sync_now().await {
        Ok(SyncOutcome::Completed(_)) | Ok(SyncOutcome::Coalesced) => {}
        Ok(SyncOutcome::Offline) => info!("Server unreachable; will retry"),
        Ok(SyncOutcome::Locked) => warn!("Workspace locked; run `sync-daemon unlock`"),
        Ok(SyncOutcome::LoggedOut) => warn!("Session ended; run `sync-daemon login`"),
        Ok(SyncOutcome::Disabled) => warn!("Sync disabled in settings"),
        Ok(SyncOutcome::Cancelled(_)) => info!("Sync cancelled"),
        Err(e) => tracing::error!("Sync failed: {e}"),
    }
}

async fn cmd_sync(workspace: &Path) -> Result<()> {
    let engine = build_engine(workspace).await?;
    engine.manager.start();

    match engine.manager.sync_now().await? {
        SyncOutcome::Completed(report) => {
            println!(
                "Sync complete: {} pushed, {} pulled, {} deleted here, {} deleted remotely, {} conflicts",
                report.pushed,
                report.pulled,
                report.deleted_local,
                report.deleted_remote,
                report.conflicts
            );
            if !report.is_clean() {
                println!(
                    "  ({} skipped, {} failed and will retry, {} deferred)",
                    report.skipped, report.failed_retryable, report.deferred
                );
            }
        }
        SyncOutcome::Offline => println!("Server unreachable; changes will sync later."),
        SyncOutcome::Locked => println!("Workspace locked; run `sync-daemon unlock`."),
        SyncOutcome::LoggedOut => println!("No usable session; run `sync-daemon login`."),
        SyncOutcome::Disabled => println!("Sync is not enabled; run `sync-daemon login`."),
        SyncOutcome::Coalesced => println!("A sync is already running."),
        SyncOutcome::Cancelled(_) => println!("Sync was cancelled."),
    }
    Ok(())
}

async fn cmd_login(
    workspace: &Path,
    email: &str,
    server: Option<String>,
    password: Option<String>,
) -> Result<()> {
    let store = open_store(workspace)?;
    let mut settings = SyncSettings::load(&store);
    if let Some(server) = server {
        settings.server_url = server;
    }
    settings.email = Some(email.to_string());
    if settings.workspace_salt.is_none() {
        // Derived from the email, so every device lands on the same salt
        // without an exchange step.
        settings.workspace_salt = Some(BASE64.encode(derive_workspace_salt(email)));
    }
    settings.enabled = true;
    settings.save(&store)?;

    let password = resolve_password(password, "Password")?;
    let remote = Arc::new(HttpRemoteStore::new(&settings.server_url)?);
    let tokens = Arc::new(TokenManager::new(Arc::clone(&store), Arc::clone(&remote)));
    let auth = AuthService::new(Arc::clone(&store), remote, tokens);
    auth.login(email, &password, true).await?;

    println!("Logged in as {email}. Sync is enabled for this workspace.");
    Ok(())
}

async fn cmd_register(
    workspace: &Path,
    email: &str,
    server: Option<String>,
    password: Option<String>,
) -> Result<()> {
    let store = open_store(workspace)?;
    let settings = SyncSettings::load(&store);
    let server_url = server.unwrap_or(settings.server_url);

    let password = resolve_password(password, "Choose a password")?;
    let remote = Arc::new(HttpRemoteStore::new(&server_url)?);
    let tokens = Arc::new(TokenManager::new(Arc::clone(&store), Arc::clone(&remote)));
    let auth = AuthService::new(Arc::clone(&store), remote, tokens);
    auth.register(email, &password).await?;

    println!("Account created for {email}. Run `sync-daemon login --email {email}` to start syncing.");
    Ok(())
}

async fn cmd_logout(workspace: &Path) -> Result<()> {
    let engine = build_engine(workspace).await?;
    let auth = AuthService::new(
        Arc::clone(&engine.store),
        Arc::clone(&engine.remote),
        Arc::clone(&engine.tokens),
    );
    auth.logout().await?;
    println!("Logged out. Local notes are untouched.");
    Ok(())
}

async fn cmd_unlock(workspace: &Path, password: Option<String>) -> Result<()> {
    let engine = build_engine(workspace).await?;
    let password = resolve_password(password, "Password")?;

    match engine.manager.unlock(&password) {
        SyncState::Idle => println!("Unlocked. Sync will resume on the next cycle."),
        SyncState::LoggedOut => println!("Unlocked, but no session; run `sync-daemon login`."),
        state => println!("Could not unlock (state: {state})."),
    }
    Ok(())
}

async fn cmd_status(workspace: &Path) -> Result<()> {
    let engine = build_engine(workspace).await?;
    let state = engine.manager.start();
    let settings = SyncSettings::load(&engine.store);

    println!("State:    {state}");
    println!("Server:   {}", settings.server_url);
    println!(
        "Account:  {}",
        settings.email.as_deref().unwrap_or("(not logged in)")
    );

    let devices = DeviceManager::new(Arc::clone(&engine.store));
    let device = devices.current_device()?;
    println!("Device:   {} ({})", device.display_name, device.id);

    let db = engine.manager.database();
    if let Some(cursor) = db.cursor().await {
        println!("Cursor:   {cursor}");
    }

    let dirty = db.list_dirty().await?;
    println!(
        "Pending:  {} modified, {} new, {} deleted",
        dirty.modified.len(),
        dirty.created.len(),
        dirty.missing.len()
    );

    let conflicts = db.conflicts().await;
    if !conflicts.is_empty() {
        println!("Unresolved conflicts:");
        for conflict in conflicts {
            println!(
                "  {} (detected {})",
                conflict.relative_path, conflict.detected_at
            );
        }
    }
    Ok(())
}

fn cmd_devices(workspace: &Path, command: DevicesCommand) -> Result<()> {
    let store = open_store(workspace)?;
    let devices = DeviceManager::new(Arc::clone(&store));

    match command {
        DevicesCommand::List => {
            let current = devices.current_device()?;
            println!("{} ({}) [this device]", current.display_name, current.id);
            for device in devices.list_known_devices()? {
                if device.id != current.id {
                    println!(
                        "{} ({}) last seen {}",
                        device.display_name, device.id, device.last_seen_at
                    );
                }
            }
        }
        DevicesCommand::Revoke { id } => {
            if devices.revoke_device(&id)? {
                println!("Device {id} removed from the local registry.");
            } else {
                println!("No known device with id {id}.");
            }
        }
    }
    Ok(())
}
