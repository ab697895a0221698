use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::{io::AsyncReadExt, sync::watch};

use pane_relay::{
    config::{resolve_config_path, BridgeConfig, RuntimePaths},
    daemon::{DaemonLifecycle, DaemonStatus},
    hook::{parse_payload, HookEvent, LifecycleEvent},
    inject::{current_pane, TmuxInjector},
    logging::{ensure_fallback_logging, init_logging},
    notifier::{EmitOutcome, NotificationEmitter},
    registrar::{short_id, EndOutcome, SessionRegistrar, StartOutcome},
    router::{AuthorizedSender, ReplyRouter},
    store::SessionStore,
    telegram::TelegramClient,
    transport::ChatTransport,
    typing::TypingIndicator,
};

/// Hooks run inside the assistant's own time budget.
const HOOK_BUDGET: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "pane-relay")]
#[command(about = "Bridges coding-assistant sessions in tmux panes with Telegram forum topics")]
struct Cli {
    /// Path to config.json (default: $PANE_RELAY_CONFIG or the user config dir).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Hook entry points. Read one JSON payload from stdin, print `{}`, always exit 0.
    #[command(subcommand)]
    Hook(HookCommand),
    /// Control the reply router daemon.
    #[command(subcommand)]
    Daemon(DaemonCommand),
    /// Print the session registry.
    Sessions,
}

#[derive(Debug, Subcommand)]
enum HookCommand {
    /// SessionStart / SessionEnd: create or retire the session's topic.
    Register,
    /// PermissionRequest, PostToolUse(Failure), Notification, Stop: post to the session's topic.
    Notify,
}

#[derive(Debug, Subcommand)]
enum DaemonCommand {
    Start,
    Stop,
    Status,
    /// Run the reply router in the foreground.
    Run {
        /// Log to daemon.log instead of stderr.
        #[arg(long, hide = true)]
        detached: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Hook(cmd) => {
            match tokio::time::timeout(HOOK_BUDGET, run_hook(cmd, cli.config)).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => {
                    // Config errors surface before the hooks.log subscriber exists.
                    ensure_fallback_logging();
                    tracing::error!(target = "pane_relay::hook", error = %format!("{error:#}"), "hook failed")
                }
                Err(_) => {
                    ensure_fallback_logging();
                    tracing::error!(target = "pane_relay::hook", "hook exceeded its time budget")
                }
            }
            println!("{{}}");
            Ok(())
        }
        Commands::Daemon(cmd) => run_daemon_command(cmd, cli.config).await,
        Commands::Sessions => {
            let (config, _, paths) = load_config(cli.config)?;
            init_logging(&config.log_level, None)?;
            print_sessions(&config, &paths)
        }
    }
}

fn load_config(explicit: Option<PathBuf>) -> Result<(BridgeConfig, PathBuf, RuntimePaths)> {
    let path = resolve_config_path(explicit)?;
    let config = BridgeConfig::load(&path)?;
    let paths = config.runtime_paths(&path);
    Ok((config, path, paths))
}

fn telegram(config: &BridgeConfig) -> Arc<dyn ChatTransport> {
    Arc::new(TelegramClient::new(
        config.api_base_url.clone(),
        config.bot_token.clone(),
        config.group_chat_id,
    ))
}

async fn run_hook(cmd: HookCommand, config_path: Option<PathBuf>) -> Result<()> {
    let (config, config_path, paths) = load_config(config_path)?;
    paths.ensure_state_dir()?;
    init_logging(&config.log_level, Some(&paths.hooks_log))?;

    let mut input = String::new();
    tokio::io::stdin()
        .read_to_string(&mut input)
        .await
        .context("failed to read hook payload")?;
    let payload = parse_payload(&input).context("hook payload is not valid JSON")?;
    tracing::debug!(
        target = "pane_relay::hook",
        event = %payload.hook_event_name,
        command = ?cmd,
        "hook invoked"
    );

    let store = SessionStore::new(&paths.registry, config.lock_timeout());
    let transport = telegram(&config);

    match payload.into_event() {
        HookEvent::Lifecycle {
            session_id,
            event: LifecycleEvent::Start { cwd },
        } => {
            let Some(pane) = current_pane().await else {
                tracing::info!(
                    target = "pane_relay::hook",
                    session_id = %session_id,
                    "not running inside tmux; session not bridged"
                );
                return Ok(());
            };
            let registrar = SessionRegistrar::new(store, transport);
            match registrar.on_start(&session_id, &pane, cwd).await? {
                StartOutcome::Registered(session) => tracing::info!(
                    target = "pane_relay::hook",
                    session_id = %session.session_id,
                    thread_id = session.thread_id,
                    "registered"
                ),
                StartOutcome::AlreadyRegistered(_) => {}
            }
            if matches!(cmd, HookCommand::Register) {
                ensure_daemon(&paths, &config_path);
            }
        }
        HookEvent::Lifecycle {
            session_id,
            event: LifecycleEvent::End,
        } => {
            let registrar = SessionRegistrar::new(store, transport);
            if let EndOutcome::ArchiveFailed(_) = registrar.on_end(&session_id).await? {
                tracing::warn!(
                    target = "pane_relay::hook",
                    session_id = %session_id,
                    "thread left open; entry marked closed"
                );
            }
        }
        HookEvent::Attention { session_id, event } => {
            let emitter = NotificationEmitter::new(store, transport);
            if let EmitOutcome::Sent { message_id, .. } = emitter.emit(&session_id, &event).await? {
                tracing::debug!(target = "pane_relay::hook", message_id = message_id, "delivered");
            }
        }
        HookEvent::ToolResult {
            session_id,
            outcome,
        } => {
            let emitter = NotificationEmitter::new(store, transport);
            if let EmitOutcome::Sent { message_id, .. } =
                emitter.follow_up(&session_id, &outcome).await?
            {
                tracing::debug!(target = "pane_relay::hook", message_id = message_id, "delivered");
            }
        }
        HookEvent::Ignored { hook_event_name } => {
            tracing::debug!(
                target = "pane_relay::hook",
                event = %hook_event_name,
                "event not handled"
            );
        }
    }
    Ok(())
}

fn ensure_daemon(paths: &RuntimePaths, config_path: &Path) {
    let lifecycle = DaemonLifecycle::new(paths.clone());
    if lifecycle.is_running() {
        return;
    }
    let started = std::env::current_exe()
        .context("cannot locate own executable")
        .and_then(|exe| lifecycle.start(&exe, config_path));
    match started {
        Ok(status) => {
            tracing::info!(target = "pane_relay::hook", status = ?status, "daemon auto-started")
        }
        Err(error) => tracing::warn!(
            target = "pane_relay::hook",
            error = %format!("{error:#}"),
            "failed to auto-start daemon"
        ),
    }
}

async fn run_daemon_command(cmd: DaemonCommand, config_path: Option<PathBuf>) -> Result<()> {
    let (config, config_path, paths) = load_config(config_path)?;
    let lifecycle = DaemonLifecycle::new(paths.clone());

    match cmd {
        DaemonCommand::Start => {
            init_logging(&config.log_level, None)?;
            let exe = std::env::current_exe().context("cannot locate own executable")?;
            match lifecycle.start(&exe, &config_path)? {
                DaemonStatus::Running { pid: Some(pid) } => println!("daemon running (pid {pid})"),
                _ => println!("daemon running"),
            }
            Ok(())
        }
        DaemonCommand::Stop => {
            init_logging(&config.log_level, None)?;
            match lifecycle.stop()? {
                DaemonStatus::Stale { pid } => println!("removed stale pid file (pid {pid})"),
                _ => println!("daemon stopped"),
            }
            Ok(())
        }
        DaemonCommand::Status => {
            match lifecycle.status() {
                DaemonStatus::Running { pid: Some(pid) } => println!("running (pid {pid})"),
                DaemonStatus::Running { pid: None } => println!("running"),
                DaemonStatus::Stale { pid } => println!("not running (stale pid {pid})"),
                DaemonStatus::Stopped => println!("not running"),
            }
            Ok(())
        }
        DaemonCommand::Run { detached } => {
            let log_file = detached.then_some(paths.daemon_log.as_path());
            init_logging(&config.log_level, log_file)?;
            let _instance = lifecycle.acquire()?;
            run_router(&config, &paths).await
        }
    }
}

async fn run_router(config: &BridgeConfig, paths: &RuntimePaths) -> Result<()> {
    let store = SessionStore::new(&paths.registry, config.lock_timeout());
    let transport = telegram(config);
    let indicator = TypingIndicator::new(store.clone(), transport.clone());
    let router = ReplyRouter::new(
        store,
        transport,
        Arc::new(TmuxInjector::default()),
        AuthorizedSender {
            user_id: config.user_id,
            chat_id: config.group_chat_id,
        },
        config.poll_timeout(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(()) => tracing::info!(target = "pane_relay::daemon", "shutdown signal received"),
            Err(error) => tracing::error!(
                target = "pane_relay::daemon",
                error = %error,
                "failed to install signal handlers"
            ),
        }
        let _ = shutdown_tx.send(true);
    });

    let typing = tokio::spawn(indicator.run(shutdown_rx.clone()));
    router.run(shutdown_rx).await;
    if let Err(error) = typing.await {
        tracing::warn!(
            target = "pane_relay::daemon",
            error = %error,
            "typing indicator task failed"
        );
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = sigterm.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

fn print_sessions(config: &BridgeConfig, paths: &RuntimePaths) -> Result<()> {
    let store = SessionStore::new(&paths.registry, config.lock_timeout());
    let registry = store.load()?;
    if registry.is_empty() {
        println!("no sessions ({})", paths.registry.display());
        return Ok(());
    }
    println!(
        "{:<10} {:<7} {:>8} {:<8} {:<20} CWD",
        "SESSION", "STATUS", "TOPIC", "PANE", "LAST ACTIVITY"
    );
    for session in registry.iter() {
        println!(
            "{:<10} {:<7} {:>8} {:<8} {:<20} {}",
            short_id(&session.session_id),
            session.status.as_str(),
            session.thread_id,
            session.pane_address,
            session.last_activity_at.format("%Y-%m-%d %H:%M:%S"),
            session.cwd.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}
