//! `relayd` — the Relay Core binary. Wires together the durable store, the
//! RPC Bridge WebSocket listener, the REST surface, and the idle scheduler
//! behind one shared [`relayd::AppContext`].
//!
//! Exit codes: `0` on a clean shutdown, `1` on a configuration error
//! (missing/invalid `RELAY_ENCRYPTION_KEY`, bad CLI args), `2` on an
//! unrecoverable runtime error (failed to bind a listener, failed to open
//! the store).

use anyhow::Result;
use clap::Parser;
use std::{path::PathBuf, process::ExitCode, sync::Arc};
use tracing::info;

use relayd::{
    bridge,
    bridge::event::EventBroadcaster,
    config::{self, DaemonConfig},
    journal::Journal,
    repo::RepoRegistry,
    rest,
    sandbox::manager::SandboxManager,
    scheduler,
    secrets::SecretBox,
    session::SessionManager,
    storage::Storage,
    AppContext,
};

#[derive(Parser, Debug)]
#[command(name = "relayd", about = "Relay Core: session/sandbox lifecycle manager and RPC bridge")]
struct Args {
    /// RPC Bridge WebSocket port. The REST surface listens on this port + 1.
    #[arg(short = 'p', long, env = "RELAY_PORT")]
    port: Option<u16>,

    /// Bind address for both listeners.
    #[arg(long, env = "RELAY_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Directory for the SQLite store, session workspaces, and secret manifests.
    #[arg(long = "data-dir", env = "RELAY_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("fatal: failed to start tokio runtime: {e}");
            return ExitCode::from(2);
        }
    };

    match runtime.block_on(run(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(RunError::Config(e)) => {
            eprintln!("configuration error: {e}");
            ExitCode::from(1)
        }
        Err(RunError::Runtime(e)) => {
            eprintln!("fatal: {e}");
            ExitCode::from(2)
        }
    }
}

enum RunError {
    Config(anyhow::Error),
    Runtime(anyhow::Error),
}

async fn run(args: Args) -> Result<(), RunError> {
    let log_level = std::env::var("RELAY_LOG").unwrap_or_else(|_| "info".to_string());
    let _log_guard = setup_logging(&log_level, args.data_dir.as_deref());

    let data_dir = args.data_dir.unwrap_or_else(config::default_data_dir);
    let port = args.port.unwrap_or_else(config::default_port);
    let max_sessions = std::env::var("RELAY_MAX_SESSIONS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(config::default_max_sessions);

    let (encryption_key, key_version) = config::encryption_key_from_env().map_err(RunError::Config)?;

    std::fs::create_dir_all(&data_dir)
        .map_err(|e| RunError::Config(anyhow::anyhow!("failed to create data dir {}: {e}", data_dir.display())))?;

    let config = Arc::new(DaemonConfig::new(args.host, port, data_dir.clone(), log_level, max_sessions));

    info!(host = %config.host, bridge_port = config.port, rest_port = config.rest_port, data_dir = %data_dir.display(), sandbox_provider = %config.sandbox_provider, "relayd starting");

    let storage = Arc::new(Storage::new(&data_dir).await.map_err(RunError::Runtime)?);
    let journal = Arc::new(Journal::new(storage.clone()));
    let broadcaster = Arc::new(EventBroadcaster::new());
    let repo_registry = Arc::new(RepoRegistry::new(storage.clone()));
    let secrets = Arc::new(SecretBox::new(storage.clone(), &encryption_key, key_version).map_err(RunError::Config)?);
    let sandbox = Arc::new(SandboxManager::new(
        config.agent_binary.clone(),
        data_dir.clone(),
        config.remote_base_url.clone(),
        config.remote_token.clone(),
    ));
    let session_manager = Arc::new(SessionManager::new(
        storage.clone(),
        journal.clone(),
        broadcaster.clone(),
        sandbox,
        secrets.clone(),
        data_dir.clone(),
    ));

    let recovered = storage.recover_stale_sessions().await.map_err(RunError::Runtime)?;
    if recovered > 0 {
        info!(recovered, "marked sessions left active by a prior crash as errored");
    }

    scheduler::spawn_idle_reaper(session_manager.clone(), config.idle_minutes);
    scheduler::spawn_event_pruner(storage.clone(), config.session_prune_days);

    let ctx = Arc::new(AppContext {
        config: config.clone(),
        storage: storage.clone(),
        journal: journal.clone(),
        broadcaster: broadcaster.clone(),
        repo_registry,
        session_manager: session_manager.clone(),
        secrets,
        started_at: std::time::Instant::now(),
    });

    let host = config.host.clone();
    let bridge_host = host.clone();
    let bridge_port = config.port;
    let bridge_session_manager = session_manager.clone();
    let bridge_journal = journal.clone();
    let bridge_broadcaster = broadcaster.clone();
    let bridge_handle = tokio::spawn(async move {
        bridge::run(&bridge_host, bridge_port, bridge_session_manager, bridge_journal, bridge_broadcaster).await
    });

    let rest_host = host.clone();
    let rest_port = config.rest_port;
    let rest_ctx = ctx.clone();
    let rest_handle = tokio::spawn(async move { rest::start_rest_server(&rest_host, rest_port, rest_ctx).await });

    tokio::select! {
        result = bridge_handle => {
            return Err(RunError::Runtime(join_result(result, "bridge accept loop")));
        }
        result = rest_handle => {
            return Err(RunError::Runtime(join_result(result, "REST server")));
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received, draining active sessions");
        }
    }

    session_manager.drain().await;
    info!("relayd shut down cleanly");
    Ok(())
}

fn join_result(result: Result<Result<()>, tokio::task::JoinError>, what: &str) -> anyhow::Error {
    match result {
        Ok(Ok(())) => anyhow::anyhow!("{what} exited unexpectedly"),
        Ok(Err(e)) => e.context(format!("{what} failed")),
        Err(e) => anyhow::anyhow!("{what} task panicked: {e}"),
    }
}

/// Sets up `tracing-subscriber`. When a data dir is available, logs go to
/// both stdout and a daily-rolling file under `{data_dir}/logs/`; the
/// returned guard must stay alive for the process lifetime. Falls back to
/// stdout-only if the log directory can't be created — never panics on a
/// bad path.
fn setup_logging(log_level: &str, data_dir: Option<&std::path::Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    if let Some(data_dir) = data_dir {
        let log_dir = data_dir.join("logs");
        if let Err(e) = std::fs::create_dir_all(&log_dir) {
            eprintln!("warn: could not create log directory '{}': {e} — falling back to stdout", log_dir.display());
            tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
            return None;
        }

        let appender = tracing_appender::rolling::daily(&log_dir, "relayd.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(log_level))
            .with(tracing_subscriber::fmt::layer().compact())
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).json())
            .init();

        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
        None
    }
}

