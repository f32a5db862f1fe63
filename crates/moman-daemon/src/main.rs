use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use moman_daemon::config::Config;
use moman_daemon::manager::MonitorManager;
use moman_daemon::server::CommandServer;
use moman_daemon::watcher::spawn_watcher;

/// Local supervisor for monitor and scraper worker processes.
#[derive(Parser, Debug)]
#[command(name = "momand", version, about)]
struct Args {
    /// Base directory for sockets, configs and the registry.
    #[arg(long)]
    base_dir: Option<PathBuf>,

    /// Socket directory override.
    #[arg(long)]
    socket_dir: Option<PathBuf>,

    /// Config tree override.
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Worker registry document override.
    #[arg(long)]
    registry: Option<PathBuf>,

    /// Interpreter used to launch worker scripts.
    #[arg(long)]
    interpreter: Option<PathBuf>,

    /// Seconds a new worker gets to publish a responsive socket.
    #[arg(long, default_value_t = 2)]
    confirm_window: u64,
}

fn init_logging() {
    let filter = EnvFilter::try_from_env("MOMAN_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn build_config(args: &Args) -> Config {
    let mut config = match &args.base_dir {
        Some(base) => Config::with_base_dir(base.clone()),
        None => Config::default(),
    };
    if let Some(dir) = &args.socket_dir {
        config.socket_dir = dir.clone();
    }
    if let Some(dir) = &args.config_dir {
        config.config_dir = dir.clone();
    }
    if let Some(path) = &args.registry {
        config.registry_path = path.clone();
    }
    config.interpreter = args.interpreter.clone();
    config.add_confirm_window = Duration::from_secs(args.confirm_window);
    config
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging();

    let config = build_config(&args);
    let socket_path = config.supervisor_socket_path();
    let manager = MonitorManager::new(config);

    let server = CommandServer::bind(&socket_path, manager.config().read_timeout)
        .await
        .with_context(|| format!("binding {}", socket_path.display()))?;
    let handlers = Arc::new(manager.handlers());

    let watcher = spawn_watcher(Arc::clone(&manager), manager.subscribe_shutdown());
    let reaper = manager.spawn_reaper();
    let server_task = tokio::spawn(server.run(handlers, manager.subscribe_shutdown()));
    info!(event = "supervisor_started", socket = %socket_path.display());

    let mut shutdown = manager.subscribe_shutdown();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!(event = "interrupted");
            manager
                .on_shutdown(moman_core::Cmd::new(
                    moman_core::Command::MmStopMonitorManager,
                ))
                .await;
        }
        _ = shutdown.changed() => {}
    }

    let _ = tokio::join!(server_task, watcher, reaper);
    info!(event = "supervisor_stopped");
    Ok(())
}
