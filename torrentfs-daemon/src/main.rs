//! torrentfsd - the TorrentFS daemon.
//!
//! Composition root: configuration, session backend, torrent manager,
//! directory watcher, alert pump, resume saver, and the RPC server, built
//! at startup and torn down in reverse order on shutdown.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use torrentfs_core::manager::watcher::DirWatcher;
use torrentfs_core::{
    CliLogLevel, DaemonConfig, RpcServer, SimSession, TorrentManager, bind_socket,
    default_socket_path, init_tracing,
};

#[derive(Parser)]
#[command(name = "torrentfsd")]
#[command(about = "Serve in-progress torrents as a read-only filesystem over a local RPC socket")]
struct Args {
    /// Load a .torrent file at startup (repeatable).
    #[arg(long = "torrent", value_name = "PATH")]
    torrents: Vec<PathBuf>,

    /// Watch a directory for .torrent files.
    #[arg(long = "torrent-dir", value_name = "PATH")]
    torrent_dir: Option<PathBuf>,

    /// Cache root directory.
    #[arg(long, default_value = "./cache", value_name = "PATH")]
    cache: PathBuf,

    /// Control socket path. Defaults to $TORRENTFSD_SOCKET, then
    /// $XDG_RUNTIME_DIR/torrentfsd.sock, then /tmp/torrentfsd.sock.
    #[arg(long, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Run a prefetch pass over each torrent when it loads.
    #[arg(long)]
    prefetch: bool,

    /// Skip hash-checking existing cache data (faster, unsafe).
    #[arg(long)]
    skip_check: bool,

    /// Console log level.
    #[arg(long, default_value = "info")]
    log_level: CliLogLevel,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.log_level.as_tracing_level());

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "startup failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let (mut config, config_path) = DaemonConfig::load_default()?;
    if let Some(path) = &config_path {
        tracing::info!(path = %path.display(), "loaded configuration");
    }
    if args.prefetch {
        config.prefetch.on_start = true;
    }

    // The in-tree backend is the deterministic sim session; a production
    // build wires a libtorrent-backed SessionBackend into the same seam.
    let session = Arc::new(SimSession::new());

    let manager = TorrentManager::new(
        Arc::new(config),
        config_path,
        session,
        args.cache.clone(),
        args.torrent_dir.clone(),
        args.skip_check,
    );

    tokio::spawn(manager.clone().run_alert_pump());
    tokio::spawn(manager.clone().run_resume_saver());

    for path in &args.torrents {
        manager.load_torrent_file(path).await?;
    }

    if let Some(torrent_dir) = args.torrent_dir.clone() {
        let watcher = DirWatcher::new(manager.clone(), torrent_dir);
        tokio::spawn(watcher.run());
    }

    let socket_path = args.socket.unwrap_or_else(default_socket_path);
    let listener = bind_socket(&socket_path)?;
    tracing::info!(socket = %socket_path.display(), "torrentfsd listening");

    let server = RpcServer::new(manager.clone());
    tokio::select! {
        _ = server.run(listener) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutting down");
        }
    }

    manager.shutdown_all().await;
    if let Err(e) = std::fs::remove_file(&socket_path) {
        tracing::debug!(error = %e, "socket cleanup failed");
    }
    Ok(())
}
