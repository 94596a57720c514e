//! ioworker-file - worker process serving the `file` protocol
//!
//! Usage:
//!   ioworker-file --listen local [--socket-dir <dir>] [--pool <addr>]
//!   ioworker-file --connect <addr> [--pool <addr>]
//!
//! In listen mode the worker prints `ADDRESS <addr>` on stdout once it can be
//! reached, then serves the first client that connects. Logs go to stderr.

use clap::Parser;
use ioworker::config::Settings;
use ioworker::connection::{Address, ChannelBackend, Connection, TransportKind};
use ioworker::scheduler::ADDRESS_PREFIX;
use ioworker::worker::{install_fatal_handlers, install_stop_handlers, StopFlag, WorkerContext, WorkerRuntime};
use ioworker::workers::{file, FileWorker};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// How long a listening worker waits for its client.
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "ioworker-file")]
#[command(about = "ioworker worker for the file protocol")]
#[command(version)]
struct Cli {
    /// Listen on a fresh endpoint of this transport (local or tcp)
    #[arg(long, conflicts_with = "connect")]
    listen: Option<TransportKind>,

    /// Directory for the local socket file
    #[arg(long, requires = "listen")]
    socket_dir: Option<PathBuf>,

    /// Connect to a client endpoint instead of listening
    #[arg(long)]
    connect: Option<Address>,

    /// Endpoint to return to when detached or when the client goes away
    #[arg(long)]
    pool: Option<Address>,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing();

    if let Err(e) = install_fatal_handlers() {
        tracing::warn!(error = %e, "cannot install fatal signal handlers");
    }
    let stop = StopFlag::new();
    if let Err(e) = install_stop_handlers(stop.clone()) {
        tracing::warn!(error = %e, "cannot install stop handlers");
    }

    let settings = Settings::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "using default settings");
        Settings::default()
    });

    let conn = match (&cli.connect, cli.listen) {
        (Some(address), _) => match Connection::connect(address, settings.scheduler.connect_timeout()).await {
            Ok(conn) => conn,
            Err(e) => {
                eprintln!("Error connecting to '{}': {}", address, e);
                return ExitCode::FAILURE;
            }
        },
        (None, listen) => {
            let mut backend = ChannelBackend::new(listen.unwrap_or_default());
            if let Some(dir) = &cli.socket_dir {
                backend = backend.with_socket_dir(dir.clone());
            }
            match listen_for_client(&mut backend).await {
                Ok(conn) => conn,
                Err(e) => {
                    eprintln!("Error: {}", e);
                    return ExitCode::FAILURE;
                }
            }
        }
    };

    let mut ctx = WorkerContext::new(file::PROTOCOL, conn, &settings.worker).with_stop_flag(stop);
    if let Some(pool) = cli.pool {
        ctx = ctx.with_pool(pool);
    }

    match WorkerRuntime::new(FileWorker::default(), ctx).run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "worker failed");
            ExitCode::FAILURE
        }
    }
}

/// Announce the listening address on stdout and accept one client.
async fn listen_for_client(backend: &mut ChannelBackend) -> Result<Connection, String> {
    let address = backend.listen().map_err(|e| e.to_string())?;

    let mut stdout = std::io::stdout();
    writeln!(stdout, "{ADDRESS_PREFIX}{address}")
        .and_then(|()| stdout.flush())
        .map_err(|e| format!("cannot announce address: {e}"))?;

    let transport = backend
        .accept(Some(ACCEPT_TIMEOUT))
        .await
        .map_err(|e| e.to_string())?;
    backend.close();
    tracing::debug!(%address, "client connected");
    Ok(Connection::from_transport(transport))
}
