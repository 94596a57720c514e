//! Materialising workers.
//!
//! The scheduler only sees [`Launcher::spawn`], which hands back a process id
//! and an address the worker listens on. [`ProcessLauncher`] starts worker
//! binaries; [`InProcessLauncher`] runs protocol implementations as tasks in
//! the current runtime.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::config::{Settings, WorkerSettings};
use crate::connection::{Address, ChannelBackend, Connection, TransportKind};
use crate::worker::{StopFlag, WorkerContext, WorkerProtocol, WorkerResult, WorkerRuntime};

use super::error::LaunchError;

/// Prefix of the line a worker prints once it is listening.
pub const ADDRESS_PREFIX: &str = "ADDRESS ";

/// How long an in-process worker waits for the scheduler to connect.
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(30);

/// A freshly started worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spawned {
    pub pid: u32,
    pub address: Address,
}

/// Starts and stops worker processes for the scheduler.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Start a worker for `protocol`. `host_hint` is the first target it will
    /// serve.
    async fn spawn(&self, protocol: &str, host_hint: &str) -> Result<Spawned, LaunchError>;

    /// Best-effort termination. Unknown ids are ignored.
    async fn terminate(&self, pid: u32);
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Child processes
// ============================================================================

/// Runs worker binaries resolved through [`Settings::worker_command`].
///
/// Each worker is started with `--listen <transport>` and must print
/// `ADDRESS <addr>` on stdout within the spawn timeout.
pub struct ProcessLauncher {
    settings: Settings,
    children: Mutex<HashMap<u32, Child>>,
}

impl ProcessLauncher {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            children: Mutex::new(HashMap::new()),
        }
    }

    fn command(&self, protocol: &str) -> Result<(PathBuf, Command), LaunchError> {
        let (program, args) = self.settings.worker_command(protocol)?;
        let mut command = Command::new(&program);
        command
            .args(&args)
            .arg("--listen")
            .arg(self.settings.launcher.transport.to_string());
        if let Some(dir) = self.settings.launcher.resolved_socket_dir()? {
            command.arg("--socket-dir").arg(dir);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        Ok((program, command))
    }
}

/// Read stdout until the worker announces where it listens.
async fn read_address(child: &mut Child) -> Result<Address, LaunchError> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| LaunchError::Handshake("worker stdout not captured".to_string()))?;
    let mut lines = BufReader::new(stdout).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| LaunchError::Handshake(e.to_string()))?
    {
        if let Some(address) = line.strip_prefix(ADDRESS_PREFIX) {
            return address.trim().parse().map_err(LaunchError::Channel);
        }
        tracing::debug!(line = %line, "ignoring worker output before its address");
    }

    Err(LaunchError::Handshake(
        "worker exited before announcing an address".to_string(),
    ))
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn spawn(&self, protocol: &str, host_hint: &str) -> Result<Spawned, LaunchError> {
        let (program, mut command) = self.command(protocol)?;
        let mut child = command.spawn().map_err(|source| LaunchError::Spawn {
            command: program.display().to_string(),
            source,
        })?;
        let pid = child
            .id()
            .ok_or_else(|| LaunchError::Handshake("worker exited immediately".to_string()))?;

        let timeout = self.settings.launcher.spawn_timeout();
        let address = match tokio::time::timeout(timeout, read_address(&mut child)).await {
            Ok(Ok(address)) => address,
            Ok(Err(err)) => {
                let _ = child.start_kill();
                return Err(err);
            }
            Err(_) => {
                let _ = child.start_kill();
                return Err(LaunchError::Timeout {
                    protocol: protocol.to_string(),
                    timeout,
                });
            }
        };

        tracing::info!(protocol, host = host_hint, pid, %address, "worker process started");
        lock(&self.children).insert(pid, child);
        Ok(Spawned { pid, address })
    }

    async fn terminate(&self, pid: u32) {
        let child = lock(&self.children).remove(&pid);
        if let Some(mut child) = child {
            if let Err(err) = child.kill().await {
                tracing::debug!(pid, error = %err, "worker already gone");
            }
        }
    }
}

// ============================================================================
// In-process tasks
// ============================================================================

type RunWorker = Arc<dyn Fn(WorkerContext) -> BoxFuture<'static, WorkerResult<()>> + Send + Sync>;

struct Running {
    task: JoinHandle<()>,
    stop: StopFlag,
}

/// Runs registered protocol implementations as tasks, each behind its own
/// listening backend so the scheduler talks to it exactly as to a process.
pub struct InProcessLauncher {
    transport: TransportKind,
    socket_dir: Option<PathBuf>,
    settings: WorkerSettings,
    pool: Option<Address>,
    factories: HashMap<String, RunWorker>,
    running: Mutex<HashMap<u32, Running>>,
    next_pid: AtomicU32,
    spawns: AtomicUsize,
}

impl Default for InProcessLauncher {
    fn default() -> Self {
        Self::new(TransportKind::Local)
    }
}

impl InProcessLauncher {
    pub fn new(transport: TransportKind) -> Self {
        Self {
            transport,
            socket_dir: None,
            settings: WorkerSettings::default(),
            pool: None,
            factories: HashMap::new(),
            running: Mutex::new(HashMap::new()),
            next_pid: AtomicU32::new(1),
            spawns: AtomicUsize::new(0),
        }
    }

    pub fn with_socket_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.socket_dir = Some(dir.into());
        self
    }

    pub fn with_worker_settings(mut self, settings: WorkerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Endpoint workers return to when their client goes away or publishes
    /// them on hold.
    pub fn with_pool_address(mut self, pool: Address) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Serve `protocol` with instances built by `factory`.
    pub fn register<P, F>(mut self, protocol: &str, factory: F) -> Self
    where
        P: WorkerProtocol + 'static,
        F: Fn() -> P + Send + Sync + 'static,
    {
        let run: RunWorker = Arc::new(move |ctx: WorkerContext| -> BoxFuture<'static, WorkerResult<()>> {
            let protocol = factory();
            Box::pin(async move { WorkerRuntime::new(protocol, ctx).run().await })
        });
        self.factories.insert(protocol.to_string(), run);
        self
    }

    /// Number of workers started so far.
    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    /// Ids of workers whose tasks are still running.
    pub fn live_pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = lock(&self.running)
            .iter()
            .filter(|(_, running)| !running.task.is_finished())
            .map(|(pid, _)| *pid)
            .collect();
        pids.sort_unstable();
        pids
    }
}

#[async_trait]
impl Launcher for InProcessLauncher {
    async fn spawn(&self, protocol: &str, host_hint: &str) -> Result<Spawned, LaunchError> {
        let run = self
            .factories
            .get(protocol)
            .cloned()
            .ok_or_else(|| LaunchError::UnknownProtocol(protocol.to_string()))?;

        let mut backend = ChannelBackend::new(self.transport);
        if let Some(dir) = &self.socket_dir {
            backend = backend.with_socket_dir(dir.clone());
        }
        let address = backend.listen()?;

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let stop = StopFlag::new();
        let settings = self.settings.clone();
        let pool = self.pool.clone();
        let name = protocol.to_string();
        let worker_stop = stop.clone();

        let task = tokio::spawn(async move {
            let transport = match backend.accept(Some(ACCEPT_TIMEOUT)).await {
                Ok(transport) => transport,
                Err(err) => {
                    tracing::warn!(protocol = %name, pid, error = %err, "in-process worker never got a client");
                    return;
                }
            };
            let mut ctx = WorkerContext::new(name.clone(), Connection::from_transport(transport), &settings)
                .with_stop_flag(worker_stop);
            if let Some(pool) = pool {
                ctx = ctx.with_pool(pool);
            }
            if let Err(err) = run(ctx).await {
                tracing::warn!(protocol = %name, pid, error = %err, "in-process worker failed");
            }
            drop(backend);
        });

        self.spawns.fetch_add(1, Ordering::SeqCst);
        lock(&self.running).insert(pid, Running { task, stop });
        tracing::debug!(protocol, host = host_hint, pid, %address, "in-process worker started");
        Ok(Spawned { pid, address })
    }

    async fn terminate(&self, pid: u32) {
        if let Some(running) = lock(&self.running).remove(&pid) {
            running.stop.request();
            running.task.abort();
        }
    }
}
