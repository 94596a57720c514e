//! Client-side handle on one worker process.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::connection::{Connection, ConnectionResult, Frame, Suspender};
use crate::protocol::{HostArgs, Locator, MessageError, MetaData, Request};

use super::job::JobId;
use super::launcher::Launcher;

/// Identifier of a worker handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub(crate) u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Matching key of a worker: `(protocol, host, port, user)`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerKey {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
}

impl WorkerKey {
    pub fn for_locator(locator: &Locator) -> Self {
        Self {
            protocol: locator.scheme.clone(),
            host: locator.host.clone(),
            port: locator.port,
            user: locator.user.clone(),
        }
    }
}

impl fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.protocol)?;
        if let Some(user) = &self.user {
            write!(f, "{user}@")?;
        }
        write!(f, "{}", self.host)?;
        if self.port != 0 {
            write!(f, ":{}", self.port)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Active,
    /// Detached from every pool, waiting to be picked up again.
    Listening,
    Dead,
}

/// What a worker's reader task forwards to the scheduler loop.
#[derive(Debug)]
pub struct WorkerEvent {
    pub worker: WorkerId,
    /// `None` once the channel has ended.
    pub frame: Option<Frame>,
}

/// A live worker as seen by the scheduler.
pub struct WorkerHandle {
    id: WorkerId,
    protocol: String,
    pid: u32,
    target: Option<HostArgs>,
    state: WorkerState,
    idle_since: Instant,
    job: Option<JobId>,
    outgoing: Option<mpsc::UnboundedSender<Frame>>,
    suspender: Suspender,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl WorkerHandle {
    /// Take over `conn` and start its reader and writer tasks. Frames read are
    /// forwarded to `events` tagged with `id`.
    pub fn start(
        id: WorkerId,
        protocol: impl Into<String>,
        pid: u32,
        conn: Connection,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> ConnectionResult<Self> {
        let suspender = conn.suspender();
        let (mut source, mut sink) = conn.into_split()?;
        let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();

        let reader = tokio::spawn(async move {
            loop {
                let frame = source.next().await;
                let done = frame.is_none();
                if events.send(WorkerEvent { worker: id, frame }).is_err() || done {
                    break;
                }
            }
        });

        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Err(err) = sink.send(frame).await {
                    tracing::debug!(worker = %id, error = %err, "worker channel write failed");
                    break;
                }
            }
            sink.close().await;
        });

        Ok(Self {
            id,
            protocol: protocol.into(),
            pid,
            target: None,
            state: WorkerState::Idle,
            idle_since: Instant::now(),
            job: None,
            outgoing: Some(tx),
            suspender,
            reader,
            writer,
        })
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn job(&self) -> Option<JobId> {
        self.job
    }

    pub fn target(&self) -> Option<&HostArgs> {
        self.target.as_ref()
    }

    pub fn is_alive(&self) -> bool {
        self.state != WorkerState::Dead
    }

    /// Matching key, once a target has been set.
    pub fn key(&self) -> Option<WorkerKey> {
        self.target.as_ref().map(|target| WorkerKey {
            protocol: self.protocol.clone(),
            host: target.host.clone(),
            port: target.port,
            user: target.user.clone(),
        })
    }

    /// Same protocol, host, port and user.
    pub fn matches_exactly(&self, key: &WorkerKey) -> bool {
        self.key().as_ref() == Some(key)
    }

    pub fn matches_protocol(&self, protocol: &str) -> bool {
        self.protocol == protocol
    }

    /// Queue a command frame for the worker.
    pub fn send(&self, request: &Request) -> Result<(), MessageError> {
        let frame = Frame::new(request.code().as_u8(), request.encode()?);
        match &self.outgoing {
            Some(tx) if tx.send(frame).is_ok() => {}
            _ => tracing::debug!(worker = %self.id, command = %request.code(), "worker channel closed; frame dropped"),
        }
        Ok(())
    }

    /// Point the worker at a new target: protocol config first, then `Host`.
    pub fn set_target(&mut self, host: HostArgs, config: &MetaData) -> Result<(), MessageError> {
        tracing::debug!(worker = %self.id, host = %host.host, port = host.port, "setting target");
        self.send(&Request::Config(config.clone()))?;
        self.send(&Request::Host(host.clone()))?;
        self.target = Some(host);
        Ok(())
    }

    /// Forget the target so the next job configures the worker again.
    pub fn reset_target(&mut self) {
        self.target = None;
    }

    pub fn bind(&mut self, job: JobId) {
        self.job = Some(job);
        self.state = WorkerState::Active;
    }

    /// Release the bound job, returning it.
    pub fn unbind(&mut self) -> Option<JobId> {
        self.job.take()
    }

    /// Stamp the start of an idle period. A suspended channel is resumed.
    pub fn mark_idle(&mut self) {
        self.job = None;
        self.state = WorkerState::Idle;
        self.idle_since = Instant::now();
        self.suspender.resume();
    }

    pub fn idle_for(&self) -> Duration {
        self.idle_since.elapsed()
    }

    pub fn idle_since(&self) -> Instant {
        self.idle_since
    }

    /// Stop forwarding frames from the worker. The worker blocks once the
    /// channel's buffers fill.
    pub fn suspend(&mut self) {
        self.suspender.suspend();
    }

    pub fn resume(&mut self) {
        self.suspender.resume();
    }

    pub fn is_suspended(&self) -> bool {
        self.suspender.is_suspended()
    }

    /// Suspend the worker and detach it from every pool.
    pub fn park(&mut self) {
        self.suspend();
        self.state = WorkerState::Listening;
    }

    /// Mark dead, stop the channel tasks and terminate the process. Calling
    /// this more than once is harmless.
    pub fn kill(&mut self, launcher: &Arc<dyn Launcher>) {
        if self.state == WorkerState::Dead {
            return;
        }
        tracing::debug!(worker = %self.id, pid = self.pid, "killing worker");
        self.shutdown_channel();
        let launcher = Arc::clone(launcher);
        let pid = self.pid;
        tokio::spawn(async move { launcher.terminate(pid).await });
    }

    /// Let the process go without terminating it; queued frames are still
    /// written before the channel closes.
    pub fn release(&mut self) {
        if self.state == WorkerState::Dead {
            return;
        }
        tracing::debug!(worker = %self.id, pid = self.pid, "releasing worker");
        self.state = WorkerState::Dead;
        self.job = None;
        self.outgoing = None;
        self.reader.abort();
    }

    fn shutdown_channel(&mut self) {
        self.state = WorkerState::Dead;
        self.job = None;
        self.outgoing = None;
        self.reader.abort();
        self.writer.abort();
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("protocol", &self.protocol)
            .field("pid", &self.pid)
            .field("state", &self.state)
            .field("job", &self.job)
            .finish()
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
