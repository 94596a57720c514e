//! The scheduler loop and the handle callers talk to it through.
//!
//! One task owns every pool, handle, queue and the held slot. Callers send it
//! commands through [`Scheduler`]; worker reader tasks send it
//! [`WorkerEvent`]s. Nothing else touches scheduler state.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::config::{Settings, SettingsError};
use crate::connection::Connection;
use crate::protocol::{ErrorCode, HostArgs, Locator, MessageError, MetaData, Reply, Request};

use super::error::{JobError, LaunchError, SchedulerError, SchedulerResult};
use super::handle::{WorkerEvent, WorkerHandle, WorkerId, WorkerKey};
use super::job::{Job, JobEvent, JobHandle, JobId, JobState};
use super::launcher::{Launcher, ProcessLauncher};
use super::pool::ProtocolPool;

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(180);
const DEFAULT_MAX_WORKERS: usize = 3;
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_LOOKAHEAD: usize = 10;

static GLOBAL: Mutex<Option<Scheduler>> = Mutex::new(None);

// ============================================================================
// Options
// ============================================================================

/// Tuning for a scheduler instance.
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Idle workers older than this are killed.
    pub idle_timeout: Duration,
    /// Cap on active workers for protocols without their own.
    pub max_workers: usize,
    /// Bound on connecting to a freshly spawned worker.
    pub connect_timeout: Duration,
    /// Queued jobs scanned for an exact idle match.
    pub lookahead: usize,
    pub protocol_caps: BTreeMap<String, usize>,
    /// Sent with `Config` whenever a worker is (re)targeted.
    pub protocol_config: BTreeMap<String, MetaData>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_workers: DEFAULT_MAX_WORKERS,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            lookahead: DEFAULT_LOOKAHEAD,
            protocol_caps: BTreeMap::new(),
            protocol_config: BTreeMap::new(),
        }
    }
}

impl SchedulerOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            idle_timeout: settings.scheduler.idle_timeout(),
            max_workers: settings.scheduler.max_workers,
            connect_timeout: settings.scheduler.connect_timeout(),
            lookahead: settings.scheduler.lookahead,
            protocol_caps: settings
                .protocols
                .iter()
                .filter_map(|(name, p)| p.max_workers.map(|cap| (name.clone(), cap)))
                .collect(),
            protocol_config: settings
                .protocols
                .iter()
                .filter(|(_, p)| !p.metadata.is_empty())
                .map(|(name, p)| (name.clone(), p.metadata.clone()))
                .collect(),
        }
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_protocol_config(mut self, protocol: &str, config: MetaData) -> Self {
        self.protocol_config.insert(protocol.to_string(), config);
        self
    }

    pub fn cap_for(&self, protocol: &str) -> usize {
        self.protocol_caps
            .get(protocol)
            .copied()
            .unwrap_or(self.max_workers)
    }

    pub fn config_for(&self, protocol: &str) -> MetaData {
        self.protocol_config
            .get(protocol)
            .cloned()
            .unwrap_or_default()
    }
}

// ============================================================================
// Snapshots
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSummary {
    pub id: WorkerId,
    pub pid: u32,
    pub key: Option<WorkerKey>,
    pub job: Option<JobId>,
}

impl WorkerSummary {
    fn of(handle: &WorkerHandle) -> Self {
        Self {
            id: handle.id(),
            pid: handle.pid(),
            key: handle.key(),
            job: handle.job(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub cap: usize,
    pub queued: Vec<JobId>,
    pub active: Vec<WorkerSummary>,
    pub idle: Vec<WorkerSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldSnapshot {
    pub worker: WorkerSummary,
    pub locator: Locator,
}

/// Point-in-time view of the scheduler.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerSnapshot {
    pub pools: BTreeMap<String, PoolSnapshot>,
    pub held: Option<HeldSnapshot>,
    pub connected: Vec<WorkerSummary>,
    /// Live handles, in any list or none.
    pub workers: usize,
}

impl SchedulerSnapshot {
    pub fn pool(&self, protocol: &str) -> Option<&PoolSnapshot> {
        self.pools.get(protocol)
    }

    pub fn active_count(&self, protocol: &str) -> usize {
        self.pool(protocol).map_or(0, |p| p.active.len())
    }

    pub fn idle_count(&self, protocol: &str) -> usize {
        self.pool(protocol).map_or(0, |p| p.idle.len())
    }

    pub fn queued_count(&self, protocol: &str) -> usize {
        self.pool(protocol).map_or(0, |p| p.queued.len())
    }
}

// ============================================================================
// Connected workers
// ============================================================================

/// Notifications for a worker obtained with
/// [`Scheduler::get_connected_worker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectedEvent {
    Connected,
    Error { code: ErrorCode, text: String },
    Died,
}

/// A worker reserved for one caller, with an open remote connection.
#[derive(Debug)]
pub struct ConnectedWorker {
    id: WorkerId,
    pid: u32,
    events: mpsc::UnboundedReceiver<ConnectedEvent>,
}

impl ConnectedWorker {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub async fn next_event(&mut self) -> Option<ConnectedEvent> {
        self.events.recv().await
    }
}

// ============================================================================
// Handle
// ============================================================================

enum Command {
    Submit {
        id: JobId,
        job: Job,
        events: mpsc::UnboundedSender<JobEvent>,
        direct: bool,
    },
    Cancel(JobId),
    Reply {
        job: JobId,
        request: Request,
    },
    Flow {
        job: JobId,
        suspended: bool,
    },
    PutOnHold {
        job: JobId,
        locator: Locator,
        reply: oneshot::Sender<SchedulerResult<()>>,
    },
    PublishHold,
    RemoveHold,
    GetConnected {
        locator: Locator,
        config: MetaData,
        reply: oneshot::Sender<SchedulerResult<ConnectedWorker>>,
    },
    AssignJob {
        worker: WorkerId,
        id: JobId,
        job: Job,
        events: mpsc::UnboundedSender<JobEvent>,
        reply: oneshot::Sender<SchedulerResult<()>>,
    },
    Disconnect {
        worker: WorkerId,
        reply: oneshot::Sender<SchedulerResult<()>>,
    },
    Reparse(Option<String>),
    Snapshot(oneshot::Sender<SchedulerSnapshot>),
    Shutdown(oneshot::Sender<()>),
}

/// Cheap, cloneable handle on a running scheduler.
#[derive(Clone)]
pub struct Scheduler {
    commands: mpsc::UnboundedSender<Command>,
    next_job: Arc<AtomicU64>,
}

impl Scheduler {
    /// Start a scheduler loop on the current runtime.
    pub fn start(options: SchedulerOptions, launcher: Arc<dyn Launcher>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let core = Core::new(options, launcher, rx);
        tokio::spawn(core.run());
        Self {
            commands: tx,
            next_job: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The process-wide scheduler, started on first use with settings from
    /// the default locations and the process launcher.
    pub fn global() -> Result<Scheduler, SettingsError> {
        let mut slot = GLOBAL.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(scheduler) = slot.as_ref().filter(|s| s.is_running()) {
            return Ok(scheduler.clone());
        }
        let settings = Settings::load()?;
        let scheduler = Self::start(
            SchedulerOptions::from_settings(&settings),
            Arc::new(ProcessLauncher::new(settings)),
        );
        *slot = Some(scheduler.clone());
        Ok(scheduler)
    }

    /// The process-wide scheduler, started with `settings` if not running.
    pub fn global_with(settings: Settings) -> Scheduler {
        let mut slot = GLOBAL.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(scheduler) = slot.as_ref().filter(|s| s.is_running()) {
            return scheduler.clone();
        }
        let scheduler = Self::start(
            SchedulerOptions::from_settings(&settings),
            Arc::new(ProcessLauncher::new(settings)),
        );
        *slot = Some(scheduler.clone());
        scheduler
    }

    /// Tear down the process-wide scheduler. The next [`global`](Self::global)
    /// starts a fresh one.
    pub async fn shutdown_global() {
        let scheduler = GLOBAL.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(scheduler) = scheduler {
            if let Err(err) = scheduler.shutdown().await {
                tracing::debug!(error = %err, "global scheduler already stopped");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    fn send(&self, command: Command) -> SchedulerResult<()> {
        self.commands
            .send(command)
            .map_err(|_| SchedulerError::Stopped)
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> SchedulerResult<T> {
        let (tx, rx) = oneshot::channel();
        self.send(build(tx))?;
        rx.await.map_err(|_| SchedulerError::Stopped)
    }

    fn next_job_id(&self) -> JobId {
        JobId(self.next_job.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn submit_with(&self, job: Job, direct: bool) -> SchedulerResult<JobHandle> {
        let id = self.next_job_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.send(Command::Submit {
            id,
            job,
            events: tx,
            direct,
        })?;
        Ok(JobHandle::new(id, self.clone(), rx))
    }

    /// Queue a job on its protocol's pool.
    pub fn submit(&self, job: Job) -> SchedulerResult<JobHandle> {
        self.submit_with(job, false)
    }

    /// Place a job immediately, starting a worker beyond the protocol's cap
    /// if nothing idle can take it.
    pub fn submit_direct(&self, job: Job) -> SchedulerResult<JobHandle> {
        self.submit_with(job, true)
    }

    /// Cancel a job. A bound job's worker is killed.
    pub fn cancel(&self, job: JobId) -> SchedulerResult<()> {
        self.send(Command::Cancel(job))
    }

    /// Forward a caller's answer to the worker running `job`.
    pub(crate) fn reply(&self, job: JobId, request: Request) -> SchedulerResult<()> {
        self.send(Command::Reply { job, request })
    }

    /// Pause or resume delivery of `job`'s events from its worker.
    pub(crate) fn set_flow(&self, job: JobId, suspended: bool) -> SchedulerResult<()> {
        self.send(Command::Flow { job, suspended })
    }

    /// Detach the worker running `job` and keep it for a follow-up fetch of
    /// `locator`. The job completes; any previously held worker is killed.
    pub async fn put_worker_on_hold(&self, job: JobId, locator: Locator) -> SchedulerResult<()> {
        self.request(|reply| Command::PutOnHold {
            job,
            locator,
            reply,
        })
        .await?
    }

    /// Hand the held worker back to its pool endpoint.
    pub fn publish_worker_on_hold(&self) -> SchedulerResult<()> {
        self.send(Command::PublishHold)
    }

    /// Kill the held worker, if any.
    pub fn remove_worker_on_hold(&self) -> SchedulerResult<()> {
        self.send(Command::RemoveHold)
    }

    /// Reserve a worker for `locator` and ask it to connect. The cap does not
    /// apply.
    pub async fn get_connected_worker(
        &self,
        locator: Locator,
        config: MetaData,
    ) -> SchedulerResult<ConnectedWorker> {
        self.request(|reply| Command::GetConnected {
            locator,
            config,
            reply,
        })
        .await?
    }

    /// Queue a job on a connected worker. Jobs run one at a time once the
    /// worker reports it is connected.
    pub async fn assign_job_to_worker(&self, worker: WorkerId, job: Job) -> SchedulerResult<JobHandle> {
        let id = self.next_job_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.request(|reply| Command::AssignJob {
            worker,
            id,
            job,
            events: tx,
            reply,
        })
        .await??;
        Ok(JobHandle::new(id, self.clone(), rx))
    }

    /// Cancel the worker's queued jobs, disconnect it and return it to its
    /// pool.
    pub async fn disconnect_worker(&self, worker: WorkerId) -> SchedulerResult<()> {
        self.request(|reply| Command::Disconnect { worker, reply })
            .await?
    }

    /// Ask workers of `protocol` (all when `None`) to reload configuration.
    pub fn reparse_configuration(&self, protocol: Option<&str>) -> SchedulerResult<()> {
        self.send(Command::Reparse(protocol.map(str::to_string)))
    }

    pub async fn snapshot(&self) -> SchedulerResult<SchedulerSnapshot> {
        self.request(Command::Snapshot).await
    }

    /// Cancel every job, kill every worker and stop the loop.
    pub async fn shutdown(&self) -> SchedulerResult<()> {
        self.request(Command::Shutdown).await
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("running", &self.is_running())
            .finish()
    }
}

// ============================================================================
// Loop state
// ============================================================================

struct JobEntry {
    job: Job,
    events: mpsc::UnboundedSender<JobEvent>,
    state: JobState,
    worker: Option<WorkerId>,
}

struct HeldWorker {
    worker: WorkerId,
    locator: Locator,
}

struct ConnectedSlot {
    events: mpsc::UnboundedSender<ConnectedEvent>,
    queue: VecDeque<JobId>,
    connected: bool,
}

enum Placement {
    Held(WorkerId),
    Idle(WorkerId),
    Spawn,
    Wait,
}

/// Send the target (if it changed), the job's metadata and its command.
fn dispatch_job(handle: &mut WorkerHandle, job: &Job, config: &MetaData) -> Result<(), MessageError> {
    let host = job.host_args();
    if handle.target() != Some(&host) {
        handle.set_target(host, config)?;
    }
    if !job.metadata().is_empty() {
        handle.send(&Request::MetaData(job.metadata().clone()))?;
    }
    handle.send(job.request())
}

fn host_for(locator: &Locator) -> HostArgs {
    HostArgs {
        host: locator.host.clone(),
        port: locator.port,
        user: locator.user.clone(),
        pass: locator.pass.clone(),
    }
}

struct Core {
    options: SchedulerOptions,
    launcher: Arc<dyn Launcher>,
    commands: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    pools: BTreeMap<String, ProtocolPool>,
    workers: HashMap<WorkerId, WorkerHandle>,
    jobs: HashMap<JobId, JobEntry>,
    held: Option<HeldWorker>,
    connected: HashMap<WorkerId, ConnectedSlot>,
    next_worker: u64,
    dirty: bool,
    eviction_deadline: Option<Instant>,
}

impl Core {
    fn new(
        options: SchedulerOptions,
        launcher: Arc<dyn Launcher>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (events_tx, events) = mpsc::unbounded_channel();
        Self {
            options,
            launcher,
            commands,
            events_tx,
            events,
            pools: BTreeMap::new(),
            workers: HashMap::new(),
            jobs: HashMap::new(),
            held: None,
            connected: HashMap::new(),
            next_worker: 0,
            dirty: false,
            eviction_deadline: None,
        }
    }

    async fn run(mut self) {
        tracing::debug!("scheduler loop started");

        loop {
            if self.dirty {
                self.dirty = false;
                self.schedule_all().await;
            }

            let deadline = self.eviction_deadline;
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else { break };
                    if !self.handle_command(command).await {
                        return;
                    }
                }
                Some(event) = self.events.recv() => self.handle_worker_event(event),
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.evict_idle();
                }
            }
        }

        self.teardown();
        tracing::debug!("scheduler loop finished");
    }

    /// `false` once the loop should stop.
    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Submit {
                id,
                job,
                events,
                direct,
            } => self.submit(id, job, events, direct).await,
            Command::Cancel(id) => self.cancel(id),
            Command::Reply { job, request } => self.forward(job, request),
            Command::Flow { job, suspended } => self.set_flow(job, suspended),
            Command::PutOnHold { job, locator, reply } => {
                let _ = reply.send(self.put_on_hold(job, locator));
            }
            Command::PublishHold => self.publish_hold(),
            Command::RemoveHold => self.remove_hold(),
            Command::GetConnected {
                locator,
                config,
                reply,
            } => {
                let result = self.get_connected(locator, config).await;
                let _ = reply.send(result);
            }
            Command::AssignJob {
                worker,
                id,
                job,
                events,
                reply,
            } => {
                let _ = reply.send(self.assign_job(worker, id, job, events));
            }
            Command::Disconnect { worker, reply } => {
                let _ = reply.send(self.disconnect(worker));
            }
            Command::Reparse(protocol) => self.reparse(protocol.as_deref()),
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown(reply) => {
                self.teardown();
                tracing::debug!("scheduler shut down");
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn pool_mut(&mut self, protocol: &str) -> &mut ProtocolPool {
        let cap = self.options.cap_for(protocol);
        self.pools
            .entry(protocol.to_string())
            .or_insert_with(|| ProtocolPool::new(protocol, cap))
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    async fn submit(&mut self, id: JobId, job: Job, events: mpsc::UnboundedSender<JobEvent>, direct: bool) {
        tracing::debug!(job = %id, locator = %job.locator(), command = %job.command(), direct, "job submitted");
        let protocol = job.protocol().to_string();
        self.jobs.insert(
            id,
            JobEntry {
                job,
                events,
                state: JobState::Queued,
                worker: None,
            },
        );

        if direct {
            let placement = self.place(id, true);
            self.start_placement(id, placement).await;
        } else {
            self.pool_mut(&protocol).enqueue(id);
            self.dirty = true;
        }
    }

    /// Decide where a job goes: the held worker, an exact idle match, any
    /// idle worker of the protocol, or a new worker. Queued jobs wait while
    /// the pool is at its cap.
    fn place(&mut self, id: JobId, bypass_cap: bool) -> Placement {
        let Some(entry) = self.jobs.get(&id) else {
            return Placement::Wait;
        };
        let protocol = entry.job.protocol().to_string();
        let key = entry.job.key();
        let locator = entry.job.locator().clone();
        let plain_fetch = entry.job.is_plain_fetch();

        // A held worker this job cannot use is killed even when the job has
        // to wait.
        let held_usable = self.held.as_ref().map(|held| {
            plain_fetch
                && held.locator == locator
                && self
                    .workers
                    .get(&held.worker)
                    .is_some_and(|w| w.matches_protocol(&protocol))
        });
        if held_usable == Some(false) {
            if let Some(held) = self.held.take() {
                tracing::debug!(worker = %held.worker, job = %id, "held worker does not fit; killing it");
                self.drop_worker(held.worker, JobError::WorkerDied);
            }
        }

        let cap = self.options.cap_for(&protocol);
        let has_capacity = self
            .pools
            .entry(protocol.clone())
            .or_insert_with(|| ProtocolPool::new(&protocol, cap))
            .has_capacity();
        if !bypass_cap && !has_capacity {
            return Placement::Wait;
        }

        if let Some(held) = self.held.take() {
            return Placement::Held(held.worker);
        }

        let workers = &self.workers;
        let idle = self
            .pools
            .get(&protocol)
            .and_then(|pool| pool.find_idle(&key, |w| workers.get(&w).and_then(WorkerHandle::key)));
        if let Some((worker, exact)) = idle {
            tracing::debug!(job = %id, worker = %worker, exact, "idle worker found");
            return Placement::Idle(worker);
        }
        Placement::Spawn
    }

    async fn start_placement(&mut self, id: JobId, placement: Placement) {
        match placement {
            Placement::Held(worker) => self.start_job(worker, id, true),
            Placement::Idle(worker) => self.start_job(worker, id, false),
            Placement::Spawn => self.spawn_for(id).await,
            Placement::Wait => {}
        }
    }

    async fn schedule_all(&mut self) {
        let protocols: Vec<String> = self
            .pools
            .iter()
            .filter(|(_, pool)| pool.queue_len() > 0)
            .map(|(name, _)| name.clone())
            .collect();
        for protocol in protocols {
            self.schedule_pool(&protocol).await;
        }
    }

    /// Place queued jobs of one protocol until one has to wait.
    async fn schedule_pool(&mut self, protocol: &str) {
        loop {
            let Some(pool) = self.pools.get(protocol) else {
                return;
            };
            let workers = &self.workers;
            let jobs = &self.jobs;
            let key_of = |w: WorkerId| workers.get(&w).and_then(WorkerHandle::key);
            let index = pool.next_candidate(self.options.lookahead, |job| {
                jobs.get(&job)
                    .is_some_and(|entry| pool.has_exact_idle(&entry.job.key(), key_of))
            });
            let Some(index) = index else {
                return;
            };
            let Some(candidate) = pool.queued().nth(index) else {
                return;
            };

            let placement = self.place(candidate, false);
            if matches!(placement, Placement::Wait) {
                return;
            }
            if let Some(pool) = self.pools.get_mut(protocol) {
                pool.take_queued(index);
            }
            self.start_placement(candidate, placement).await;
        }
    }

    async fn spawn_for(&mut self, id: JobId) {
        let Some((protocol, host)) = self.jobs.get_mut(&id).map(|entry| {
            entry.state = JobState::Dispatching;
            (entry.job.protocol().to_string(), entry.job.locator().host.clone())
        }) else {
            return;
        };

        match self.spawn_worker(&protocol, &host).await {
            Ok(worker) => self.start_job(worker, id, false),
            Err(err) => {
                tracing::warn!(job = %id, protocol = %protocol, error = %err, "cannot start worker");
                self.resolve(id, Err(JobError::from(&err)));
            }
        }
    }

    async fn spawn_worker(&mut self, protocol: &str, host: &str) -> Result<WorkerId, LaunchError> {
        let spawned = self.launcher.spawn(protocol, host).await?;
        let conn = match Connection::connect(&spawned.address, self.options.connect_timeout).await {
            Ok(conn) => conn,
            Err(err) => {
                self.launcher.terminate(spawned.pid).await;
                return Err(err.into());
            }
        };

        self.next_worker += 1;
        let id = WorkerId(self.next_worker);
        let handle = match WorkerHandle::start(id, protocol, spawned.pid, conn, self.events_tx.clone()) {
            Ok(handle) => handle,
            Err(err) => {
                self.launcher.terminate(spawned.pid).await;
                return Err(err.into());
            }
        };
        tracing::info!(worker = %id, pid = spawned.pid, protocol, address = %spawned.address, "worker started");
        self.workers.insert(id, handle);
        Ok(id)
    }

    /// Bind `id` to `worker` and send it the job. A held worker is resumed
    /// and told to carry on instead.
    fn start_job(&mut self, worker: WorkerId, id: JobId, from_hold: bool) {
        let Some(protocol) = self.jobs.get(&id).map(|e| e.job.protocol().to_string()) else {
            return;
        };
        if !self.workers.contains_key(&worker) {
            self.resolve(id, Err(JobError::WorkerDied));
            return;
        }
        let config = self.options.config_for(&protocol);
        if !self.connected.contains_key(&worker) {
            self.pool_mut(&protocol).add_active(worker);
        }

        let (Some(entry), Some(handle)) = (self.jobs.get_mut(&id), self.workers.get_mut(&worker)) else {
            return;
        };
        entry.state = JobState::Bound;
        entry.worker = Some(worker);
        handle.bind(id);

        let sent = if from_hold {
            handle.resume();
            handle.send(&Request::None)
        } else {
            dispatch_job(handle, &entry.job, &config)
        };
        let _ = entry.events.send(JobEvent::WorkerAssigned {
            worker,
            pid: handle.pid(),
        });
        tracing::debug!(job = %id, worker = %worker, command = %entry.job.command(), from_hold, "job bound");

        if let Err(err) = sent {
            tracing::error!(job = %id, worker = %worker, error = %err, "cannot encode job");
            self.job_done(worker, id, Err(JobError::Internal(err.to_string())));
        }
    }

    // ------------------------------------------------------------------
    // Completion and failure
    // ------------------------------------------------------------------

    /// Deliver the terminal event. Later calls for the same job do nothing.
    fn resolve(&mut self, id: JobId, result: Result<(), JobError>) {
        let Some(entry) = self.jobs.remove(&id) else {
            return;
        };
        if entry.state == JobState::Queued {
            if let Some(pool) = self.pools.get_mut(entry.job.protocol()) {
                pool.dequeue(id);
            }
            for slot in self.connected.values_mut() {
                slot.queue.retain(|&queued| queued != id);
            }
        }
        let _ = entry.events.send(JobEvent::Finished(result));
    }

    /// The bound job ended; the worker goes back to idle (or on to the next
    /// job of a connected worker).
    fn job_done(&mut self, worker: WorkerId, id: JobId, result: Result<(), JobError>) {
        match &result {
            Ok(()) => tracing::debug!(job = %id, worker = %worker, "job finished"),
            Err(err) => tracing::debug!(job = %id, worker = %worker, error = %err, "job failed"),
        }
        self.resolve(id, result);

        let Some(handle) = self.workers.get_mut(&worker) else {
            return;
        };
        handle.mark_idle();
        if self.connected.contains_key(&worker) {
            self.start_next_connected(worker);
            return;
        }
        let protocol = handle.protocol().to_string();
        self.pool_mut(&protocol).add_idle(worker);
        self.dirty = true;
        self.rearm_eviction();
    }

    /// Remove a worker from every list, kill it and fail whatever it owned
    /// with `outcome`.
    fn drop_worker(&mut self, worker: WorkerId, outcome: JobError) {
        let Some(mut handle) = self.workers.remove(&worker) else {
            return;
        };
        let job = handle.unbind();
        handle.kill(&self.launcher);

        if let Some(pool) = self.pools.get_mut(handle.protocol()) {
            pool.remove_worker(worker);
        }
        if self.held.as_ref().is_some_and(|held| held.worker == worker) {
            self.held = None;
        }
        if let Some(id) = job {
            self.resolve(id, Err(outcome.clone()));
        }
        if let Some(slot) = self.connected.remove(&worker) {
            let _ = slot.events.send(ConnectedEvent::Died);
            for id in slot.queue {
                self.resolve(id, Err(outcome.clone()));
            }
        }
        self.dirty = true;
        self.rearm_eviction();
    }

    fn worker_died(&mut self, worker: WorkerId) {
        if let Some(handle) = self.workers.get(&worker) {
            tracing::warn!(worker = %worker, pid = handle.pid(), protocol = handle.protocol(), job = ?handle.job(), "worker died");
        }
        self.drop_worker(worker, JobError::WorkerDied);
    }

    fn cancel(&mut self, id: JobId) {
        let Some(entry) = self.jobs.get(&id) else {
            tracing::debug!(job = %id, "cancel for unknown job");
            return;
        };
        let bound = entry.worker.filter(|_| entry.state == JobState::Bound);
        self.resolve(id, Err(JobError::Cancelled));
        if let Some(worker) = bound {
            tracing::debug!(job = %id, worker = %worker, "cancelled bound job; killing its worker");
            self.drop_worker(worker, JobError::Cancelled);
        }
    }

    fn send_to(&self, worker: WorkerId, request: &Request) {
        let Some(handle) = self.workers.get(&worker) else {
            return;
        };
        if let Err(err) = handle.send(request) {
            tracing::error!(worker = %worker, command = %request.code(), error = %err, "cannot encode command");
        }
    }

    fn forward(&mut self, id: JobId, request: Request) {
        match self.jobs.get(&id).and_then(|entry| entry.worker) {
            Some(worker) => self.send_to(worker, &request),
            None => tracing::warn!(job = %id, command = %request.code(), "answer for a job with no worker"),
        }
    }

    fn set_flow(&mut self, id: JobId, suspended: bool) {
        let worker = self
            .jobs
            .get(&id)
            .filter(|entry| entry.state == JobState::Bound)
            .and_then(|entry| entry.worker);
        let Some(handle) = worker.and_then(|w| self.workers.get_mut(&w)) else {
            tracing::debug!(job = %id, suspended, "flow change for a job with no worker");
            return;
        };
        if suspended {
            handle.suspend();
        } else {
            handle.resume();
        }
        tracing::debug!(job = %id, worker = %handle.id(), suspended, "job flow changed");
    }

    // ------------------------------------------------------------------
    // Worker frames
    // ------------------------------------------------------------------

    fn handle_worker_event(&mut self, event: WorkerEvent) {
        let WorkerEvent { worker, frame } = event;
        let Some(frame) = frame else {
            self.worker_died(worker);
            return;
        };
        let Some(handle) = self.workers.get(&worker) else {
            return;
        };
        let job = handle.job();

        let reply = match Reply::decode(frame.code, &frame.payload) {
            Ok(reply) => reply,
            Err(err) => {
                tracing::error!(worker = %worker, code = frame.code, error = %err, "undecodable frame from worker; killing it");
                if let Some(id) = job {
                    self.resolve(id, Err(JobError::Internal(format!("worker sent an invalid reply: {err}"))));
                }
                self.drop_worker(worker, JobError::WorkerDied);
                return;
            }
        };

        match job {
            Some(id) => self.job_reply(worker, id, reply),
            None => self.unbound_reply(worker, reply),
        }
    }

    fn job_reply(&mut self, worker: WorkerId, id: JobId, reply: Reply) {
        let Some(hold_on_mime) = self.jobs.get(&id).map(|e| e.job.holds_on_mime_type()) else {
            return;
        };

        let event = match reply {
            Reply::Finished => return self.job_done(worker, id, Ok(())),
            Reply::Error { code, text } => {
                return self.job_done(worker, id, Err(JobError::Operation { code, text }));
            }
            Reply::MimeType(mime) => {
                if !hold_on_mime {
                    self.send_to(worker, &Request::None);
                }
                JobEvent::MimeType(mime)
            }
            Reply::NetRequest(host) => {
                self.send_to(worker, &Request::NetworkStatus(true));
                JobEvent::NetworkRequested(host)
            }
            Reply::NetDrop(host) => JobEvent::NetworkDropped(host),
            Reply::TotalSize(n) => JobEvent::TotalSize(n),
            Reply::ProcessedSize(n) => JobEvent::ProcessedSize(n),
            Reply::Speed(n) => JobEvent::Speed(n),
            Reply::Position(n) => JobEvent::Position(n),
            Reply::Redirection(locator) => JobEvent::Redirection(locator),
            Reply::Renamed(locator) => JobEvent::Renamed(locator),
            Reply::ErrorPage => JobEvent::ErrorPage,
            Reply::Warning(text) => JobEvent::Warning(text),
            Reply::GettingFile(name) => JobEvent::GettingFile(name),
            Reply::NeedPassword(auth) => JobEvent::NeedPassword(auth),
            Reply::InfoMessage(text) => JobEvent::InfoMessage(text),
            Reply::MetaData(map) => JobEvent::MetaData(map),
            Reply::MessageBox(request) => JobEvent::MessageBox(request),
            Reply::Data(bytes) => JobEvent::Data(bytes),
            Reply::DataReq => JobEvent::DataRequested,
            Reply::Connected => JobEvent::Connected,
            Reply::StatEntry(entry) => JobEvent::StatEntry(entry),
            Reply::ListEntries(entries) => JobEvent::ListEntries(entries),
            Reply::Resume(offset) => JobEvent::ResumeOffered(offset),
            Reply::CanResume => JobEvent::CanResume,
            Reply::NeedSubUrlData => JobEvent::NeedSubUrlData,
            Reply::WorkerStatus(report) => {
                tracing::debug!(worker = %worker, ?report, "worker status");
                return;
            }
            Reply::WorkerAck => return,
        };

        if let Some(entry) = self.jobs.get(&id) {
            let _ = entry.events.send(event);
        }
    }

    fn unbound_reply(&mut self, worker: WorkerId, reply: Reply) {
        if let Some(slot) = self.connected.get_mut(&worker) {
            match reply {
                Reply::Connected => {
                    tracing::debug!(worker = %worker, "connected worker is connected");
                    slot.connected = true;
                    let _ = slot.events.send(ConnectedEvent::Connected);
                    self.start_next_connected(worker);
                    return;
                }
                Reply::Error { code, text } => {
                    let _ = slot.events.send(ConnectedEvent::Error { code, text });
                    return;
                }
                _ => {}
            }
        }

        match reply {
            Reply::WorkerStatus(report) => tracing::debug!(worker = %worker, ?report, "worker status"),
            other => tracing::debug!(worker = %worker, code = other.code(), "ignoring reply with no job"),
        }
    }

    // ------------------------------------------------------------------
    // Held worker
    // ------------------------------------------------------------------

    fn put_on_hold(&mut self, id: JobId, locator: Locator) -> SchedulerResult<()> {
        let entry = self.jobs.get(&id).ok_or(SchedulerError::UnknownJob(id))?;
        let worker = entry
            .worker
            .filter(|_| entry.state == JobState::Bound)
            .ok_or(SchedulerError::NotBound(id))?;

        if let Some(previous) = self.held.take() {
            tracing::debug!(worker = %previous.worker, "replacing held worker; killing it");
            self.drop_worker(previous.worker, JobError::WorkerDied);
        }

        let Some(handle) = self.workers.get_mut(&worker) else {
            return Err(SchedulerError::UnknownWorker(worker));
        };
        handle.unbind();
        handle.park();
        let protocol = handle.protocol().to_string();
        if let Some(pool) = self.pools.get_mut(&protocol) {
            pool.remove_worker(worker);
        }

        tracing::info!(worker = %worker, job = %id, %locator, "worker put on hold");
        self.resolve(id, Ok(()));
        self.held = Some(HeldWorker { worker, locator });
        self.dirty = true;
        Ok(())
    }

    fn publish_hold(&mut self) {
        let Some(held) = self.held.take() else {
            return;
        };
        let Some(mut handle) = self.workers.remove(&held.worker) else {
            return;
        };
        if let Err(err) = handle.send(&Request::WorkerHold(held.locator.clone())) {
            tracing::error!(worker = %held.worker, error = %err, "cannot encode hold command");
        }
        tracing::info!(worker = %held.worker, locator = %held.locator, "held worker published");
        handle.release();
    }

    fn remove_hold(&mut self) {
        if let Some(held) = self.held.take() {
            tracing::debug!(worker = %held.worker, "removing held worker");
            self.drop_worker(held.worker, JobError::WorkerDied);
        }
    }

    // ------------------------------------------------------------------
    // Connected workers
    // ------------------------------------------------------------------

    async fn get_connected(&mut self, locator: Locator, config: MetaData) -> SchedulerResult<ConnectedWorker> {
        let protocol = locator.scheme.clone();
        let key = WorkerKey::for_locator(&locator);
        let idle = {
            let workers = &self.workers;
            self.pools
                .get(&protocol)
                .and_then(|pool| pool.find_idle(&key, |w| workers.get(&w).and_then(WorkerHandle::key)))
                .map(|(worker, _)| worker)
        };
        let worker = match idle {
            Some(worker) => {
                if let Some(pool) = self.pools.get_mut(&protocol) {
                    pool.remove_worker(worker);
                }
                worker
            }
            None => self.spawn_worker(&protocol, &locator.host).await?,
        };

        let mut merged = self.options.config_for(&protocol);
        merged.extend(config);
        let handle = self
            .workers
            .get_mut(&worker)
            .ok_or(SchedulerError::UnknownWorker(worker))?;
        handle.reset_target();
        handle.set_target(host_for(&locator), &merged)?;
        handle.send(&Request::Connect)?;
        let pid = handle.pid();

        let (tx, rx) = mpsc::unbounded_channel();
        self.connected.insert(
            worker,
            ConnectedSlot {
                events: tx,
                queue: VecDeque::new(),
                connected: false,
            },
        );
        self.rearm_eviction();
        tracing::debug!(worker = %worker, %locator, "connected worker reserved");
        Ok(ConnectedWorker {
            id: worker,
            pid,
            events: rx,
        })
    }

    fn assign_job(
        &mut self,
        worker: WorkerId,
        id: JobId,
        job: Job,
        events: mpsc::UnboundedSender<JobEvent>,
    ) -> SchedulerResult<()> {
        let handle = self
            .workers
            .get(&worker)
            .filter(|_| self.connected.contains_key(&worker))
            .ok_or(SchedulerError::UnknownWorker(worker))?;
        if !handle.matches_protocol(job.protocol()) {
            return Err(SchedulerError::ProtocolMismatch {
                worker,
                expected: handle.protocol().to_string(),
                actual: job.protocol().to_string(),
            });
        }

        self.jobs.insert(
            id,
            JobEntry {
                job,
                events,
                state: JobState::Queued,
                worker: None,
            },
        );
        if let Some(slot) = self.connected.get_mut(&worker) {
            slot.queue.push_back(id);
        }
        self.start_next_connected(worker);
        Ok(())
    }

    fn start_next_connected(&mut self, worker: WorkerId) {
        let busy = self.workers.get(&worker).map_or(true, |h| h.job().is_some());
        let Some(slot) = self.connected.get_mut(&worker) else {
            return;
        };
        if !slot.connected || busy {
            return;
        }
        if let Some(id) = slot.queue.pop_front() {
            self.start_job(worker, id, false);
        }
    }

    fn disconnect(&mut self, worker: WorkerId) -> SchedulerResult<()> {
        let slot = self
            .connected
            .remove(&worker)
            .ok_or(SchedulerError::UnknownWorker(worker))?;
        for id in slot.queue {
            self.resolve(id, Err(JobError::Cancelled));
        }

        if let Some(id) = self.workers.get(&worker).and_then(WorkerHandle::job) {
            self.resolve(id, Err(JobError::Cancelled));
            self.drop_worker(worker, JobError::Cancelled);
            return Ok(());
        }

        let Some(handle) = self.workers.get_mut(&worker) else {
            return Ok(());
        };
        handle.send(&Request::Disconnect)?;
        handle.mark_idle();
        let protocol = handle.protocol().to_string();
        self.pool_mut(&protocol).add_idle(worker);
        self.dirty = true;
        self.rearm_eviction();
        tracing::debug!(worker = %worker, "connected worker returned to its pool");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    fn reparse(&mut self, protocol: Option<&str>) {
        for handle in self.workers.values_mut() {
            if protocol.map_or(true, |p| handle.protocol() == p) {
                if let Err(err) = handle.send(&Request::ReparseConfiguration) {
                    tracing::error!(worker = %handle.id(), error = %err, "cannot encode reparse command");
                }
                handle.reset_target();
            }
        }
    }

    fn evict_idle(&mut self) {
        let timeout = self.options.idle_timeout;
        let expired: Vec<WorkerId> = self
            .pools
            .values()
            .flat_map(|pool| pool.idle().iter().copied())
            .filter(|w| self.workers.get(w).is_some_and(|h| h.idle_for() >= timeout))
            .collect();
        for worker in expired {
            tracing::debug!(worker = %worker, "evicting idle worker");
            self.drop_worker(worker, JobError::WorkerDied);
        }
        self.rearm_eviction();
    }

    /// One timer, at the earliest idle deadline.
    fn rearm_eviction(&mut self) {
        let timeout = self.options.idle_timeout;
        self.eviction_deadline = self
            .pools
            .values()
            .flat_map(|pool| pool.idle().iter())
            .filter_map(|w| self.workers.get(w))
            .map(|h| Instant::from_std(h.idle_since() + timeout))
            .min();
    }

    fn snapshot(&self) -> SchedulerSnapshot {
        let summarize = |ids: &[WorkerId]| -> Vec<WorkerSummary> {
            ids.iter()
                .filter_map(|w| self.workers.get(w))
                .map(WorkerSummary::of)
                .collect()
        };

        let pools = self
            .pools
            .iter()
            .map(|(name, pool)| {
                let snapshot = PoolSnapshot {
                    cap: pool.cap(),
                    queued: pool.queued().collect(),
                    active: summarize(pool.active()),
                    idle: summarize(pool.idle()),
                };
                (name.clone(), snapshot)
            })
            .collect();

        let held = self.held.as_ref().and_then(|held| {
            self.workers.get(&held.worker).map(|handle| HeldSnapshot {
                worker: WorkerSummary::of(handle),
                locator: held.locator.clone(),
            })
        });

        let mut connected: Vec<WorkerSummary> = self
            .connected
            .keys()
            .filter_map(|w| self.workers.get(w))
            .map(WorkerSummary::of)
            .collect();
        connected.sort_by_key(|summary| summary.id);

        SchedulerSnapshot {
            pools,
            held,
            connected,
            workers: self.workers.len(),
        }
    }

    fn teardown(&mut self) {
        let jobs: Vec<JobId> = self.jobs.keys().copied().collect();
        for id in jobs {
            self.resolve(id, Err(JobError::Cancelled));
        }
        let workers: Vec<WorkerId> = self.workers.keys().copied().collect();
        for worker in workers {
            self.drop_worker(worker, JobError::Cancelled);
        }
        self.held = None;
        self.eviction_deadline = None;
    }
}
