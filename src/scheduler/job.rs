//! Jobs: what callers submit and what they get back.

use std::fmt;

use tokio::sync::mpsc;

use crate::protocol::{
    AuthInfo, ChmodArgs, ChownArgs, CommandCode, CopyArgs, DelArgs, Entry, HostArgs, Locator,
    MessageBoxButton, MessageBoxRequest, MetaData, MkdirArgs, MtimeArgs, MultiGetItem, PutArgs,
    RenameArgs, Request, SymlinkArgs,
};

use super::error::{JobError, SchedulerResult};
use super::handle::{WorkerId, WorkerKey};
use super::scheduler::Scheduler;

/// Identifier of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub(crate) u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// Lifecycle of a job inside the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Dispatching,
    Bound,
}

/// A unit of work: a target locator and the command to run against it.
#[derive(Debug, Clone)]
pub struct Job {
    locator: Locator,
    request: Request,
    metadata: MetaData,
    hold_on_mime_type: bool,
}

impl Job {
    fn new(locator: Locator, request: Request) -> Self {
        Self {
            locator,
            request,
            metadata: MetaData::new(),
            hold_on_mime_type: false,
        }
    }

    pub fn get(locator: Locator) -> Self {
        Self::new(locator.clone(), Request::Get(locator))
    }

    pub fn put(locator: Locator, permissions: Option<u32>, overwrite: bool, resume: bool) -> Self {
        let args = PutArgs {
            locator: locator.clone(),
            permissions,
            overwrite,
            resume,
        };
        Self::new(locator, Request::Put(args))
    }

    pub fn stat(locator: Locator) -> Self {
        Self::new(locator.clone(), Request::Stat(locator))
    }

    pub fn mime_type(locator: Locator) -> Self {
        Self::new(locator.clone(), Request::MimeType(locator))
    }

    pub fn list_dir(locator: Locator) -> Self {
        Self::new(locator.clone(), Request::ListDir(locator))
    }

    pub fn mkdir(locator: Locator, permissions: Option<u32>) -> Self {
        let args = MkdirArgs {
            locator: locator.clone(),
            permissions,
        };
        Self::new(locator, Request::Mkdir(args))
    }

    pub fn rename(src: Locator, dest: Locator, overwrite: bool) -> Self {
        let args = RenameArgs {
            src: src.clone(),
            dest,
            overwrite,
        };
        Self::new(src, Request::Rename(args))
    }

    /// Create `dest` as a symlink pointing at `target`.
    pub fn symlink(target: impl Into<String>, dest: Locator, overwrite: bool) -> Self {
        let args = SymlinkArgs {
            target: target.into(),
            dest: dest.clone(),
            overwrite,
        };
        Self::new(dest, Request::Symlink(args))
    }

    pub fn copy(src: Locator, dest: Locator, permissions: Option<u32>, overwrite: bool) -> Self {
        let args = CopyArgs {
            src: src.clone(),
            dest,
            permissions,
            overwrite,
        };
        Self::new(src, Request::Copy(args))
    }

    pub fn delete(locator: Locator, is_file: bool) -> Self {
        let args = DelArgs {
            locator: locator.clone(),
            is_file,
        };
        Self::new(locator, Request::Del(args))
    }

    pub fn chmod(locator: Locator, permissions: u32) -> Self {
        let args = ChmodArgs {
            locator: locator.clone(),
            permissions,
        };
        Self::new(locator, Request::Chmod(args))
    }

    pub fn chown(locator: Locator, owner: impl Into<String>, group: impl Into<String>) -> Self {
        let args = ChownArgs {
            locator: locator.clone(),
            owner: owner.into(),
            group: group.into(),
        };
        Self::new(locator, Request::Chown(args))
    }

    pub fn set_modification_time(locator: Locator, mtime: i64) -> Self {
        let args = MtimeArgs {
            locator: locator.clone(),
            mtime,
        };
        Self::new(locator, Request::SetModificationTime(args))
    }

    /// Protocol-defined command; `locator` selects the worker.
    pub fn special(locator: Locator, data: Vec<u8>) -> Self {
        Self::new(locator, Request::Special(data))
    }

    /// Batched fetch served by one worker; `locator` selects the worker.
    pub fn multi_get(locator: Locator, items: Vec<MultiGetItem>) -> Self {
        Self::new(locator, Request::MultiGet(items))
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_metadata_map(mut self, metadata: MetaData) -> Self {
        self.metadata.extend(metadata);
        self
    }

    /// Leave the worker paused after it reports the mime type instead of
    /// telling it to continue.
    pub fn hold_on_mime_type(mut self, hold: bool) -> Self {
        self.hold_on_mime_type = hold;
        self
    }

    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    pub fn protocol(&self) -> &str {
        &self.locator.scheme
    }

    pub fn command(&self) -> CommandCode {
        self.request.code()
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn metadata(&self) -> &MetaData {
        &self.metadata
    }

    pub fn holds_on_mime_type(&self) -> bool {
        self.hold_on_mime_type
    }

    /// Matching key of the worker this job wants.
    pub fn key(&self) -> WorkerKey {
        WorkerKey::for_locator(&self.locator)
    }

    /// Target sent with the `Host` command.
    pub fn host_args(&self) -> HostArgs {
        HostArgs {
            host: self.locator.host.clone(),
            port: self.locator.port,
            user: self.locator.user.clone(),
            pass: self.locator.pass.clone(),
        }
    }

    /// A plain fetch with no resume offset; the only kind a held worker can
    /// serve.
    pub fn is_plain_fetch(&self) -> bool {
        let resuming = self
            .metadata
            .get("resume")
            .and_then(|v| v.parse::<u64>().ok())
            .is_some_and(|offset| offset > 0);
        matches!(self.request, Request::Get(_)) && !resuming
    }
}

/// Progress and results streamed to the submitter of a job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// The job was bound to a worker.
    WorkerAssigned { worker: WorkerId, pid: u32 },
    TotalSize(u64),
    ProcessedSize(u64),
    Speed(u64),
    Position(u64),
    MimeType(String),
    Redirection(Locator),
    Renamed(Locator),
    /// A data chunk; empty marks the end of the stream.
    Data(Vec<u8>),
    /// The worker wants the next chunk; answer with [`JobHandle::send_data`].
    DataRequested,
    /// The worker offers to resume at an offset; a non-zero offset must be
    /// answered with [`JobHandle::answer_resume`].
    ResumeOffered(u64),
    CanResume,
    StatEntry(Entry),
    ListEntries(Vec<Entry>),
    MetaData(MetaData),
    Warning(String),
    InfoMessage(String),
    GettingFile(String),
    ErrorPage,
    NeedPassword(AuthInfo),
    MessageBox(MessageBoxRequest),
    NetworkRequested(String),
    NetworkDropped(String),
    NeedSubUrlData,
    Connected,
    /// Terminal; nothing follows.
    Finished(Result<(), JobError>),
}

/// Everything a job produced, gathered by [`JobHandle::wait`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobOutput {
    pub worker: Option<WorkerId>,
    pub data: Vec<u8>,
    pub entries: Vec<Entry>,
    pub stat: Option<Entry>,
    pub mime_type: Option<String>,
    pub metadata: MetaData,
    pub redirection: Option<Locator>,
    pub total_size: Option<u64>,
    pub warnings: Vec<String>,
}

/// Caller's side of a submitted job.
pub struct JobHandle {
    id: JobId,
    scheduler: Scheduler,
    events: mpsc::UnboundedReceiver<JobEvent>,
}

impl JobHandle {
    pub(crate) fn new(id: JobId, scheduler: Scheduler, events: mpsc::UnboundedReceiver<JobEvent>) -> Self {
        Self {
            id,
            scheduler,
            events,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    /// Next event, `None` after the terminal event.
    pub async fn next_event(&mut self) -> Option<JobEvent> {
        self.events.recv().await
    }

    /// Answer a data request. An empty chunk ends the upload.
    pub fn send_data(&self, bytes: Vec<u8>) -> SchedulerResult<()> {
        self.scheduler.reply(self.id, Request::Data(bytes))
    }

    pub fn answer_resume(&self, accept: bool) -> SchedulerResult<()> {
        let request = if accept {
            Request::ResumeAnswer
        } else {
            Request::None
        };
        self.scheduler.reply(self.id, request)
    }

    pub fn answer_message_box(&self, button: MessageBoxButton) -> SchedulerResult<()> {
        self.scheduler.reply(self.id, Request::MessageBoxAnswer(button))
    }

    /// Supply credentials, or decline with `None`.
    pub fn answer_password(&self, auth: Option<AuthInfo>) -> SchedulerResult<()> {
        let request = auth.map_or(Request::None, Request::UserPass);
        self.scheduler.reply(self.id, request)
    }

    /// Let a worker paused on its mime type report carry on.
    pub fn continue_after_mime_type(&self) -> SchedulerResult<()> {
        self.scheduler.reply(self.id, Request::None)
    }

    pub fn cancel(&self) -> SchedulerResult<()> {
        self.scheduler.cancel(self.id)
    }

    /// Stop reading from the job's worker until [`resume`](Self::resume).
    /// Events already received are still delivered. Does nothing for a job
    /// that is not running on a worker.
    pub fn suspend(&self) -> SchedulerResult<()> {
        self.scheduler.set_flow(self.id, true)
    }

    pub fn resume(&self) -> SchedulerResult<()> {
        self.scheduler.set_flow(self.id, false)
    }

    /// Drive the job to completion without uploading anything.
    pub async fn wait(self) -> Result<JobOutput, JobError> {
        self.drive(Vec::new()).await
    }

    /// Drive the job to completion, answering data requests from `data`.
    pub async fn upload(self, data: Vec<u8>) -> Result<JobOutput, JobError> {
        self.drive(data).await
    }

    async fn drive(mut self, data: Vec<u8>) -> Result<JobOutput, JobError> {
        let mut chunks: std::collections::VecDeque<Vec<u8>> = data
            .chunks(crate::connection::MAX_PAYLOAD)
            .map(<[u8]>::to_vec)
            .collect();
        let mut output = JobOutput::default();

        while let Some(event) = self.events.recv().await {
            match event {
                JobEvent::WorkerAssigned { worker, .. } => output.worker = Some(worker),
                JobEvent::Data(bytes) => output.data.extend_from_slice(&bytes),
                JobEvent::DataRequested => {
                    let chunk = chunks.pop_front().unwrap_or_default();
                    self.send_data(chunk).map_err(|e| JobError::Internal(e.to_string()))?;
                }
                JobEvent::ResumeOffered(offset) if offset > 0 => {
                    self.answer_resume(false)
                        .map_err(|e| JobError::Internal(e.to_string()))?;
                }
                JobEvent::NeedPassword(_) => {
                    self.answer_password(None)
                        .map_err(|e| JobError::Internal(e.to_string()))?;
                }
                JobEvent::MessageBox(_) => {
                    self.answer_message_box(MessageBoxButton::Cancel)
                        .map_err(|e| JobError::Internal(e.to_string()))?;
                }
                JobEvent::StatEntry(entry) => output.stat = Some(entry),
                JobEvent::ListEntries(entries) => output.entries.extend(entries),
                JobEvent::MimeType(mime) => output.mime_type = Some(mime),
                JobEvent::MetaData(map) => output.metadata.extend(map),
                JobEvent::Redirection(locator) => output.redirection = Some(locator),
                JobEvent::TotalSize(size) => output.total_size = Some(size),
                JobEvent::Warning(text) => output.warnings.push(text),
                JobEvent::Finished(result) => return result.map(|()| output),
                _ => {}
            }
        }

        Err(JobError::Internal("scheduler stopped before the job finished".to_string()))
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle").field("id", &self.id).finish()
    }
}
