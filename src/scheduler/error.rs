//! Error types for the scheduler.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::config::SettingsError;
use crate::connection::ConnectionError;
use crate::protocol::{ErrorCode, MessageError};

use super::handle::WorkerId;
use super::job::JobId;

/// Result type for scheduler requests.
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Errors returned by [`Scheduler`](super::Scheduler) requests.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The scheduler loop is no longer running.
    #[error("scheduler is not running")]
    Stopped,

    /// No job with this id is known.
    #[error("unknown job {0}")]
    UnknownJob(JobId),

    /// The job is known but not bound to a worker.
    #[error("{0} is not bound to a worker")]
    NotBound(JobId),

    /// No worker with this id is known.
    #[error("unknown worker {0}")]
    UnknownWorker(WorkerId),

    /// A job was assigned to a worker serving another protocol.
    #[error("{worker} serves '{expected}', job needs '{actual}'")]
    ProtocolMismatch {
        worker: WorkerId,
        expected: String,
        actual: String,
    },

    /// A worker could not be created.
    #[error(transparent)]
    Launch(#[from] LaunchError),

    /// A command for a worker could not be encoded.
    #[error(transparent)]
    Message(#[from] MessageError),
}

/// Errors from starting a worker.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// No worker implementation is known for the protocol.
    #[error("no worker available for protocol '{0}'")]
    UnknownProtocol(String),

    /// The worker command could not be started.
    #[error("failed to start {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// The worker did not announce its address in time.
    #[error("worker for '{protocol}' did not come up within {timeout:?}")]
    Timeout { protocol: String, timeout: Duration },

    /// The worker started but the startup exchange failed.
    #[error("worker handshake failed: {0}")]
    Handshake(String),

    /// The worker's channel could not be opened.
    #[error("cannot reach worker: {0}")]
    Channel(#[from] ConnectionError),

    /// The launcher configuration is unusable.
    #[error("launcher configuration: {0}")]
    Config(#[from] SettingsError),
}

impl LaunchError {
    /// Wire error code reported to the job that needed this worker.
    pub fn code(&self) -> ErrorCode {
        match self {
            LaunchError::UnknownProtocol(_) => ErrorCode::UnsupportedProtocol,
            LaunchError::Channel(_) => ErrorCode::CouldNotConnect,
            _ => ErrorCode::CannotLaunchProcess,
        }
    }
}

/// Terminal outcome of a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// No worker could be started for the job.
    #[error("cannot launch worker: {text}")]
    Launch { code: ErrorCode, text: String },

    /// The worker went away while the job was bound to it.
    #[error("worker died")]
    WorkerDied,

    /// The worker reported an error for the operation.
    #[error("{code}: {text}")]
    Operation { code: ErrorCode, text: String },

    /// The job was cancelled before it completed.
    #[error("job cancelled")]
    Cancelled,

    /// The job could not be delivered to its worker.
    #[error("internal error: {0}")]
    Internal(String),
}

impl JobError {
    pub fn code(&self) -> ErrorCode {
        match self {
            JobError::Launch { code, .. } | JobError::Operation { code, .. } => *code,
            JobError::WorkerDied => ErrorCode::WorkerDied,
            JobError::Cancelled => ErrorCode::UserCanceled,
            JobError::Internal(_) => ErrorCode::Internal,
        }
    }
}

impl From<&LaunchError> for JobError {
    fn from(err: &LaunchError) -> Self {
        JobError::Launch {
            code: err.code(),
            text: err.to_string(),
        }
    }
}
