//! Worker-side error types.

use std::io;
use thiserror::Error;

use crate::connection::ConnectionError;
use crate::protocol::MessageError;

/// Result type for worker operations.
pub type WorkerResult<T> = Result<T, WorkerError>;

/// Errors that end an operation or the worker's dispatch loop.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Channel failure while sending or receiving.
    #[error("channel error: {0}")]
    Channel(#[from] ConnectionError),

    /// A frame could not be decoded or a payload encoded.
    #[error("message error: {0}")]
    Message(#[from] MessageError),

    /// The client went away while the worker was waiting for an answer.
    #[error("connection to the client was lost")]
    ConnectionLost,

    /// Detached from the client with no pool endpoint to return to.
    #[error("worker detached with no pool endpoint")]
    Detached,

    /// SIGTERM or SIGINT was received.
    #[error("stop requested")]
    StopRequested,

    /// Local I/O failure inside a protocol implementation.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl WorkerError {
    /// Errors after which the dispatch loop cannot continue on the current
    /// channel.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::ConnectionLost | Self::Detached | Self::StopRequested => true,
            Self::Channel(err) => err.is_disconnect(),
            _ => false,
        }
    }
}
