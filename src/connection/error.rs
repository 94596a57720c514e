//! Channel error types.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Result type for channel operations.
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Errors raised by the framed channel and its backends.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Underlying socket error.
    #[error("channel i/o error: {0}")]
    Io(#[from] io::Error),

    /// Header bytes did not parse as `LLLLLL_CC_`.
    #[error("malformed frame header {0:?}")]
    BadHeader(String),

    /// Payload does not fit in six hex digits.
    #[error("frame payload of {0} bytes exceeds the maximum")]
    PayloadTooLarge(usize),

    /// Address string is neither `local:<path>` nor `tcp:<ip>:<port>`.
    #[error("invalid channel address '{0}'")]
    InvalidAddress(String),

    #[error("timed out connecting to {address} after {timeout:?}")]
    ConnectTimeout { address: String, timeout: Duration },

    #[error("timed out waiting for a peer after {0:?}")]
    AcceptTimeout(Duration),

    /// Operation requires a listening or connected backend.
    #[error("channel is not {0}")]
    InvalidState(&'static str),

    #[error("channel is not connected")]
    NotConnected,

    #[error("channel closed")]
    Closed,
}

impl ConnectionError {
    /// The peer is gone; the channel will not deliver further frames.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Closed | Self::NotConnected => true,
            Self::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
