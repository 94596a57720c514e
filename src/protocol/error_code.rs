//! Numeric error codes carried by `Error` result frames.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error code reported by a worker or synthesized by the scheduler.
///
/// Unknown numbers are preserved in [`ErrorCode::Other`] so that a worker built
/// against a newer table still round-trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    CannotOpenForReading,
    CannotOpenForWriting,
    CannotLaunchProcess,
    Internal,
    MalformedUrl,
    UnsupportedProtocol,
    UnsupportedAction,
    IsDirectory,
    IsFile,
    DoesNotExist,
    FileAlreadyExist,
    DirAlreadyExist,
    UnknownHost,
    AccessDenied,
    WriteAccessDenied,
    CannotEnterDirectory,
    UserCanceled,
    CouldNotConnect,
    ConnectionBroken,
    CouldNotRead,
    CouldNotWrite,
    CouldNotLogin,
    CouldNotStat,
    CouldNotMkdir,
    CouldNotRmdir,
    CannotResume,
    CannotRename,
    CannotChmod,
    CannotDelete,
    WorkerDied,
    ServerTimeout,
    Unknown,
    Other(u32),
}

impl ErrorCode {
    /// Wire value.
    pub fn as_u32(self) -> u32 {
        match self {
            ErrorCode::CannotOpenForReading => 1,
            ErrorCode::CannotOpenForWriting => 2,
            ErrorCode::CannotLaunchProcess => 3,
            ErrorCode::Internal => 4,
            ErrorCode::MalformedUrl => 5,
            ErrorCode::UnsupportedProtocol => 6,
            ErrorCode::UnsupportedAction => 8,
            ErrorCode::IsDirectory => 9,
            ErrorCode::IsFile => 10,
            ErrorCode::DoesNotExist => 11,
            ErrorCode::FileAlreadyExist => 12,
            ErrorCode::DirAlreadyExist => 13,
            ErrorCode::UnknownHost => 14,
            ErrorCode::AccessDenied => 15,
            ErrorCode::WriteAccessDenied => 16,
            ErrorCode::CannotEnterDirectory => 17,
            ErrorCode::UserCanceled => 20,
            ErrorCode::CouldNotConnect => 23,
            ErrorCode::ConnectionBroken => 24,
            ErrorCode::CouldNotRead => 28,
            ErrorCode::CouldNotWrite => 29,
            ErrorCode::CouldNotLogin => 33,
            ErrorCode::CouldNotStat => 34,
            ErrorCode::CouldNotMkdir => 37,
            ErrorCode::CouldNotRmdir => 38,
            ErrorCode::CannotResume => 39,
            ErrorCode::CannotRename => 40,
            ErrorCode::CannotChmod => 41,
            ErrorCode::CannotDelete => 42,
            ErrorCode::WorkerDied => 43,
            ErrorCode::ServerTimeout => 49,
            ErrorCode::Unknown => 51,
            ErrorCode::Other(n) => n,
        }
    }

    /// Decode a wire value.
    pub fn from_u32(value: u32) -> Self {
        match value {
            1 => ErrorCode::CannotOpenForReading,
            2 => ErrorCode::CannotOpenForWriting,
            3 => ErrorCode::CannotLaunchProcess,
            4 => ErrorCode::Internal,
            5 => ErrorCode::MalformedUrl,
            6 => ErrorCode::UnsupportedProtocol,
            8 => ErrorCode::UnsupportedAction,
            9 => ErrorCode::IsDirectory,
            10 => ErrorCode::IsFile,
            11 => ErrorCode::DoesNotExist,
            12 => ErrorCode::FileAlreadyExist,
            13 => ErrorCode::DirAlreadyExist,
            14 => ErrorCode::UnknownHost,
            15 => ErrorCode::AccessDenied,
            16 => ErrorCode::WriteAccessDenied,
            17 => ErrorCode::CannotEnterDirectory,
            20 => ErrorCode::UserCanceled,
            23 => ErrorCode::CouldNotConnect,
            24 => ErrorCode::ConnectionBroken,
            28 => ErrorCode::CouldNotRead,
            29 => ErrorCode::CouldNotWrite,
            33 => ErrorCode::CouldNotLogin,
            34 => ErrorCode::CouldNotStat,
            37 => ErrorCode::CouldNotMkdir,
            38 => ErrorCode::CouldNotRmdir,
            39 => ErrorCode::CannotResume,
            40 => ErrorCode::CannotRename,
            41 => ErrorCode::CannotChmod,
            42 => ErrorCode::CannotDelete,
            43 => ErrorCode::WorkerDied,
            49 => ErrorCode::ServerTimeout,
            51 => ErrorCode::Unknown,
            n => ErrorCode::Other(n),
        }
    }

    /// Map an I/O error kind onto the closest wire code.
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => ErrorCode::DoesNotExist,
            ErrorKind::PermissionDenied => ErrorCode::AccessDenied,
            ErrorKind::AlreadyExists => ErrorCode::FileAlreadyExist,
            ErrorKind::TimedOut => ErrorCode::ServerTimeout,
            ErrorKind::ConnectionRefused => ErrorCode::CouldNotConnect,
            ErrorKind::ConnectionReset | ErrorKind::BrokenPipe => ErrorCode::ConnectionBroken,
            _ => ErrorCode::Unknown,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Other(n) => write!(f, "error {}", n),
            other => write!(f, "{:?}", other),
        }
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.as_u32())
    }
}

impl<'de> Deserialize<'de> for ErrorCode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u32::deserialize(deserializer).map(ErrorCode::from_u32)
    }
}
