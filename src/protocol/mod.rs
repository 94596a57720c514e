//! Wire vocabulary shared by clients and workers.
//!
//! - [`codes`] - numeric frame codes, partitioned into Command/Info/Result
//! - [`error_code`] - error numbers carried by `Error` results
//! - [`locator`] - job targets
//! - [`messages`] - typed payloads for every frame

pub mod codes;
pub mod error_code;
pub mod locator;
pub mod messages;

pub use codes::{CodeClass, CommandCode, InfoCode, ResultCode};
pub use error_code::ErrorCode;
pub use locator::{Locator, LocatorError};
pub use messages::{
    AuthInfo, ChmodArgs, ChownArgs, CopyArgs, DelArgs, Entry, EntryKind, HostArgs,
    MessageBoxButton, MessageBoxKind, MessageBoxRequest, MessageError, MetaData, MkdirArgs,
    MtimeArgs, MultiGetItem, PutArgs, RenameArgs, Reply, Request, SymlinkArgs,
    WorkerStatusReport,
};
