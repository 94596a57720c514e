//! # ioworker
//!
//! Out-of-process protocol workers: a framed channel, a worker runtime and a
//! scheduler that pools workers per protocol.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                 Caller (CLI, embedder)                   │
//! │            Job ──▶ Scheduler ──▶ JobHandle               │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [scheduler]
//! ┌─────────────────────────────────────────────────────────┐
//! │   Per-protocol pools, held worker, connected workers     │
//! │   WorkerHandle per process (reader + writer tasks)       │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [connection]  LLLLLL_CC_ frames
//! ┌─────────────────────────────────────────────────────────┐
//! │   Worker process: WorkerRuntime ──▶ impl WorkerProtocol  │
//! │   (workers::file, or anything registered)                │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod connection;
pub mod protocol;
pub mod scheduler;
pub mod worker;
pub mod workers;

/// Re-exports for convenient usage.
pub mod prelude {
    pub use crate::config::Settings;
    pub use crate::connection::{Address, ChannelBackend, Connection, Frame, TransportKind};
    pub use crate::protocol::{Entry, EntryKind, ErrorCode, Locator, MetaData, Reply, Request};
    pub use crate::scheduler::{
        InProcessLauncher, Job, JobError, JobEvent, JobHandle, JobOutput, ProcessLauncher,
        Scheduler, SchedulerOptions,
    };
    pub use crate::worker::{WorkerContext, WorkerProtocol, WorkerRuntime};
}

// Also export at crate root for convenience
pub use protocol::Locator;
pub use scheduler::{Job, Scheduler};
