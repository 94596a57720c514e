//! Client-side worker management.
//!
//! The [`Scheduler`] turns submitted [`Job`]s into commands on worker
//! processes. Workers are pooled per protocol under a cap; idle workers are
//! reused (an exact `(protocol, host, port, user)` match first, any worker of
//! the protocol otherwise) and killed after a period of inactivity.
//!
//! # Architecture
//!
//! ```text
//!  Scheduler (clone) ──Command──▶ ┌──────────── scheduler loop ────────────┐
//!                                 │ pools: queue / active / idle per proto │
//!  JobHandle ◀──JobEvent───────── │ held worker, connected workers         │
//!                                 └───────▲───────────────────┬────────────┘
//!                                         │ WorkerEvent       │ Frame
//!                                  reader task           writer task
//!                                         └──── worker ◀──────┘
//! ```
//!
//! New workers come from a [`Launcher`]: [`ProcessLauncher`] runs the worker
//! binaries named in the configuration, [`InProcessLauncher`] runs protocol
//! implementations as tasks.

pub mod error;
pub mod handle;
pub mod job;
pub mod launcher;
pub mod pool;
#[allow(clippy::module_inception)]
mod scheduler;

pub use error::{JobError, LaunchError, SchedulerError, SchedulerResult};
pub use handle::{WorkerEvent, WorkerHandle, WorkerId, WorkerKey, WorkerState};
pub use job::{Job, JobEvent, JobHandle, JobId, JobOutput, JobState};
pub use launcher::{InProcessLauncher, Launcher, ProcessLauncher, Spawned, ADDRESS_PREFIX};
pub use pool::ProtocolPool;
pub use scheduler::{
    ConnectedEvent, ConnectedWorker, HeldSnapshot, PoolSnapshot, Scheduler, SchedulerOptions,
    SchedulerSnapshot, WorkerSummary,
};
