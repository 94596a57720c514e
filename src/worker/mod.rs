//! Worker-side runtime.
//!
//! A worker process connects to (or is connected by) its client, then runs
//! [`WorkerRuntime::run`], which decodes each command frame and calls into a
//! [`WorkerProtocol`] implementation. Protocols talk back through the
//! [`WorkerContext`] they are handed.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────── worker process ─────────────────────────────┐
//! │                                                                         │
//! │  Connection ──frames──▶ WorkerRuntime ──calls──▶ impl WorkerProtocol    │
//! │      ▲                      │                          │                │
//! │      │                      ▼                          ▼                │
//! │      └──────────────── WorkerContext ◀──── finished / error / data ...  │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use ioworker::worker::{WorkerContext, WorkerRuntime};
//!
//! let conn = Connection::connect(&address, timeout).await?;
//! let ctx = WorkerContext::new("file", conn, &settings.worker);
//! WorkerRuntime::new(FileWorker::default(), ctx).run().await?;
//! ```

pub mod batching;
mod context;
mod error;
mod protocol;
mod runtime;
pub mod signals;

pub use batching::{BatchConfig, ListBatcher};
pub use context::{OpState, WorkerContext};
pub use error::{WorkerError, WorkerResult};
pub use protocol::WorkerProtocol;
pub use runtime::WorkerRuntime;
pub use signals::{install_fatal_handlers, install_stop_handlers, StopFlag};
