//! Protocol implementations shipped with the crate.

pub mod file;

pub use file::FileWorker;
