//! Configuration module for ioworker.
//!
//! Handles the config file, environment variables, and settings.

mod settings;

pub use settings::{
    expand_env_vars, LauncherSettings, ProtocolSettings, SchedulerSettings, Settings,
    SettingsError, WorkerSettings, CONFIG_ENV,
};
