//! TOML-based configuration for ioworker.
//!
//! Supports a config file (ioworker.toml) with environment variable expansion.
//!
//! Example configuration:
//! ```toml
//! [scheduler]
//! idle_timeout_secs = 180
//! max_workers = 3
//!
//! [launcher]
//! transport = "local"
//! worker_dir = "${HOME}/.local/libexec/ioworker"
//! spawn_timeout_secs = 10
//!
//! [protocols.file]
//! max_workers = 5
//!
//! [protocols.sftp]
//! command = "/usr/libexec/ioworker-sftp"
//! args = ["--verbose"]
//!
//! [protocols.sftp.metadata]
//! ConnectTimeout = "30"
//!
//! [worker]
//! list_batch_initial = 100
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::connection::TransportKind;
use crate::protocol::MetaData;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "IOWORKER_CONFIG";

/// Error type for settings.
#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("Config file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    /// Pooling and matching.
    pub scheduler: SchedulerSettings,

    /// How worker processes are started.
    pub launcher: LauncherSettings,

    /// Per-protocol overrides, keyed by scheme.
    pub protocols: BTreeMap<String, ProtocolSettings>,

    /// Worker-side tuning.
    pub worker: WorkerSettings,
}

/// Scheduler configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// Idle workers are killed after this long.
    pub idle_timeout_secs: u64,

    /// Default concurrency cap per protocol.
    pub max_workers: usize,

    /// Bound on connecting to a freshly spawned worker.
    pub connect_timeout_secs: u64,

    /// Queued jobs scanned for an exact idle match.
    pub lookahead: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 180,
            max_workers: 3,
            connect_timeout_secs: 10,
            lookahead: 10,
        }
    }
}

/// Launcher configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LauncherSettings {
    /// Transport workers listen on.
    pub transport: TransportKind,

    /// Directory searched for `ioworker-<protocol>` binaries.
    pub worker_dir: Option<String>,

    /// Directory for local socket files.
    pub socket_dir: Option<String>,

    /// Bound on a worker announcing its address.
    pub spawn_timeout_secs: u64,
}

impl Default for LauncherSettings {
    fn default() -> Self {
        Self {
            transport: TransportKind::Local,
            worker_dir: None,
            socket_dir: None,
            spawn_timeout_secs: 10,
        }
    }
}

/// Per-protocol configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ProtocolSettings {
    /// Overrides the scheduler's default cap.
    pub max_workers: Option<usize>,

    /// Worker binary (supports ${ENV_VAR} expansion).
    pub command: Option<String>,

    /// Extra arguments for the worker binary.
    pub args: Vec<String>,

    /// Sent to every worker of this protocol with the Config command.
    pub metadata: MetaData,
}

/// Worker-side configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Listing batch threshold at the start of each operation.
    pub list_batch_initial: usize,

    /// A listing flush slower than this shrinks the batch.
    pub list_flush_slow_ms: u64,

    /// Filling a batch faster than this grows it.
    pub list_flush_fast_ms: u64,

    /// Minimum interval between processed-size reports.
    pub processed_size_interval_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            list_batch_initial: 100,
            list_flush_slow_ms: 300,
            list_flush_fast_ms: 100,
            processed_size_interval_ms: 100,
        }
    }
}

impl SchedulerSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl LauncherSettings {
    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_secs(self.spawn_timeout_secs)
    }

    /// Socket directory with environment variables expanded.
    pub fn resolved_socket_dir(&self) -> Result<Option<PathBuf>, SettingsError> {
        self.socket_dir
            .as_deref()
            .map(|dir| expand_env_vars(dir).map(PathBuf::from))
            .transpose()
    }
}

impl Settings {
    /// Load settings from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SettingsError::FileNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path)?;
        let settings: Settings = toml::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from the default config file locations.
    ///
    /// Searches in order:
    /// 1. Environment variable `IOWORKER_CONFIG`
    /// 2. `./ioworker.toml`
    /// 3. `~/.config/ioworker/config.toml`
    pub fn load() -> Result<Self, SettingsError> {
        if let Ok(path) = env::var(CONFIG_ENV) {
            return Self::from_file(&path);
        }

        let local_config = PathBuf::from("ioworker.toml");
        if local_config.exists() {
            return Self::from_file(&local_config);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("ioworker").join("config.toml");
            if user_config.exists() {
                return Self::from_file(&user_config);
            }
        }

        Ok(Settings::default())
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if self.scheduler.max_workers == 0 {
            return Err(SettingsError::InvalidConfig(
                "scheduler.max_workers must be at least 1".to_string(),
            ));
        }
        if let Some((name, _)) = self
            .protocols
            .iter()
            .find(|(_, p)| p.max_workers == Some(0))
        {
            return Err(SettingsError::InvalidConfig(format!(
                "protocols.{name}.max_workers must be at least 1"
            )));
        }
        if self.worker.list_batch_initial == 0 {
            return Err(SettingsError::InvalidConfig(
                "worker.list_batch_initial must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Concurrency cap for a protocol.
    pub fn max_workers(&self, protocol: &str) -> usize {
        self.protocols
            .get(protocol)
            .and_then(|p| p.max_workers)
            .unwrap_or(self.scheduler.max_workers)
    }

    /// Config metadata sent to workers of a protocol.
    pub fn protocol_metadata(&self, protocol: &str) -> MetaData {
        self.protocols
            .get(protocol)
            .map(|p| p.metadata.clone())
            .unwrap_or_default()
    }

    /// Resolve the worker binary and its extra arguments for a protocol.
    ///
    /// Searches in order: the configured command, `ioworker-<protocol>` in the
    /// worker directory, next to the running executable, then on `PATH`.
    pub fn worker_command(&self, protocol: &str) -> Result<(PathBuf, Vec<String>), SettingsError> {
        let entry = self.protocols.get(protocol);
        let args = entry.map(|p| p.args.clone()).unwrap_or_default();

        if let Some(command) = entry.and_then(|p| p.command.as_deref()) {
            return Ok((PathBuf::from(expand_env_vars(command)?), args));
        }

        let binary = format!("ioworker-{protocol}");

        if let Some(dir) = &self.launcher.worker_dir {
            let candidate = PathBuf::from(expand_env_vars(dir)?).join(&binary);
            if candidate.exists() {
                return Ok((candidate, args));
            }
        }

        if let Some(dir) = env::current_exe().ok().as_deref().and_then(Path::parent) {
            let candidate = dir.join(&binary);
            if candidate.exists() {
                return Ok((candidate, args));
            }
        }

        Ok((PathBuf::from(binary), args))
    }
}

/// Expand environment variables in a string.
///
/// Supports `${VAR}` and `$VAR` syntax.
pub fn expand_env_vars(s: &str) -> Result<String, SettingsError> {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            result.push(c);
            continue;
        }

        let var_name: String = if chars.next_if_eq(&'{').is_some() {
            let mut name = String::new();
            for ch in chars.by_ref() {
                if ch == '}' {
                    break;
                }
                name.push(ch);
            }
            name
        } else {
            // $VAR ends at the first non-alphanumeric/underscore
            let mut name = String::new();
            while let Some(ch) = chars.next_if(|ch| ch.is_alphanumeric() || *ch == '_') {
                name.push(ch);
            }
            if name.is_empty() {
                // Just a lone $, keep it
                result.push('$');
                continue;
            }
            name
        };

        let value =
            env::var(&var_name).map_err(|_| SettingsError::MissingEnvVar(var_name.clone()))?;
        result.push_str(&value);
    }

    Ok(result)
}
