//! Configuration system: TOML file + env var overrides + smart defaults.

#![allow(missing_docs)]

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::errors::{Result, ShepherdError};

/// Full Shepherd configuration model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Root directory holding `runs/`, `blacklist.json`, `locks/`, `daemon.pid`.
    pub state_dir: PathBuf,
    pub policy: PolicyConfig,
    pub scheduler: SchedulerConfig,
    /// Command used to invoke the wrapper from inside a wrapped submission
    /// script; overridable for environments where `shepherd-wrapper` is not
    /// on `PATH`.
    pub wrapper_bin: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            policy: PolicyConfig::default(),
            scheduler: SchedulerConfig::default(),
            wrapper_bin: "shepherd-wrapper".to_string(),
        }
    }
}

/// Restart/backoff/quarantine/heartbeat policy knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PolicyConfig {
    pub poll_interval_sec: u64,
    pub backoff_base_sec: u64,
    pub backoff_max_sec: u64,
    pub max_retries: u32,
    pub heartbeat_interval_sec: u64,
    pub heartbeat_grace_sec: u64,
    pub blacklist_ttl_sec: u64,
    pub blacklist_limit: usize,
    pub keep_alive_sec: u64,
    pub progress_stall_sec: u64,
    /// Consecutive submit failures on one partition before falling back to
    /// the next ranked partition.
    pub retry_per_partition: u32,
    /// Seconds of continuous fallback before probing the preferred
    /// (index 0) partition again.
    pub reset_to_preferred_sec: u64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            poll_interval_sec: 15,
            backoff_base_sec: 10,
            backoff_max_sec: 300,
            max_retries: 10,
            heartbeat_interval_sec: 30,
            heartbeat_grace_sec: 90,
            blacklist_ttl_sec: 6 * 60 * 60,
            blacklist_limit: 16,
            keep_alive_sec: 0,
            progress_stall_sec: 0,
            retry_per_partition: 3,
            reset_to_preferred_sec: 3_600,
        }
    }
}

/// Scheduler adapter knobs (CLI timeouts, binary names).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub squeue_bin: String,
    pub sbatch_bin: String,
    pub scancel_bin: String,
    pub sacct_bin: String,
    pub command_timeout_sec: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            squeue_bin: "squeue".to_string(),
            sbatch_bin: "sbatch".to_string(),
            scancel_bin: "scancel".to_string(),
            sacct_bin: "sacct".to_string(),
            command_timeout_sec: 10,
        }
    }
}

fn default_state_dir() -> PathBuf {
    env::var_os("HOME").map_or_else(
        || {
            eprintln!(
                "[SHEP-CONFIG] WARNING: HOME not set, falling back to /var/lib/shepherd for state"
            );
            PathBuf::from("/var/lib/shepherd")
        },
        |home| PathBuf::from(home).join(".slurm_shepherd"),
    )
}

/// Allow-list of `meta.json` `config_overrides` keys a submission script may set.
/// Anything outside this list is ignored, matching the scheduler directive contract.
pub const ALLOWED_OVERRIDES: &[&str] = &[
    "heartbeat_interval_sec",
    "heartbeat_grace_sec",
    "max_retries",
    "backoff_base_sec",
    "backoff_max_sec",
    "blacklist_ttl_sec",
    "blacklist_limit",
    "keep_alive_sec",
    "sbatch_args",
    "sbatch_script",
    "progress_stall_sec",
];

impl Config {
    /// Default configuration file path, colocated with the default state dir's parent.
    #[must_use]
    pub fn default_path() -> PathBuf {
        default_state_dir().join("shepherd.toml")
    }

    /// Load config from an explicit path, `SHEPHERD_CONFIG`, or the default path.
    ///
    /// A missing file at the default path is not an error: defaults apply. A
    /// missing file at an explicitly-named path (flag or env var) is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_config = if path.is_none() {
            env::var_os("SHEPHERD_CONFIG").map(PathBuf::from)
        } else {
            None
        };

        let path_buf = path.map_or_else(
            || env_config.clone().unwrap_or_else(Self::default_path),
            Path::to_path_buf,
        );
        let is_explicit = path.is_some() || env_config.is_some();

        let mut cfg = if path_buf.exists() {
            let raw = fs::read_to_string(&path_buf)
                .map_err(|source| ShepherdError::io(&path_buf, source))?;
            toml::from_str(&raw)?
        } else if is_explicit {
            return Err(ShepherdError::MissingConfig { path: path_buf });
        } else {
            Self::default()
        };

        cfg.apply_env_overrides();
        Ok(cfg)
    }

    /// `SHEPHERD_STATE_DIR` takes precedence over a config-file `state_dir`,
    /// matching the CLI-flag > env var > config-file > default precedence chain.
    fn apply_env_overrides(&mut self) {
        if let Some(dir) = env_nonempty("SHEPHERD_STATE_DIR") {
            self.state_dir = PathBuf::from(dir);
        }
    }
}

fn env_nonempty(name: &str) -> Option<String> {
    env::var(name).ok().filter(|raw| !raw.trim().is_empty())
}
