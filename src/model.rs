//! Typed documents for every file in a run directory, plus the quarantine
//! list document. Mirrors the JSON shapes read and written by the Python
//! reference implementation's `fs.py`/`state.py`/`blacklist.py`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Supervisor-owned per-run metadata: `runs/<run_id>/meta.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct RunMeta {
    pub run_id: String,
    pub script_path: String,
    pub sbatch_args: String,
    /// GPU count requested; when set and no `--gres=gpu:*` arg is already
    /// present, the submitter appends `--gres=gpu:N`.
    pub gpus: Option<u32>,
    /// Ranked partitions to submit into; index 0 is preferred.
    pub partitions: Vec<String>,
    pub partition_index: usize,
    pub partition_retry_count: u32,
    /// Currently-selected partition name, stamped once a submit using it succeeds.
    pub current_partition: Option<String>,
    /// Consecutive-failure threshold before `partition_index` advances.
    /// Falls back to the policy default when absent.
    pub retry_per_partition: Option<u32>,
    /// Seconds of continuous fallback before the preferred (index 0)
    /// partition is probed again. Falls back to the policy default when absent.
    pub reset_to_preferred_sec: Option<u64>,
    /// When the supervisor last attempted (or reset back to) the preferred
    /// partition; drives the periodic reset-to-preferred probe.
    pub last_preferred_attempt_at: Option<i64>,
    pub restart_count: u32,
    pub max_retries: u32,
    pub next_submit_at: Option<i64>,
    pub restart_reason: Option<String>,
    pub last_restart_ts: Option<i64>,
    pub job_id: Option<String>,
    /// Last observed scheduler state string for `job_id` (e.g. `"RUNNING"`).
    pub job_state: Option<String>,
    /// Last observed scheduler reason text for `job_id` (e.g. `"Resources"`).
    pub job_reason: Option<String>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub last_submit_at: Option<i64>,
    pub last_failure_ts: Option<i64>,
    /// `"run_once"` or `"indefinite"`, mirrors the wrapper's `--run-mode`.
    pub run_mode: String,
    pub config_overrides: ConfigOverrides,
}

impl RunMeta {
    /// Whether this run restarts until `keep_alive_sec` elapses rather than
    /// completing after a single successful workload exit.
    #[must_use]
    pub fn is_indefinite(&self) -> bool {
        self.run_mode == "indefinite"
    }
}

/// Subset of `PolicyConfig` a submission script may override per-run via
/// `#SHEPHERD` directives, matching [`crate::core::config::ALLOWED_OVERRIDES`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct ConfigOverrides {
    pub heartbeat_interval_sec: Option<u64>,
    pub heartbeat_grace_sec: Option<u64>,
    pub max_retries: Option<u32>,
    pub backoff_base_sec: Option<u64>,
    pub backoff_max_sec: Option<u64>,
    pub blacklist_ttl_sec: Option<u64>,
    pub blacklist_limit: Option<usize>,
    pub keep_alive_sec: Option<u64>,
    pub sbatch_args: Option<String>,
    pub sbatch_script: Option<String>,
    pub progress_stall_sec: Option<u64>,
}

/// Client-owned control surface: `runs/<run_id>/control.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct RunControl {
    pub stop_requested: bool,
    pub restart_requested: bool,
    pub paused: bool,
    /// Client-proposed overrides, checked against
    /// [`crate::core::config::ALLOWED_OVERRIDES`] before being merged onto
    /// `meta.config_overrides`; unrecognized keys are dropped silently.
    pub config_overrides: BTreeMap<String, serde_json::Value>,
    pub updated_at: Option<i64>,
}

/// Wrapper-owned failure report: `runs/<run_id>/failure.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct RunFailure {
    pub ts: i64,
    pub exit_code: i32,
    pub host: String,
    pub reason: String,
    pub detail: Option<serde_json::Value>,
    /// The scheduler's job id for the attempt that failed, propagated from
    /// `SLURM_JOB_ID` when the wrapper was invoked inside a job.
    pub job_id: Option<String>,
}

/// Wrapper-owned success sentinel: `runs/<run_id>/final.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct RunFinal {
    pub ts: i64,
    pub exit_code: i32,
}

/// Supervisor-owned terminal marker: `runs/<run_id>/ended.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct RunEnded {
    pub ts: i64,
    pub reason: String,
}

/// Progress document a workload may optionally maintain, consulted by the
/// progress-stall check (`progress_stall_sec`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct RunProgress {
    pub timestamp: Option<i64>,
    pub updated_at: Option<i64>,
}

impl RunProgress {
    #[must_use]
    pub fn last_update(&self) -> Option<i64> {
        self.timestamp.or(self.updated_at)
    }
}

/// Single node's quarantine record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlacklistEntry {
    pub added_at: i64,
    pub expires_at: Option<i64>,
    pub reason: String,
}

/// `<state>/blacklist.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Blacklist {
    pub nodes: BTreeMap<String, BlacklistEntry>,
    pub updated_at: Option<i64>,
}

/// Closed set of statuses a run can be reported in, per the evaluator's
/// precedence rules. `CrashLoop` is defined for forward compatibility with
/// external callers but the evaluator's current precedence rules never
/// produce it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    HealthyRunning,
    RunningDegraded,
    Unresponsive,
    Pending,
    Restarting,
    CrashLoop,
    CompletedSuccess,
    EndedExpired,
    StoppedManual,
    ErrorUnknown,
}

impl RunStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HealthyRunning => "healthy_running",
            Self::RunningDegraded => "running_degraded",
            Self::Unresponsive => "unresponsive",
            Self::Pending => "pending",
            Self::Restarting => "restarting",
            Self::CrashLoop => "crash_loop",
            Self::CompletedSuccess => "completed_success",
            Self::EndedExpired => "ended_expired",
            Self::StoppedManual => "stopped_manual",
            Self::ErrorUnknown => "error_unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_overrides_defaults_are_all_none() {
        let overrides = ConfigOverrides::default();
        assert!(overrides.max_retries.is_none());
        assert!(overrides.sbatch_args.is_none());
    }

    #[test]
    fn run_status_string_matches_reference_constants() {
        assert_eq!(RunStatus::HealthyRunning.as_str(), "healthy_running");
        assert_eq!(RunStatus::EndedExpired.as_str(), "ended_expired");
        assert_eq!(RunStatus::CrashLoop.as_str(), "crash_loop");
    }

    #[test]
    fn run_progress_prefers_timestamp_field() {
        let progress = RunProgress { timestamp: Some(5), updated_at: Some(9) };
        assert_eq!(progress.last_update(), Some(5));
        let progress = RunProgress { timestamp: None, updated_at: Some(9) };
        assert_eq!(progress.last_update(), Some(9));
    }
}
