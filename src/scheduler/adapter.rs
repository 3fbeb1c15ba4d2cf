//! Thin, timeout-bounded wrapper around the `squeue`/`sbatch`/`scancel`
//! command-line tools.

use std::collections::HashMap;
use std::io::Write as _;
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::time::Duration;

use wait_timeout::ChildExt;

use crate::core::config::SchedulerConfig;

/// Scheduler job state, covering the terminal and non-terminal states a
/// SLURM-compatible scheduler reports via `squeue -h -o "%i|%T|%R"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Pending,
    Running,
    Suspended,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    NodeFail,
    OutOfMemory,
    Preempted,
    BootFail,
    Deadline,
    Unknown,
}

impl JobState {
    /// Whether this state means the scheduler has finished with the job —
    /// no future `squeue` line for this job id should be expected.
    #[must_use]
    pub const fn terminated(self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::Failed
                | Self::Cancelled
                | Self::Timeout
                | Self::NodeFail
                | Self::OutOfMemory
                | Self::Preempted
                | Self::BootFail
                | Self::Deadline
        )
    }
}

impl FromStr for JobState {
    type Err = ();

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Ok(match raw.trim() {
            "PENDING" => Self::Pending,
            "RUNNING" => Self::Running,
            "SUSPENDED" => Self::Suspended,
            "COMPLETED" => Self::Completed,
            "FAILED" => Self::Failed,
            "CANCELLED" | "CANCELLED+" => Self::Cancelled,
            "TIMEOUT" => Self::Timeout,
            "NODE_FAIL" => Self::NodeFail,
            "OUT_OF_MEMORY" => Self::OutOfMemory,
            "PREEMPTED" => Self::Preempted,
            "BOOT_FAIL" => Self::BootFail,
            "DEADLINE" => Self::Deadline,
            _ => Self::Unknown,
        })
    }
}

/// One row of `squeue` output.
#[derive(Debug, Clone)]
pub struct SlurmQueueEntry {
    pub job_id: String,
    pub state: JobState,
    pub reason: String,
    pub node: Option<String>,
}

/// Result of a `sbatch` submission attempt.
pub enum SubmitOutcome {
    Submitted { job_id: String },
    Failed(SubmitError),
}

/// Result of `query_completed`: the scheduler's final word on a job that
/// has already dropped out of `squeue`'s live listing.
#[derive(Debug, Clone)]
pub struct CompletedJob {
    pub state: JobState,
    pub exit_code: i32,
    pub node: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SubmitError {
    pub stderr: String,
}

/// Adapter over the three scheduler CLI operations the supervisor needs.
pub struct SlurmAdapter {
    config: SchedulerConfig,
}

impl SlurmAdapter {
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        Self { config }
    }

    /// `squeue -h -o "%i|%T|%R" [-j id1,id2,...]`. Never errors: a hung or
    /// missing binary, a timeout, or unparseable output all yield an empty
    /// result, leaving the caller's existing state untouched this tick.
    #[must_use]
    pub fn list_live(&self, job_ids: Option<&[String]>) -> Vec<SlurmQueueEntry> {
        let mut cmd = Command::new(&self.config.squeue_bin);
        cmd.args(["-h", "-o", "%i|%T|%R"]);
        if let Some(ids) = job_ids {
            if ids.is_empty() {
                return Vec::new();
            }
            cmd.arg("-j").arg(ids.join(","));
        }
        let Some(output) = run_bounded(cmd, self.config.command_timeout_sec) else {
            return Vec::new();
        };
        if !output.status_ok {
            return Vec::new();
        }
        parse_squeue(&output.stdout)
    }

    /// Submit `script_contents` via `sbatch`'s stdin, with `extra_args`
    /// (already-tokenized, e.g. `--partition=...`, `--exclude=...`) appended
    /// to the command line. Never panics; an unreachable binary or a
    /// nonzero exit both surface as [`SubmitOutcome::Failed`].
    pub fn submit(&self, script_contents: &str, extra_args: &[String]) -> SubmitOutcome {
        let mut cmd = Command::new(&self.config.sbatch_bin);
        cmd.args(extra_args);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(err) => return SubmitOutcome::Failed(SubmitError { stderr: err.to_string() }),
        };

        if let Some(mut stdin) = child.stdin.take() {
            if stdin.write_all(script_contents.as_bytes()).is_err() {
                let _ = child.kill();
                let _ = child.wait();
                return SubmitOutcome::Failed(SubmitError {
                    stderr: "failed writing script to sbatch stdin".to_string(),
                });
            }
        }

        let timeout = Duration::from_secs(self.config.command_timeout_sec);
        let status = match child.wait_timeout(timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                return SubmitOutcome::Failed(SubmitError { stderr: "timeout".to_string() });
            }
            Err(err) => return SubmitOutcome::Failed(SubmitError { stderr: err.to_string() }),
        };

        let mut stdout = String::new();
        if let Some(mut out) = child.stdout.take() {
            use std::io::Read as _;
            let _ = out.read_to_string(&mut stdout);
        }
        let mut stderr = String::new();
        if let Some(mut err) = child.stderr.take() {
            use std::io::Read as _;
            let _ = err.read_to_string(&mut stderr);
        }

        if !status.success() {
            return SubmitOutcome::Failed(SubmitError { stderr });
        }
        match parse_sbatch_job_id(&stdout) {
            Some(job_id) => SubmitOutcome::Submitted { job_id },
            None => SubmitOutcome::Failed(SubmitError {
                stderr: format!("could not parse job id from sbatch output: {stdout:?}"),
            }),
        }
    }

    /// `sacct -n -P --format=State,ExitCode,NodeList -j <job_id>`. Used once
    /// a job has dropped out of `squeue`'s live listing, to learn its final
    /// state, exit code, and the node it ran on (for quarantine
    /// attribution). `None` on any tool failure, timeout, or unparseable
    /// output — the caller treats that identically to "still unknown".
    #[must_use]
    pub fn query_completed(&self, job_id: &str) -> Option<CompletedJob> {
        let mut cmd = Command::new(&self.config.sacct_bin);
        cmd.args(["-n", "-P", "--format=State,ExitCode,NodeList", "-j", job_id]);
        let output = run_bounded(cmd, self.config.command_timeout_sec)?;
        if !output.status_ok {
            return None;
        }
        parse_sacct(&output.stdout)
    }

    /// `scancel <job_id>`. Best-effort: failures are not surfaced as errors
    /// since a job that is already gone is an acceptable outcome.
    pub fn cancel(&self, job_id: &str) {
        let mut cmd = Command::new(&self.config.scancel_bin);
        cmd.arg(job_id);
        let _ = run_bounded(cmd, self.config.command_timeout_sec);
    }
}

struct BoundedOutput {
    status_ok: bool,
    stdout: String,
}

fn run_bounded(mut cmd: Command, timeout_sec: u64) -> Option<BoundedOutput> {
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.stdin(Stdio::null());
    let mut child = cmd.spawn().ok()?;
    let status = match child.wait_timeout(Duration::from_secs(timeout_sec)).ok()? {
        Some(status) => status,
        None => {
            let _ = child.kill();
            let _ = child.wait();
            return Some(BoundedOutput { status_ok: false, stdout: String::new() });
        }
    };
    let mut stdout = String::new();
    if let Some(mut out) = child.stdout.take() {
        use std::io::Read as _;
        let _ = out.read_to_string(&mut stdout);
    }
    Some(BoundedOutput { status_ok: status.success(), stdout })
}

fn parse_squeue(stdout: &str) -> Vec<SlurmQueueEntry> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, '|');
            let job_id = parts.next()?.trim();
            if job_id.is_empty() {
                return None;
            }
            let state_raw = parts.next().unwrap_or("").trim();
            let reason = parts.next().unwrap_or("").trim();
            Some(SlurmQueueEntry {
                job_id: job_id.to_string(),
                state: state_raw.parse().unwrap_or(JobState::Unknown),
                reason: reason.to_string(),
                node: None,
            })
        })
        .collect()
}

/// `sacct`'s first output row is the top-level job (step rows like
/// `<id>.batch` follow and are ignored). Exit code is reported as `"N:M"`
/// (exit status : signal); the spec takes `N`.
fn parse_sacct(stdout: &str) -> Option<CompletedJob> {
    let line = stdout.lines().next()?;
    let mut parts = line.splitn(3, '|');
    let state_raw = parts.next()?.trim();
    if state_raw.is_empty() {
        return None;
    }
    let exit_raw = parts.next().unwrap_or("0:0").trim();
    let node_raw = parts.next().unwrap_or("").trim();

    let state = state_raw.parse().unwrap_or(JobState::Unknown);
    let exit_code = exit_raw
        .split(':')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(0);
    let node = match node_raw {
        "" | "None assigned" | "None" => None,
        other => Some(other.to_string()),
    };
    Some(CompletedJob { state, exit_code, node })
}

/// First all-digit token in `sbatch`'s stdout, e.g. `"Submitted batch job
/// 12345"` -> `"12345"`.
fn parse_sbatch_job_id(stdout: &str) -> Option<String> {
    stdout
        .split_whitespace()
        .find(|tok| !tok.is_empty() && tok.chars().all(|c| c.is_ascii_digit()))
        .map(str::to_string)
}

/// Convenience alias matching reader expectations elsewhere in the codebase.
pub type LiveJobMap = HashMap<String, SlurmQueueEntry>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_state_parses_known_strings() {
        assert_eq!("RUNNING".parse::<JobState>(), Ok(JobState::Running));
        assert_eq!("NODE_FAIL".parse::<JobState>(), Ok(JobState::NodeFail));
        assert_eq!("CANCELLED+".parse::<JobState>(), Ok(JobState::Cancelled));
    }

    #[test]
    fn unknown_state_string_is_unknown_not_an_error() {
        assert_eq!("SOME_FUTURE_STATE".parse::<JobState>(), Ok(JobState::Unknown));
    }

    #[test]
    fn terminated_covers_all_terminal_states() {
        for state in [
            JobState::Completed,
            JobState::Failed,
            JobState::Cancelled,
            JobState::Timeout,
            JobState::NodeFail,
            JobState::OutOfMemory,
            JobState::Preempted,
            JobState::BootFail,
            JobState::Deadline,
        ] {
            assert!(state.terminated());
        }
        assert!(!JobState::Running.terminated());
        assert!(!JobState::Pending.terminated());
    }

    #[test]
    fn parse_squeue_splits_pipe_delimited_rows() {
        let stdout = "123|RUNNING|\n456|PENDING|Resources\n";
        let rows = parse_squeue(stdout);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].job_id, "123");
        assert_eq!(rows[0].state, JobState::Running);
        assert_eq!(rows[1].reason, "Resources");
    }

    #[test]
    fn parse_squeue_skips_blank_lines() {
        let rows = parse_squeue("\n123|RUNNING|\n\n");
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn parse_sbatch_job_id_extracts_first_digit_token() {
        assert_eq!(parse_sbatch_job_id("Submitted batch job 12345\n"), Some("12345".to_string()));
    }

    #[test]
    fn parse_sbatch_job_id_none_when_absent() {
        assert_eq!(parse_sbatch_job_id("sbatch: error: invalid option\n"), None);
    }

    #[test]
    fn parse_sacct_reads_state_exit_code_and_node() {
        let job = parse_sacct("COMPLETED|0:0|n1\n123.batch|COMPLETED|0:0|n1\n").unwrap();
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.exit_code, 0);
        assert_eq!(job.node.as_deref(), Some("n1"));
    }

    #[test]
    fn parse_sacct_takes_n_from_colon_separated_exit_code() {
        let job = parse_sacct("FAILED|1:0|n2\n").unwrap();
        assert_eq!(job.exit_code, 1);
    }

    #[test]
    fn parse_sacct_none_assigned_node_is_none() {
        let job = parse_sacct("NODE_FAIL|1:0|None assigned\n").unwrap();
        assert_eq!(job.node, None);
    }

    #[test]
    fn parse_sacct_empty_output_is_none() {
        assert!(parse_sacct("").is_none());
    }
}
