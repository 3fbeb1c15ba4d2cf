//! Status Evaluator: derives a single reportable [`RunStatus`] from a run's
//! on-disk documents, in the fixed precedence order the Python reference
//! implementation's `status.py::compute_status` establishes.

use crate::beacon;
use crate::model::{RunControl, RunEnded, RunFinal, RunMeta, RunStatus};

/// All inputs the evaluator needs for one run. Each is `None` when the
/// corresponding file is absent.
pub struct StatusInputs<'a> {
    pub meta: &'a RunMeta,
    pub control: Option<&'a RunControl>,
    pub ended: Option<&'a RunEnded>,
    pub final_doc: Option<&'a RunFinal>,
    pub last_heartbeat: Option<i64>,
    pub heartbeat_interval_sec: u64,
    pub heartbeat_grace_sec: u64,
    pub now: i64,
}

/// Compute the reportable status for a run. Precedence (first match wins),
/// following the Status Evaluator's four-rule table:
/// 1. `ended.json` present: `completed_success` if `final.json` also
///    exists; `ended_expired` if the ended reason is `"expired"`;
///    `stopped_manual` if a stop was requested; else `error_unknown`.
/// 2. Scheduler state known (`meta.job_state` set): `PENDING` reports
///    `pending`; `RUNNING` is `unresponsive` if the beacon is stale, else
///    `running_degraded` if paused, else `healthy_running`; any terminal
///    scheduler state reports `restarting` (the supervisor hasn't
///    processed the completion yet).
/// 3. No `job_id` on the run at all: `stopped_manual` if paused, else
///    `pending`.
/// 4. Otherwise (a job id exists but its scheduler state is unknown or
///    transitional, e.g. `SUSPENDED`): `unresponsive` if the beacon is
///    stale; `running_degraded` if paused; else `restarting`.
#[must_use]
pub fn compute_status(inputs: &StatusInputs<'_>) -> RunStatus {
    if let Some(ended) = inputs.ended {
        return if inputs.final_doc.is_some() {
            RunStatus::CompletedSuccess
        } else if ended.reason == "expired" {
            RunStatus::EndedExpired
        } else if inputs.control.is_some_and(|c| c.stop_requested) {
            RunStatus::StoppedManual
        } else {
            RunStatus::ErrorUnknown
        };
    }

    let paused = inputs.control.is_some_and(|c| c.paused);
    let stale = beacon::is_stale(inputs.last_heartbeat, inputs.heartbeat_interval_sec, inputs.heartbeat_grace_sec, inputs.now);

    if let Some(state) = inputs.meta.job_state.as_deref() {
        match state {
            "pending" => return RunStatus::Pending,
            "running" => {
                return if stale {
                    RunStatus::Unresponsive
                } else if paused {
                    RunStatus::RunningDegraded
                } else {
                    RunStatus::HealthyRunning
                };
            }
            s if is_terminal_job_state(s) => return RunStatus::Restarting,
            _ => {}
        }
    }

    if inputs.meta.job_id.is_none() {
        return if paused { RunStatus::StoppedManual } else { RunStatus::Pending };
    }

    if stale {
        RunStatus::Unresponsive
    } else if paused {
        RunStatus::RunningDegraded
    } else {
        RunStatus::Restarting
    }
}

/// Matches the lowercase state tags `supervisor::run_step::state_tag`
/// stamps onto `meta.job_state` for scheduler states it considers final.
fn is_terminal_job_state(state: &str) -> bool {
    matches!(
        state,
        "completed" | "failed" | "cancelled" | "timeout" | "node_fail" | "out_of_memory" | "preempted" | "boot_fail" | "deadline"
    )
}
