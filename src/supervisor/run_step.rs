//! Per-run state machine: the body of one `tick` iteration for a single
//! run directory. Mirrors the Python reference implementation's
//! `daemon.py::_handle_run` and its helpers, extended with the ranked
//! partition-fallback policy, script wrapping, and client-side config
//! overrides.

use std::collections::HashMap;

use crate::backoff::compute_backoff;
use crate::beacon;
use crate::blacklist;
use crate::core::config::{PolicyConfig, ALLOWED_OVERRIDES};
use crate::model::{Blacklist, RunControl, RunEnded, RunFailure, RunFinal, RunMeta, RunProgress};
use crate::scheduler::{CompletedJob, JobState, SlurmQueueEntry};
use crate::store::atomic::{append_line, read_json, write_json_atomic};
use crate::supervisor::script_wrap;

use super::Supervisor;

/// Handle one run for one tick. Returns whether the quarantine list was
/// mutated (so the caller knows to persist it).
pub fn handle_run(
    sup: &Supervisor,
    run_id: &str,
    live: &HashMap<String, SlurmQueueEntry>,
    quarantine: &mut Blacklist,
    now: i64,
) -> crate::core::errors::Result<bool> {
    let meta_path = sup.layout.run_file(run_id, "meta.json");
    let Some(mut meta) = read_json::<RunMeta>(&meta_path).present() else {
        return Ok(false);
    };

    let mut control: RunControl =
        read_json(&sup.layout.run_file(run_id, "control.json")).present().unwrap_or_default();
    apply_control_overrides(&mut meta, &control);

    if sup.layout.run_file(run_id, "ended.json").exists() {
        if control.restart_requested {
            revive_run(sup, run_id, &mut meta, &mut control, now);
        } else {
            return Ok(false);
        }
    }

    if keep_alive_expired(sup, &meta, now) {
        expire_run(sup, run_id, &meta, now, "expired");
        return Ok(false);
    }

    if control.stop_requested {
        stop_run(sup, run_id, &meta, now);
        return Ok(false);
    }

    if finalize_if_complete(sup, run_id, now) {
        return Ok(false);
    }

    let mut quarantine_dirty = false;

    if let Some(job_id) = meta.job_id.clone() {
        let scheduler_entry = live.get(&job_id);
        if let Some(entry) = scheduler_entry {
            persist_job_observation(sup, run_id, &mut meta, entry);
        }

        let stale_heartbeat = job_is_running(&meta) && run_heartbeat_stale(sup, run_id, &meta, now);
        let stalled_progress = job_is_running(&meta) && progress_stalled(sup, run_id, &meta, now);

        if stale_heartbeat || stalled_progress || control.restart_requested {
            let reason = if control.restart_requested {
                "manual_restart".to_string()
            } else if stalled_progress {
                "progress_stalled".to_string()
            } else {
                "heartbeat_stale".to_string()
            };
            quarantine_dirty |= quarantine_from_failure(sup, run_id, &mut meta, quarantine, now);
            sup.scheduler.cancel(&job_id);
            clear_restart_requested(sup, run_id, &mut control, now);
            record_restart(sup, run_id, &mut meta, &reason, now);
            return Ok(quarantine_dirty);
        }

        if scheduler_entry.map_or(false, |e| !e.state.terminated()) {
            let _ = write_json_atomic(&meta_path, &meta);
            return Ok(quarantine_dirty);
        }

        // The job has either dropped out of squeue's live listing entirely
        // or squeue itself reports a terminal state; either way consult
        // sacct for the scheduler's final word before deciding what to do.
        let completed = sup.scheduler.query_completed(&job_id);
        quarantine_dirty |= dispatch_completed(sup, run_id, &mut meta, quarantine, completed.as_ref(), now);
        let _ = write_json_atomic(&meta_path, &meta);
        if sup.layout.run_file(run_id, "ended.json").exists() {
            return Ok(quarantine_dirty);
        }
        return Ok(quarantine_dirty);
    }

    if control.paused {
        let _ = write_json_atomic(&meta_path, &meta);
        return Ok(quarantine_dirty);
    }

    // Step 12 of the per-run tick: independent of whichever branch above
    // cleared `job_id` this tick or an earlier one, a `failure.json` left
    // behind by the wrapper's own pre-flight probes (exit 42/43/44) still
    // needs to be attributed to its node before the run is resubmitted.
    quarantine_dirty |= quarantine_from_failure(sup, run_id, &mut meta, quarantine, now);

    if ready_for_submit(&meta, now) {
        submit_run(sup, run_id, &mut meta, quarantine, now);
    } else {
        let _ = write_json_atomic(&meta_path, &meta);
    }

    Ok(quarantine_dirty)
}

/// A just-submitted `PENDING` job has no heartbeat file yet; gating the
/// heartbeat/progress-stall check on `job_state == "running"` keeps a fresh
/// `PENDING` job from being cancelled by `beacon::is_stale`'s `None`-is-stale
/// rule before the wrapper has had a chance to start beating.
fn job_is_running(meta: &RunMeta) -> bool {
    meta.job_state.as_deref() == Some("running")
}

fn persist_job_observation(sup: &Supervisor, run_id: &str, meta: &mut RunMeta, entry: &SlurmQueueEntry) {
    let state = state_tag(entry.state).to_string();
    let reason = entry.reason.clone();
    if meta.job_state.as_deref() != Some(state.as_str()) || meta.job_reason.as_deref() != Some(reason.as_str()) {
        meta.job_state = Some(state);
        meta.job_reason = Some(reason);
        let _ = write_json_atomic(&sup.layout.run_file(run_id, "meta.json"), meta);
    }
}

/// Dispatch on a job that has left `squeue`'s live listing. `completed` is
/// `None` when `sacct` itself is unreachable or unparseable, in which case
/// the job is treated as simply gone (the conservative, restart-eligible
/// default).
fn dispatch_completed(
    sup: &Supervisor,
    run_id: &str,
    meta: &mut RunMeta,
    quarantine: &mut Blacklist,
    completed: Option<&CompletedJob>,
    now: i64,
) -> bool {
    let Some(job_id) = meta.job_id.clone() else { return false };

    let Some(completed) = completed else {
        record_restart(sup, run_id, meta, "job_disappeared", now);
        return false;
    };

    meta.job_state = Some(state_tag(completed.state).to_string());

    match completed.state {
        JobState::Completed if completed.exit_code == 0 && !meta.is_indefinite() => {
            let final_doc = RunFinal { ts: now, exit_code: 0 };
            let _ = write_json_atomic(&sup.layout.run_file(run_id, "final.json"), &final_doc);
            let ended = RunEnded { ts: now, reason: "completed_success".to_string() };
            let _ = write_json_atomic(&sup.layout.run_file(run_id, "ended.json"), &ended);
            sup.event_log.expire(run_id, "completed_success");
            let _ = job_id;
            false
        }
        JobState::Cancelled | JobState::Preempted => {
            // Not counted as a failure: the job was taken away from this run
            // rather than failing on its own, so neither the backoff delay
            // nor the restart counter advances.
            meta.job_id = None;
            meta.job_reason = Some(format!("scheduler_{}", state_tag(completed.state)));
            meta.next_submit_at = Some(now);
            sup.event_log.restart(run_id, &format!("scheduler_{}", state_tag(completed.state)), meta.restart_count, 0);
            false
        }
        JobState::NodeFail | JobState::Timeout => {
            let dirty = if let Some(node) = &completed.node {
                apply_failure_blacklist(sup, run_id, meta, quarantine, node, state_tag(completed.state), now, now)
            } else {
                false
            };
            record_restart(sup, run_id, meta, state_tag(completed.state), now);
            dirty
        }
        other => {
            record_restart(sup, run_id, meta, state_tag(other), now);
            false
        }
    }
}

fn run_heartbeat_stale(sup: &Supervisor, run_id: &str, meta: &RunMeta, now: i64) -> bool {
    let last_beat = beacon::read_heartbeat(&sup.layout.run_file(run_id, "heartbeat"));
    let interval = meta.config_overrides.heartbeat_interval_sec.unwrap_or(sup.config.policy.heartbeat_interval_sec);
    let grace = meta.config_overrides.heartbeat_grace_sec.unwrap_or(sup.config.policy.heartbeat_grace_sec);
    beacon::is_stale(last_beat, interval, grace, now)
}

fn progress_stalled(sup: &Supervisor, run_id: &str, meta: &RunMeta, now: i64) -> bool {
    let stall_sec = meta.config_overrides.progress_stall_sec.unwrap_or(sup.config.policy.progress_stall_sec);
    if stall_sec == 0 {
        return false;
    }
    let Some(progress) = read_json::<RunProgress>(&sup.layout.run_file(run_id, "progress.json")).present() else {
        return false;
    };
    let Some(last) = progress.last_update() else { return false };
    now.saturating_sub(last) > i64::try_from(stall_sec).unwrap_or(i64::MAX)
}

fn state_tag(state: JobState) -> &'static str {
    match state {
        JobState::Completed => "completed",
        JobState::Failed => "failed",
        JobState::Cancelled => "cancelled",
        JobState::Timeout => "timeout",
        JobState::NodeFail => "node_fail",
        JobState::OutOfMemory => "out_of_memory",
        JobState::Preempted => "preempted",
        JobState::BootFail => "boot_fail",
        JobState::Deadline => "deadline",
        JobState::Pending => "pending",
        JobState::Running => "running",
        JobState::Suspended => "suspended",
        JobState::Unknown => "unknown",
    }
}

/// Increment `restart_count`, compute the next backoff, record the reason.
/// `job_id` is cleared so the run is picked up for resubmission once
/// `next_submit_at` elapses. The `max_retries` cap only expires a
/// `run_once` run; an `indefinite` run instead relies on `keep_alive_sec`.
fn record_restart(sup: &Supervisor, run_id: &str, meta: &mut RunMeta, reason: &str, now: i64) {
    meta.restart_count += 1;
    meta.job_id = None;
    meta.restart_reason = Some(reason.to_string());
    meta.last_restart_ts = Some(now);
    let base = meta.config_overrides.backoff_base_sec.unwrap_or(sup.config.policy.backoff_base_sec);
    let max = meta.config_overrides.backoff_max_sec.unwrap_or(sup.config.policy.backoff_max_sec);
    let delay = compute_backoff(meta.restart_count, base, max);
    meta.next_submit_at = Some(now.saturating_add(i64::try_from(delay).unwrap_or(i64::MAX)));
    sup.event_log.restart(run_id, reason, meta.restart_count, delay);
    let _ = write_json_atomic(&sup.layout.run_file(run_id, "meta.json"), meta);

    let max_retries = meta.config_overrides.max_retries.unwrap_or(sup.config.policy.max_retries);
    if !meta.is_indefinite() && meta.restart_count > max_retries {
        expire_run(sup, run_id, meta, now, "expired");
    }
}

fn ready_for_submit(meta: &RunMeta, now: i64) -> bool {
    meta.next_submit_at.map_or(true, |at| now >= at)
}

fn keep_alive_expired(sup: &Supervisor, meta: &RunMeta, now: i64) -> bool {
    if !meta.is_indefinite() {
        return false;
    }
    let keep_alive = meta.config_overrides.keep_alive_sec.unwrap_or(sup.config.policy.keep_alive_sec);
    if keep_alive == 0 {
        return false;
    }
    let Some(started_at) = meta.started_at else { return false };
    now.saturating_sub(started_at) > i64::try_from(keep_alive).unwrap_or(i64::MAX)
}

/// Reset a terminal run (one with `ended.json` present) back to a fresh,
/// submittable state in response to a client's manual restart request.
fn revive_run(sup: &Supervisor, run_id: &str, meta: &mut RunMeta, control: &mut RunControl, now: i64) {
    let _ = std::fs::remove_file(sup.layout.run_file(run_id, "ended.json"));
    let _ = std::fs::remove_file(sup.layout.run_file(run_id, "final.json"));
    let _ = std::fs::remove_file(sup.layout.run_file(run_id, "failure.json"));
    meta.job_id = None;
    meta.job_state = None;
    meta.job_reason = None;
    meta.restart_count = 0;
    meta.partition_retry_count = 0;
    meta.next_submit_at = Some(now);
    meta.restart_reason = Some("manual_restart".to_string());
    control.restart_requested = false;
    control.updated_at = Some(now);
    let _ = write_json_atomic(&sup.layout.run_file(run_id, "control.json"), control);
    sup.event_log.restart(run_id, "manual_restart", meta.restart_count, 0);
}

fn clear_restart_requested(sup: &Supervisor, run_id: &str, control: &mut RunControl, now: i64) {
    if !control.restart_requested {
        return;
    }
    control.restart_requested = false;
    control.updated_at = Some(now);
    let _ = write_json_atomic(&sup.layout.run_file(run_id, "control.json"), control);
}

/// Apply the subset of `control.config_overrides` whose keys are in
/// [`ALLOWED_OVERRIDES`] onto `meta.config_overrides`. Unrecognized keys and
/// type-mismatched values are silently dropped, matching the directive
/// parser's forgiving posture toward unknown or malformed input.
fn apply_control_overrides(meta: &mut RunMeta, control: &RunControl) {
    for (key, value) in &control.config_overrides {
        if !ALLOWED_OVERRIDES.contains(&key.as_str()) {
            continue;
        }
        match key.as_str() {
            "heartbeat_interval_sec" => meta.config_overrides.heartbeat_interval_sec = value.as_u64(),
            "heartbeat_grace_sec" => meta.config_overrides.heartbeat_grace_sec = value.as_u64(),
            "max_retries" => {
                meta.config_overrides.max_retries = value.as_u64().and_then(|v| u32::try_from(v).ok());
            }
            "backoff_base_sec" => meta.config_overrides.backoff_base_sec = value.as_u64(),
            "backoff_max_sec" => meta.config_overrides.backoff_max_sec = value.as_u64(),
            "blacklist_ttl_sec" => meta.config_overrides.blacklist_ttl_sec = value.as_u64(),
            "blacklist_limit" => {
                meta.config_overrides.blacklist_limit = value.as_u64().and_then(|v| usize::try_from(v).ok());
            }
            "keep_alive_sec" => meta.config_overrides.keep_alive_sec = value.as_u64(),
            "sbatch_args" => meta.config_overrides.sbatch_args = value.as_str().map(str::to_string),
            "sbatch_script" => meta.config_overrides.sbatch_script = value.as_str().map(str::to_string),
            "progress_stall_sec" => meta.config_overrides.progress_stall_sec = value.as_u64(),
            _ => {}
        }
    }
}

/// Dedup quarantine writes on repeated ticks for the same failure via
/// `last_failure_ts`, and append one line to the run's `badnode_events.log`.
/// `dedup_ts` identifies *which* failure this is — the failure document's
/// own timestamp when one exists, so that a second tick observing the same
/// unchanged `failure.json` (same timestamp) is recognized as the same
/// failure rather than a new one, even though `now` has moved on.
fn apply_failure_blacklist(
    sup: &Supervisor,
    run_id: &str,
    meta: &mut RunMeta,
    quarantine: &mut Blacklist,
    node: &str,
    reason: &str,
    dedup_ts: i64,
    now: i64,
) -> bool {
    if meta.last_failure_ts == Some(dedup_ts) {
        return false;
    }
    meta.last_failure_ts = Some(dedup_ts);
    let ttl = meta.config_overrides.blacklist_ttl_sec.unwrap_or(sup.config.policy.blacklist_ttl_sec);
    blacklist::add_node(quarantine, node, Some(ttl), reason, now);
    append_badnode_event(sup, run_id, node, reason, now);
    sup.event_log.quarantine(run_id, node, reason);
    true
}

/// Independent of whatever restart reason triggered this tick: if the
/// wrapper has left behind a `failure.json` naming a host, quarantine that
/// host. Covers the case where a node-level failure is detected by the
/// wrapper itself (e.g. a failed GPU visibility probe) rather than via a
/// scheduler-reported `NODE_FAIL`. Dedups on the failure document's own
/// `ts` field, not the current tick's `now` — the same `failure.json` seen
/// across multiple ticks must quarantine its node only once.
fn quarantine_from_failure(
    sup: &Supervisor,
    run_id: &str,
    meta: &mut RunMeta,
    quarantine: &mut Blacklist,
    now: i64,
) -> bool {
    let Some(failure) = read_json::<RunFailure>(&sup.layout.run_file(run_id, "failure.json")).present() else {
        return false;
    };
    if failure.host.is_empty() {
        return false;
    }
    // Only the wrapper's node-attributable exit codes (NODE_FAULT/
    // TRESPASSER/CUDA_FAILURE) are quarantine candidates; WORKLOAD_FAILURE
    // (50) is the workload's own fault and must never blacklist a node.
    if !matches!(failure.exit_code, 42 | 43 | 44) {
        return false;
    }
    apply_failure_blacklist(sup, run_id, meta, quarantine, &failure.host, &failure.reason, failure.ts, now)
}

fn append_badnode_event(sup: &Supervisor, run_id: &str, node: &str, reason: &str, now: i64) {
    let line = format!("{now} {node} {reason}");
    let _ = append_line(&sup.layout.run_file(run_id, "badnode_events.log"), &line);
}

fn submit_run(sup: &Supervisor, run_id: &str, meta: &mut RunMeta, quarantine: &Blacklist, now: i64) {
    maybe_reset_to_preferred(meta, &sup.config.policy, now);

    let script_path = meta.config_overrides.sbatch_script.clone().unwrap_or_else(|| meta.script_path.clone());
    let (header, body, used_fallback) = match std::fs::read_to_string(&script_path) {
        Ok(contents) => {
            let (header, body) = script_wrap::split_header_body(&contents);
            (header, body, false)
        }
        Err(_) => (String::new(), String::new(), true),
    };

    let invocation = script_wrap::wrapper_invocation(
        &sup.config.wrapper_bin,
        sup.layout.root().to_string_lossy().as_ref(),
        run_id,
        &meta.run_mode,
    );
    let wrapped = if used_fallback {
        script_wrap::fallback_script(&invocation, &script_path)
    } else {
        script_wrap::wrap_script(&header, &body, &invocation)
    };

    let limit = meta.config_overrides.blacklist_limit.unwrap_or(sup.config.policy.blacklist_limit);
    let excluded = blacklist::exclude_list(quarantine, limit, now);

    let mut extra_args = partition_args(meta);
    if !excluded.is_empty() {
        extra_args.push(format!("--exclude={}", excluded.join(",")));
    }
    let raw_args = meta.config_overrides.sbatch_args.clone().unwrap_or_else(|| meta.sbatch_args.clone());
    if let Some(gres) = gpu_request_arg(meta, &raw_args) {
        extra_args.push(gres);
    }
    if let Some(tokens) = shlex::split(&raw_args) {
        extra_args.extend(tokens);
    }

    match sup.scheduler.submit(&wrapped, &extra_args) {
        crate::scheduler::SubmitOutcome::Submitted { job_id } => {
            let partition = meta.partitions.get(meta.partition_index).cloned();
            meta.job_id = Some(job_id.clone());
            meta.job_state = Some("pending".to_string());
            meta.job_reason = None;
            meta.restart_reason = None;
            meta.current_partition = partition.clone();
            meta.last_submit_at = Some(now);
            if meta.started_at.is_none() {
                meta.started_at = Some(now);
            }
            sup.event_log.submit(run_id, &job_id, partition.as_deref());
            let _ = write_json_atomic(&sup.layout.run_file(run_id, "meta.json"), meta);
        }
        crate::scheduler::SubmitOutcome::Failed(err) => {
            advance_partition(meta, &sup.config.policy);
            record_restart(sup, run_id, meta, &format!("sbatch_failed: {}", err.stderr.trim()), now);
        }
    }
}

fn partition_args(meta: &RunMeta) -> Vec<String> {
    meta.partitions
        .get(meta.partition_index)
        .map(|p| vec![format!("--partition={p}")])
        .unwrap_or_default()
}

/// `--gres=gpu:N` is appended only when a GPU count was requested and the
/// script's own `sbatch_args` hasn't already named a GPU resource.
fn gpu_request_arg(meta: &RunMeta, sbatch_args: &str) -> Option<String> {
    let gpus = meta.gpus?;
    if sbatch_args.contains("--gres=gpu") || sbatch_args.contains("--gpus") {
        return None;
    }
    Some(format!("--gres=gpu:{gpus}"))
}

/// Ranked-partition-list fallback: each consecutive submit failure while on
/// the same partition increments a per-partition retry counter; once it
/// exceeds `retry_per_partition`, advance to the next ranked partition and
/// reset the counter, wrapping back to the preferred (index 0) partition
/// after exhausting the list.
fn advance_partition(meta: &mut RunMeta, policy: &PolicyConfig) {
    if meta.partitions.len() <= 1 {
        return;
    }
    meta.partition_retry_count += 1;
    let threshold = meta.retry_per_partition.unwrap_or(policy.retry_per_partition);
    if meta.partition_retry_count >= threshold {
        meta.partition_index = (meta.partition_index + 1) % meta.partitions.len();
        meta.partition_retry_count = 0;
    }
}

/// Periodically re-probe the preferred (index 0) partition even while a
/// fallback partition is otherwise still under its retry budget, so a
/// transient outage on the preferred partition doesn't demote it forever.
fn maybe_reset_to_preferred(meta: &mut RunMeta, policy: &PolicyConfig, now: i64) {
    if meta.partitions.len() <= 1 || meta.partition_index == 0 {
        return;
    }
    let reset_sec = meta.reset_to_preferred_sec.unwrap_or(policy.reset_to_preferred_sec);
    if reset_sec == 0 {
        return;
    }
    let last = meta.last_preferred_attempt_at.unwrap_or(meta.created_at);
    if now.saturating_sub(last) >= i64::try_from(reset_sec).unwrap_or(i64::MAX) {
        meta.partition_index = 0;
        meta.partition_retry_count = 0;
    }
    meta.last_preferred_attempt_at = Some(now);
}

fn finalize_if_complete(sup: &Supervisor, run_id: &str, now: i64) -> bool {
    let Some(final_doc) = read_json::<RunFinal>(&sup.layout.run_file(run_id, "final.json")).present() else {
        return false;
    };
    let ended = RunEnded { ts: now, reason: "completed_success".to_string() };
    let _ = write_json_atomic(&sup.layout.run_file(run_id, "ended.json"), &ended);
    sup.event_log.expire(run_id, "completed_success");
    let _ = final_doc;
    true
}

fn expire_run(sup: &Supervisor, run_id: &str, meta: &RunMeta, now: i64, reason: &str) {
    if let Some(job_id) = &meta.job_id {
        sup.scheduler.cancel(job_id);
    }
    let ended = RunEnded { ts: now, reason: reason.to_string() };
    let _ = write_json_atomic(&sup.layout.run_file(run_id, "ended.json"), &ended);
    sup.event_log.expire(run_id, reason);
}

fn stop_run(sup: &Supervisor, run_id: &str, meta: &RunMeta, now: i64) {
    if let Some(job_id) = &meta.job_id {
        sup.scheduler.cancel(job_id);
    }
    let ended = RunEnded { ts: now, reason: "stopped_manual".to_string() };
    let _ = write_json_atomic(&sup.layout.run_file(run_id, "ended.json"), &ended);
    sup.event_log.expire(run_id, "stopped_manual");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::Config;

    fn supervisor(tmp: &std::path::Path) -> Supervisor {
        let mut config = Config::default();
        config.state_dir = tmp.to_path_buf();
        config.scheduler.squeue_bin = "false".to_string();
        config.scheduler.sbatch_bin = "false".to_string();
        config.scheduler.scancel_bin = "true".to_string();
        config.scheduler.sacct_bin = "false".to_string();
        Supervisor::new(config)
    }

    #[test]
    fn absent_meta_is_a_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());
        sup.layout.ensure_dirs().unwrap();
        let mut quarantine = Blacklist::default();
        let changed = handle_run(&sup, "missing", &HashMap::new(), &mut quarantine, 1_000).unwrap();
        assert!(!changed);
    }

    #[test]
    fn already_ended_run_is_skipped_without_restart_request() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());
        sup.layout.ensure_dirs().unwrap();
        let meta = RunMeta { run_id: "r1".into(), ..RunMeta::default() };
        write_json_atomic(&sup.layout.run_file("r1", "meta.json"), &meta).unwrap();
        write_json_atomic(&sup.layout.run_file("r1", "ended.json"), &RunEnded { ts: 1, reason: "expired".into() }).unwrap();
        let mut quarantine = Blacklist::default();
        let changed = handle_run(&sup, "r1", &HashMap::new(), &mut quarantine, 1_000).unwrap();
        assert!(!changed);
    }

    #[test]
    fn restart_requested_revives_an_ended_run() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());
        sup.layout.ensure_dirs().unwrap();
        let meta = RunMeta { run_id: "r1".into(), restart_count: 4, ..RunMeta::default() };
        write_json_atomic(&sup.layout.run_file("r1", "meta.json"), &meta).unwrap();
        write_json_atomic(&sup.layout.run_file("r1", "ended.json"), &RunEnded { ts: 1, reason: "expired".into() }).unwrap();
        write_json_atomic(&sup.layout.run_file("r1", "control.json"), &RunControl { restart_requested: true, ..RunControl::default() }).unwrap();
        let mut quarantine = Blacklist::default();
        handle_run(&sup, "r1", &HashMap::new(), &mut quarantine, 2_000).unwrap();
        assert!(!sup.layout.run_file("r1", "ended.json").exists());
        let revived: RunMeta = read_json(&sup.layout.run_file("r1", "meta.json")).present().unwrap();
        assert_eq!(revived.restart_count, 0);
        let control: RunControl = read_json(&sup.layout.run_file("r1", "control.json")).present().unwrap();
        assert!(!control.restart_requested);
    }

    #[test]
    fn finalize_if_complete_writes_ended_marker() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());
        sup.layout.ensure_dirs().unwrap();
        write_json_atomic(&sup.layout.run_file("r1", "final.json"), &RunFinal { ts: 1, exit_code: 0 }).unwrap();
        assert!(finalize_if_complete(&sup, "r1", 1_000));
        let ended: RunEnded = read_json(&sup.layout.run_file("r1", "ended.json")).present().unwrap();
        assert_eq!(ended.reason, "completed_success");
    }

    #[test]
    fn stop_requested_writes_stopped_marker_and_cancels() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());
        sup.layout.ensure_dirs().unwrap();
        let meta = RunMeta { run_id: "r1".into(), job_id: Some("55".into()), ..RunMeta::default() };
        write_json_atomic(&sup.layout.run_file("r1", "meta.json"), &meta).unwrap();
        write_json_atomic(&sup.layout.run_file("r1", "control.json"), &RunControl { stop_requested: true, ..RunControl::default() }).unwrap();
        let mut quarantine = Blacklist::default();
        handle_run(&sup, "r1", &HashMap::new(), &mut quarantine, 1_000).unwrap();
        let ended: RunEnded = read_json(&sup.layout.run_file("r1", "ended.json")).present().unwrap();
        assert_eq!(ended.reason, "stopped_manual");
    }

    #[test]
    fn paused_run_without_job_does_not_submit() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());
        sup.layout.ensure_dirs().unwrap();
        let meta = RunMeta { run_id: "r1".into(), ..RunMeta::default() };
        write_json_atomic(&sup.layout.run_file("r1", "meta.json"), &meta).unwrap();
        write_json_atomic(&sup.layout.run_file("r1", "control.json"), &RunControl { paused: true, ..RunControl::default() }).unwrap();
        let mut quarantine = Blacklist::default();
        handle_run(&sup, "r1", &HashMap::new(), &mut quarantine, 1_000).unwrap();
        let reread: RunMeta = read_json(&sup.layout.run_file("r1", "meta.json")).present().unwrap();
        assert!(reread.job_id.is_none());
    }

    #[test]
    fn keep_alive_expiry_ends_an_indefinite_run() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());
        sup.layout.ensure_dirs().unwrap();
        let meta = RunMeta {
            run_id: "r1".into(),
            run_mode: "indefinite".to_string(),
            started_at: Some(0),
            config_overrides: crate::model::ConfigOverrides { keep_alive_sec: Some(100), ..Default::default() },
            ..RunMeta::default()
        };
        write_json_atomic(&sup.layout.run_file("r1", "meta.json"), &meta).unwrap();
        let mut quarantine = Blacklist::default();
        handle_run(&sup, "r1", &HashMap::new(), &mut quarantine, 1_000).unwrap();
        let ended: RunEnded = read_json(&sup.layout.run_file("r1", "ended.json")).present().unwrap();
        assert_eq!(ended.reason, "expired");
    }

    #[test]
    fn indefinite_run_ignores_max_retries_cap() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());
        sup.layout.ensure_dirs().unwrap();
        let mut meta = RunMeta {
            run_id: "r1".into(),
            run_mode: "indefinite".to_string(),
            restart_count: sup.config.policy.max_retries + 10,
            ..RunMeta::default()
        };
        write_json_atomic(&sup.layout.run_file("r1", "meta.json"), &meta).unwrap();
        record_restart(&sup, "r1", &mut meta, "test", 1_000);
        assert!(!sup.layout.run_file("r1", "ended.json").exists());
    }

    #[test]
    fn restart_count_exceeding_max_retries_expires_run_once() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());
        sup.layout.ensure_dirs().unwrap();
        let mut meta = RunMeta {
            run_id: "r1".into(),
            run_mode: "run_once".to_string(),
            restart_count: sup.config.policy.max_retries,
            ..RunMeta::default()
        };
        write_json_atomic(&sup.layout.run_file("r1", "meta.json"), &meta).unwrap();
        record_restart(&sup, "r1", &mut meta, "test", 1_000);
        assert!(sup.layout.run_file("r1", "ended.json").exists());
    }

    #[test]
    fn advance_partition_wraps_around_ranked_list() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());
        let mut meta = RunMeta {
            partitions: vec!["a".into(), "b".into()],
            partition_retry_count: sup.config.policy.retry_per_partition + 1,
            ..RunMeta::default()
        };
        advance_partition(&mut meta, &sup.config.policy);
        assert_eq!(meta.partition_index, 1);
        assert_eq!(meta.partition_retry_count, 0);
        meta.partition_retry_count = sup.config.policy.retry_per_partition + 1;
        advance_partition(&mut meta, &sup.config.policy);
        assert_eq!(meta.partition_index, 0);
    }

    #[test]
    fn single_partition_never_advances() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());
        let mut meta = RunMeta { partitions: vec!["only".into()], partition_retry_count: 99, ..RunMeta::default() };
        advance_partition(&mut meta, &sup.config.policy);
        assert_eq!(meta.partition_index, 0);
    }

    #[test]
    fn reset_to_preferred_fires_after_window_elapses() {
        let mut meta = RunMeta {
            partitions: vec!["a".into(), "b".into()],
            partition_index: 1,
            created_at: 0,
            reset_to_preferred_sec: Some(100),
            ..RunMeta::default()
        };
        let policy = PolicyConfig::default();
        maybe_reset_to_preferred(&mut meta, &policy, 50);
        assert_eq!(meta.partition_index, 1, "window not yet elapsed");
        maybe_reset_to_preferred(&mut meta, &policy, 150);
        assert_eq!(meta.partition_index, 0);
    }

    #[test]
    fn gpu_request_arg_appends_gres_when_not_already_present() {
        let meta = RunMeta { gpus: Some(2), ..RunMeta::default() };
        assert_eq!(gpu_request_arg(&meta, ""), Some("--gres=gpu:2".to_string()));
        assert_eq!(gpu_request_arg(&meta, "--gres=gpu:1"), None);
        assert_eq!(gpu_request_arg(&meta, "--gpus=1"), None);
    }

    #[test]
    fn gpu_request_arg_is_none_without_a_gpu_count() {
        let meta = RunMeta::default();
        assert_eq!(gpu_request_arg(&meta, ""), None);
    }

    #[test]
    fn apply_control_overrides_ignores_keys_outside_the_allow_list() {
        let mut meta = RunMeta::default();
        let mut control = RunControl::default();
        control.config_overrides.insert("max_retries".to_string(), serde_json::json!(3));
        control.config_overrides.insert("state_dir".to_string(), serde_json::json!("/tmp/evil"));
        apply_control_overrides(&mut meta, &control);
        assert_eq!(meta.config_overrides.max_retries, Some(3));
        assert!(meta.config_overrides.sbatch_script.is_none());
    }

    #[test]
    fn dispatch_completed_cancelled_resets_without_incrementing_restart_count() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());
        sup.layout.ensure_dirs().unwrap();
        let mut meta = RunMeta { run_id: "r1".into(), job_id: Some("9".into()), restart_count: 2, ..RunMeta::default() };
        let mut quarantine = Blacklist::default();
        let completed = CompletedJob { state: JobState::Cancelled, exit_code: 0, node: None };
        dispatch_completed(&sup, "r1", &mut meta, &mut quarantine, Some(&completed), 1_000);
        assert_eq!(meta.restart_count, 2);
        assert!(meta.job_id.is_none());
        assert_eq!(meta.next_submit_at, Some(1_000));
    }

    #[test]
    fn dispatch_completed_node_fail_quarantines_reported_node() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());
        sup.layout.ensure_dirs().unwrap();
        let mut meta = RunMeta { run_id: "r1".into(), job_id: Some("9".into()), ..RunMeta::default() };
        let mut quarantine = Blacklist::default();
        let completed = CompletedJob { state: JobState::NodeFail, exit_code: 1, node: Some("bad-node".to_string()) };
        let dirty = dispatch_completed(&sup, "r1", &mut meta, &mut quarantine, Some(&completed), 1_000);
        assert!(dirty);
        assert!(quarantine.nodes.contains_key("bad-node"));
        assert_eq!(meta.restart_count, 1);
    }

    #[test]
    fn quarantine_from_failure_ignores_workload_failure_exit_code() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());
        sup.layout.ensure_dirs().unwrap();
        let mut meta = RunMeta { run_id: "r1".into(), ..RunMeta::default() };
        write_json_atomic(
            &sup.layout.run_file("r1", "failure.json"),
            &RunFailure { ts: 10, exit_code: 50, host: "n1".into(), reason: "workload_failure".into(), detail: None, job_id: None },
        )
        .unwrap();
        let mut quarantine = Blacklist::default();
        let dirty = quarantine_from_failure(&sup, "r1", &mut meta, &mut quarantine, 1_000);
        assert!(!dirty);
        assert!(quarantine.nodes.is_empty());
    }

    #[test]
    fn quarantine_from_failure_quarantines_node_fault_exit_code() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());
        sup.layout.ensure_dirs().unwrap();
        let mut meta = RunMeta { run_id: "r1".into(), ..RunMeta::default() };
        write_json_atomic(
            &sup.layout.run_file("r1", "failure.json"),
            &RunFailure { ts: 10, exit_code: 42, host: "n1".into(), reason: "gpu_visibility_failed".into(), detail: None, job_id: None },
        )
        .unwrap();
        let mut quarantine = Blacklist::default();
        let dirty = quarantine_from_failure(&sup, "r1", &mut meta, &mut quarantine, 1_000);
        assert!(dirty);
        assert!(quarantine.nodes.contains_key("n1"));
        assert_eq!(meta.last_failure_ts, Some(10));
    }

    #[test]
    fn dispatch_completed_success_writes_final_and_ended_for_run_once() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());
        sup.layout.ensure_dirs().unwrap();
        let mut meta = RunMeta { run_id: "r1".into(), job_id: Some("9".into()), ..RunMeta::default() };
        let mut quarantine = Blacklist::default();
        let completed = CompletedJob { state: JobState::Completed, exit_code: 0, node: None };
        dispatch_completed(&sup, "r1", &mut meta, &mut quarantine, Some(&completed), 1_000);
        let ended: RunEnded = read_json(&sup.layout.run_file("r1", "ended.json")).present().unwrap();
        assert_eq!(ended.reason, "completed_success");
        let final_doc: RunFinal = read_json(&sup.layout.run_file("r1", "final.json")).present().unwrap();
        assert_eq!(final_doc.exit_code, 0);
    }

    #[test]
    fn dispatch_completed_success_does_not_end_indefinite_run() {
        let tmp = tempfile::tempdir().unwrap();
        let sup = supervisor(tmp.path());
        sup.layout.ensure_dirs().unwrap();
        let mut meta =
            RunMeta { run_id: "r1".into(), run_mode: "indefinite".into(), job_id: Some("9".into()), ..RunMeta::default() };
        let mut quarantine = Blacklist::default();
        let completed = CompletedJob { state: JobState::Completed, exit_code: 0, node: None };
        dispatch_completed(&sup, "r1", &mut meta, &mut quarantine, Some(&completed), 1_000);
        assert!(!sup.layout.run_file("r1", "ended.json").exists());
        assert!(!sup.layout.run_file("r1", "final.json").exists());
        assert!(meta.job_id.is_none());
        assert_eq!(meta.restart_count, 1);
        assert_eq!(meta.restart_reason.as_deref(), Some("completed"));
    }
}
