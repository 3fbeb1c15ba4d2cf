//! Wrapper orchestration: argument parsing, the pre-flight probe sequence,
//! the beacon thread, workload execution, and exit-code/failure-document
//! reporting. Mirrors the Python reference implementation's `wrapper.py`
//! `main()`.

use std::path::PathBuf;
use std::process::{Command, ExitStatus};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use serde_json::Value;
use signal_hook::consts::{SIGINT, SIGTERM};

use crate::core::paths::StateLayout;
use crate::model::{RunFailure, RunFinal};
use crate::store::atomic::write_json_atomic;

use super::{beacon_thread, probes};

/// Exit code taxonomy the supervisor's Status Evaluator reads back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    NodeFault,
    Trespasser,
    CudaFailure,
    WorkloadFailure,
}

impl ExitKind {
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::NodeFault => 42,
            Self::Trespasser => 43,
            Self::CudaFailure => 44,
            Self::WorkloadFailure => 50,
        }
    }
}

/// A pre-flight probe or workload failure, carrying enough detail for the
/// run's `failure.json`.
#[derive(Debug, Clone)]
pub struct FailureExit {
    pub kind: ExitKind,
    pub reason: &'static str,
    pub detail: Option<Value>,
}

impl FailureExit {
    #[must_use]
    pub const fn new(kind: ExitKind, reason: &'static str, detail: Option<Value>) -> Self {
        Self { kind, reason, detail }
    }

    #[must_use]
    pub const fn node_fault(reason: &'static str, detail: Option<Value>) -> Self {
        Self::new(ExitKind::NodeFault, reason, detail)
    }

    #[must_use]
    pub const fn cuda_failure(reason: &'static str, detail: Option<Value>) -> Self {
        Self::new(ExitKind::CudaFailure, reason, detail)
    }
}

/// `shepherd-wrapper` CLI surface, matching the run-invocation contract.
#[derive(Debug, Clone, Parser)]
#[command(name = "shepherd-wrapper")]
pub struct WrapperArgs {
    #[arg(long)]
    pub run_id: Option<String>,
    #[arg(long, default_value = "run_once")]
    pub run_mode: String,
    #[arg(long)]
    pub state_dir: PathBuf,
    #[arg(long, default_value_t = crate::beacon::DEFAULT_INTERVAL_SEC)]
    pub heartbeat_interval: u64,
    /// Marks this invocation as resuming a previously-started run (e.g.
    /// after a preemption restart) rather than a first launch; recorded for
    /// operator visibility but does not change the probe sequence.
    #[arg(long)]
    pub resume: bool,
    #[arg(trailing_var_arg = true, required = true)]
    pub command: Vec<String>,
}

/// Entry point body for the `shepherd-wrapper` binary. Returns the process
/// exit code.
#[must_use]
pub fn run_wrapper(args: WrapperArgs) -> i32 {
    let run_id = args
        .run_id
        .clone()
        .or_else(|| std::env::var("SHEPHERD_RUN_ID").ok())
        .unwrap_or_else(|| "unknown".to_string());

    let layout = StateLayout::new(args.state_dir.clone());
    let heartbeat_path = layout.run_file(&run_id, "heartbeat");
    let terminated = install_termination_handler(layout.clone(), run_id.clone());

    for probe in [
        probes::probe_gpu_visibility as fn() -> Result<(), FailureExit>,
        probes::probe_expected_counts,
        probes::probe_cuda_smoke,
        probes::probe_trespassers,
    ] {
        if let Err(failure) = probe() {
            write_failure(&layout, &run_id, &failure);
            return failure.kind.exit_code();
        }
    }

    let beacon = beacon_thread::spawn(heartbeat_path, args.heartbeat_interval);

    let status = run_workload(&args.command);

    beacon.stop();

    if terminated.load(Ordering::Relaxed) {
        // A termination signal already wrote failure.json and will exit
        // via the process signal itself; nothing further to report.
        return ExitKind::WorkloadFailure.exit_code();
    }

    match status {
        Some(status) if status.success() => {
            if args.run_mode == "run_once" {
                write_final(&layout, &run_id);
            }
            0
        }
        Some(status) => {
            let failure = FailureExit::new(
                ExitKind::WorkloadFailure,
                "workload_failure",
                Some(serde_json::json!({"exit_code": status.code()})),
            );
            write_failure(&layout, &run_id, &failure);
            ExitKind::WorkloadFailure.exit_code()
        }
        None => {
            let failure = FailureExit::new(ExitKind::WorkloadFailure, "workload_spawn_failed", None);
            write_failure(&layout, &run_id, &failure);
            ExitKind::WorkloadFailure.exit_code()
        }
    }
}

fn run_workload(command: &[String]) -> Option<ExitStatus> {
    let (program, args) = command.split_first()?;
    Command::new(program).args(args).status().ok()
}

/// Installs SIGTERM/SIGINT handling that writes `failure.json{reason:
/// "terminated"}` before the process is torn down, and returns a flag the
/// caller checks so a normal-path failure report isn't written twice.
fn install_termination_handler(layout: StateLayout, run_id: String) -> Arc<AtomicBool> {
    let terminated = Arc::new(AtomicBool::new(false));
    let flag_for_signal = Arc::clone(&terminated);
    std::thread::spawn(move || {
        let raised = Arc::new(AtomicBool::new(false));
        let _ = signal_hook::flag::register(SIGTERM, Arc::clone(&raised));
        let _ = signal_hook::flag::register(SIGINT, Arc::clone(&raised));
        loop {
            if raised.load(Ordering::Relaxed) {
                flag_for_signal.store(true, Ordering::Relaxed);
                let failure = FailureExit::new(ExitKind::WorkloadFailure, "terminated", None);
                write_failure(&layout, &run_id, &failure);
                std::process::exit(ExitKind::WorkloadFailure.exit_code());
            }
            std::thread::sleep(std::time::Duration::from_millis(100));
        }
    });
    terminated
}

fn write_failure(layout: &StateLayout, run_id: &str, failure: &FailureExit) {
    let doc = RunFailure {
        ts: chrono::Utc::now().timestamp(),
        exit_code: failure.kind.exit_code(),
        host: hostname(),
        reason: failure.reason.to_string(),
        detail: failure.detail.clone(),
        job_id: std::env::var("SLURM_JOB_ID").ok().filter(|v| !v.is_empty()),
    };
    let _ = write_json_atomic(&layout.run_file(run_id, "failure.json"), &doc);
}

fn write_final(layout: &StateLayout, run_id: &str) {
    let doc = RunFinal { ts: chrono::Utc::now().timestamp(), exit_code: 0 };
    let _ = write_json_atomic(&layout.run_file(run_id, "final.json"), &doc);
}

/// `SLURMD_NODENAME` when present (the node the job landed on), falling
/// back to the kernel hostname.
fn hostname() -> String {
    if let Ok(name) = std::env::var("SLURMD_NODENAME") {
        if !name.is_empty() {
            return name;
        }
    }
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string())
}
