//! Pre-flight node-validation probes, each grounded on the Python
//! reference wrapper's `_probe_*` functions: GPU visibility, expected
//! device counts, a CUDA smoke test, and (opt-in) foreign-process
//! detection on shared GPUs.

use std::env;
use std::process::{Command, Stdio};
use std::time::Duration;

use wait_timeout::ChildExt;

use super::run::{ExitKind, FailureExit};

const PROBE_TIMEOUT_SEC: u64 = 10;

/// `nvidia-smi -L` must succeed and report at least one GPU.
pub fn probe_gpu_visibility() -> Result<(), FailureExit> {
    let output = run_probe("nvidia-smi", &["-L"]);
    match output {
        Some((true, stdout)) if !stdout.trim().is_empty() => Ok(()),
        Some((true, _)) => Err(FailureExit::node_fault("gpu_visibility_empty", None)),
        _ => Err(FailureExit::node_fault("gpu_visibility_failed", None)),
    }
}

/// `SHEPHERD_EXPECTED_GPU_COUNT`/`SHEPHERD_EXPECTED_MIG_COUNT`, when set,
/// must match what `nvidia-smi -L` reports.
pub fn probe_expected_counts() -> Result<(), FailureExit> {
    let Some((true, stdout)) = run_probe("nvidia-smi", &["-L"]) else {
        return Err(FailureExit::node_fault("gpu_visibility_failed", None));
    };
    let gpu_lines = stdout.lines().filter(|l| l.starts_with("GPU ")).count();
    let mig_lines = stdout.lines().filter(|l| l.trim_start().starts_with("MIG ")).count();

    if let Some(expected) = env_usize("SHEPHERD_EXPECTED_GPU_COUNT") {
        if gpu_lines != expected {
            return Err(FailureExit::node_fault(
                "gpu_count_mismatch",
                Some(serde_json::json!({"expected": expected, "actual": gpu_lines})),
            ));
        }
    }
    if let Some(expected) = env_usize("SHEPHERD_EXPECTED_MIG_COUNT") {
        if mig_lines != expected {
            return Err(FailureExit::node_fault(
                "mig_count_mismatch",
                Some(serde_json::json!({"expected": expected, "actual": mig_lines})),
            ));
        }
    }
    Ok(())
}

/// Runs a small CUDA-library smoke test via an external probe command.
/// Skipped entirely when `SHEPHERD_SKIP_CUDA_SMOKE=1`. The probe command
/// defaults to a Python one-liner (matching the reference implementation's
/// embedded torch/cupy/numba probe) but is overridable via
/// `SHEPHERD_CUDA_PROBE_CMD` for environments without Python, since a
/// three-way classification (pass / not-installed / real failure) is
/// awkward to express as a single Rust-native check. Exit code 2 from the
/// probe means a real CUDA failure; any other exit code (including
/// "libraries not installed") passes.
pub fn probe_cuda_smoke() -> Result<(), FailureExit> {
    if env::var("SHEPHERD_SKIP_CUDA_SMOKE").as_deref() == Ok("1") {
        return Ok(());
    }
    let probe_cmd = env::var("SHEPHERD_CUDA_PROBE_CMD").unwrap_or_else(|_| default_cuda_probe_cmd());
    let Some(tokens) = shlex::split(&probe_cmd) else {
        return Ok(());
    };
    let Some((program, args)) = tokens.split_first() else { return Ok(()) };

    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::null());
    cmd.stderr(Stdio::null());
    let Ok(mut child) = cmd.spawn() else {
        // Probe command itself unavailable: treat as "nothing to smoke-test".
        return Ok(());
    };
    match child.wait_timeout(Duration::from_secs(PROBE_TIMEOUT_SEC)) {
        Ok(Some(status)) if status.code() == Some(2) => {
            Err(FailureExit::cuda_failure("cuda_smoke_failed", None))
        }
        _ => Ok(()),
    }
}

fn default_cuda_probe_cmd() -> String {
    let script = "import sys\n\
try:\n\
    import torch\n\
    assert torch.cuda.is_available()\n\
except ImportError:\n\
    pass\n\
except Exception:\n\
    sys.exit(2)\n\
sys.exit(0)\n";
    format!("python3 -c {}", shlex::try_quote(script).unwrap_or_default())
}

/// Opt-in (`SHEPHERD_TRESPASSER_CHECK=1`) check that no GPU compute process
/// belongs to a different user than the current one.
pub fn probe_trespassers() -> Result<(), FailureExit> {
    if env::var("SHEPHERD_TRESPASSER_CHECK").as_deref() != Ok("1") {
        return Ok(());
    }
    let Some((true, stdout)) =
        run_probe("nvidia-smi", &["--query-compute-apps=pid,process_name", "--format=csv,noheader"])
    else {
        return Ok(());
    };
    let me = current_user();
    for line in stdout.lines() {
        let pid = line.split(',').next().unwrap_or("").trim();
        if pid.is_empty() || !pid.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        if let Some((true, owner)) = run_probe("ps", &["-o", "user=", "-p", pid]) {
            let owner = owner.trim();
            if !owner.is_empty() && owner != me {
                return Err(FailureExit::new(
                    ExitKind::Trespasser,
                    "foreign_gpu_process",
                    Some(serde_json::json!({"pid": pid, "owner": owner})),
                ));
            }
        }
    }
    Ok(())
}

fn current_user() -> String {
    env::var("USER").unwrap_or_default()
}

fn env_usize(name: &str) -> Option<usize> {
    env::var(name).ok()?.trim().parse().ok()
}

fn run_probe(program: &str, args: &[&str]) -> Option<(bool, String)> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::null());
    let mut child = cmd.spawn().ok()?;
    let status = match child.wait_timeout(Duration::from_secs(PROBE_TIMEOUT_SEC)).ok()? {
        Some(status) => status,
        None => {
            let _ = child.kill();
            let _ = child.wait();
            return Some((false, String::new()));
        }
    };
    let mut stdout = String::new();
    if let Some(mut out) = child.stdout.take() {
        use std::io::Read as _;
        let _ = out.read_to_string(&mut stdout);
    }
    Some((status.success(), stdout))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_trespassers_is_a_noop_unless_opted_in() {
        // Default test environment has SHEPHERD_TRESPASSER_CHECK unset.
        assert!(probe_trespassers().is_ok());
    }

    #[test]
    fn default_cuda_probe_cmd_is_parseable_by_shlex() {
        let cmd = default_cuda_probe_cmd();
        assert!(shlex::split(&cmd).is_some());
    }
}
