#![forbid(unsafe_code)]

//! `shepherd-daemon` — the Supervisor Loop entry point: loads configuration,
//! acquires the single-instance PID file, installs signal handlers, and
//! ticks the [`shepherd::supervisor::Supervisor`] until asked to stop.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use shepherd::core::config::Config;
use shepherd::daemon::signals::SignalHandler;
use shepherd::store::lock::PidFile;
use shepherd::supervisor::Supervisor;

/// Supervise SLURM-style batch jobs: resubmit on failure, quarantine
/// faulty nodes, fail over across ranked partitions.
///
/// Not a full run-management CLI — starting and stopping the supervisor
/// process is all this binary does. Inspecting or mutating a run (status,
/// stop, restart, pause) happens by reading or writing that run's
/// `control.json` directly; that surface belongs to an external client.
#[derive(Debug, Parser)]
#[command(name = "shepherd-daemon", author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the Supervisor Loop and block until shutdown.
    Run(RunArgs),
}

#[derive(Debug, Parser)]
struct RunArgs {
    /// Path to `shepherd.toml`. Defaults to `SHEPHERD_CONFIG` or
    /// `~/.slurm_shepherd/shepherd.toml`.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Override the state directory from the config file.
    #[arg(long, value_name = "PATH")]
    state_dir: Option<PathBuf>,

    /// Override the poll interval (seconds) from the config file.
    #[arg(long, value_name = "SEC")]
    poll_interval: Option<u64>,

    /// Stay attached to the invoking terminal. This binary never detaches
    /// itself into the background regardless of this flag — it exists for
    /// interface compatibility with process supervisors that expect it.
    #[arg(long)]
    foreground: bool,
}

fn main() {
    let cli = Cli::parse();
    let Command::Run(args) = cli.command;
    std::process::exit(run(&args));
}

fn run(args: &RunArgs) -> i32 {
    let _ = args.foreground;
    let mut config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("shepherd-daemon: {err}");
            return 1;
        }
    };
    if let Some(state_dir) = &args.state_dir {
        config.state_dir = state_dir.clone();
    }
    if let Some(poll_interval) = args.poll_interval {
        config.policy.poll_interval_sec = poll_interval;
    }

    let supervisor = Supervisor::new(config);
    if let Err(err) = supervisor.layout.ensure_dirs() {
        eprintln!("shepherd-daemon: failed to prepare state directory: {err}");
        return 1;
    }

    let pid_path = supervisor.layout.pid_file();
    let _pid_guard = match PidFile::acquire(&pid_path) {
        Ok(Ok(guard)) => guard,
        Ok(Err(_already_locked)) => {
            eprintln!("shepherd-daemon: another instance already holds {}", pid_path.display());
            return 1;
        }
        Err(err) => {
            eprintln!("shepherd-daemon: failed to acquire PID file {}: {err}", pid_path.display());
            return 1;
        }
    };

    let signals = SignalHandler::new();
    let poll_interval = Duration::from_secs(supervisor.config.policy.poll_interval_sec.max(1));
    let poll_step = Duration::from_millis(200);

    supervisor.event_log.daemon_start();
    while !signals.should_shutdown() {
        let now = chrono::Utc::now().timestamp();
        if let Err(err) = supervisor.tick(now) {
            eprintln!("shepherd-daemon: tick failed: {err}");
        }
        sleep_interruptible(poll_interval, poll_step, &signals);
    }
    supervisor.event_log.daemon_stop();
    0
}

/// Sleep for `total`, checking `signals` every `step` so a shutdown signal
/// received mid-interval is honored promptly rather than after the full
/// poll interval elapses.
fn sleep_interruptible(total: Duration, step: Duration, signals: &SignalHandler) {
    let mut remaining = total;
    while remaining > Duration::ZERO && !signals.should_shutdown() {
        let slice = remaining.min(step);
        std::thread::sleep(slice);
        remaining = remaining.saturating_sub(slice);
    }
}
