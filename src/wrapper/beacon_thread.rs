//! Background liveness beacon: writes the current epoch-seconds timestamp
//! to the run's heartbeat file on a fixed interval until told to stop.
//! Cooperative rather than busy-polling: it blocks on a crossbeam-channel
//! receive-with-timeout, which both sleeps and reacts to cancellation in
//! one select.

use std::path::PathBuf;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};

/// Handle to a running beacon thread. Dropping or calling [`Self::stop`]
/// signals the thread to write one final heartbeat and exit.
pub struct BeaconHandle {
    stop_tx: Sender<()>,
    join: Option<JoinHandle<()>>,
}

impl BeaconHandle {
    pub fn stop(mut self) {
        let _ = self.stop_tx.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for BeaconHandle {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Spawn the beacon thread, writing to `heartbeat_path` every
/// `interval_sec` seconds.
#[must_use]
pub fn spawn(heartbeat_path: PathBuf, interval_sec: u64) -> BeaconHandle {
    let (stop_tx, stop_rx) = bounded::<()>(1);
    let join = std::thread::spawn(move || beacon_loop(&heartbeat_path, interval_sec, &stop_rx));
    BeaconHandle { stop_tx, join: Some(join) }
}

fn beacon_loop(heartbeat_path: &std::path::Path, interval_sec: u64, stop_rx: &Receiver<()>) {
    write_heartbeat(heartbeat_path);
    let interval = Duration::from_secs(interval_sec.max(1));
    loop {
        match stop_rx.recv_timeout(interval) {
            Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                write_heartbeat(heartbeat_path);
                return;
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => write_heartbeat(heartbeat_path),
        }
    }
}

fn write_heartbeat(path: &std::path::Path) {
    let now = chrono::Utc::now().timestamp();
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let _ = std::fs::write(path, format!("{now}\n"));
}
