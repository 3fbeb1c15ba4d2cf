//! Advisory file locking: per-run exclusion and the daemon single-instance
//! PID file. Non-blocking — acquisition either succeeds immediately or the
//! caller treats the resource as busy this tick.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;

/// A held exclusive lock on a run directory. Released on drop.
pub struct RunLock {
    _file: File,
    path: PathBuf,
}

impl RunLock {
    /// Attempt to acquire the lock at `path` without blocking. Returns `None`
    /// if another process (or another tick's in-flight handler) already
    /// holds it.
    pub fn try_acquire(path: &Path) -> std::io::Result<Option<Self>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().write(true).create(true).truncate(false).open(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { _file: file, path: path.to_path_buf() })),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Error raised when another daemon already holds the PID file lock.
#[derive(Debug)]
pub struct AlreadyLocked;

/// The daemon's single-instance PID file. Held for the daemon process's
/// entire lifetime; dropping it releases the lock (the PID file itself is
/// left in place, matching the spec's "stale PID file" recovery path).
pub struct PidFile {
    file: File,
}

impl PidFile {
    /// Acquire the exclusive lock before truncating, so a live daemon's PID
    /// is never clobbered by a process that is about to fail to acquire the
    /// lock.
    pub fn acquire(path: &Path) -> std::io::Result<Result<Self, AlreadyLocked>> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().write(true).create(true).truncate(false).open(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                file.set_len(0)?;
                writeln!(file, "{}", std::process::id())?;
                file.sync_all()?;
                Ok(Ok(Self { file }))
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(Err(AlreadyLocked)),
            Err(err) => Err(err),
        }
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Read the PID recorded in a (possibly stale) PID file.
pub fn read_pid(path: &Path) -> Option<i32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Whether a process with the given PID is currently alive, checked with a
/// zero signal so no actual signal is delivered.
#[cfg(unix)]
#[must_use]
pub fn process_is_alive(pid: i32) -> bool {
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok()
}

#[cfg(not(unix))]
#[must_use]
pub fn process_is_alive(_pid: i32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_lock_excludes_concurrent_acquire() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("run.lock");
        let first = RunLock::try_acquire(&path).unwrap();
        assert!(first.is_some());
        // Within a single process fs2 locks are per-fd, not per-process;
        // a second independent open should still see it held.
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        assert!(file.try_lock_exclusive().is_err());
        drop(first);
        assert!(file.try_lock_exclusive().is_ok());
    }

    #[test]
    fn pid_file_records_current_pid() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("daemon.pid");
        let guard = PidFile::acquire(&path).unwrap().unwrap();
        drop(guard);
        assert_eq!(read_pid(&path), Some(std::process::id() as i32));
    }

    #[test]
    fn process_is_alive_true_for_self() {
        assert!(process_is_alive(std::process::id() as i32));
    }
}
