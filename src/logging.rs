//! Append-only JSONL operational event log: records supervisor decisions
//! (submit, restart, quarantine, expire) independent of the per-run
//! `badnode_events.log` the Persistent Store maintains. Degrades gracefully
//! rather than letting a broken log file take the daemon down with it.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;

/// Event kinds the supervisor records.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Submit,
    Restart,
    Quarantine,
    Expire,
    DaemonStart,
    DaemonStop,
}

#[derive(Debug, Clone, Serialize)]
struct EventRecord<'a> {
    ts: String,
    event: EventKind,
    run_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    job_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    node: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    partition: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    restart_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    backoff_sec: Option<u64>,
}

enum WriterState {
    Normal(File),
    Stderr,
    Discard,
}

/// Three-level degradation chain: primary file -> stderr with a
/// `[SHEP-EVENTLOG]` prefix -> silent discard. Never panics the daemon.
pub struct EventLog {
    path: PathBuf,
    writer: Mutex<WriterState>,
}

impl EventLog {
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        let writer = open_primary(&path);
        Self { path, writer: Mutex::new(writer) }
    }

    pub fn submit(&self, run_id: &str, job_id: &str, partition: Option<&str>) {
        self.write(EventRecord {
            ts: now(),
            event: EventKind::Submit,
            run_id: Some(run_id),
            job_id: Some(job_id),
            node: None,
            reason: None,
            partition,
            restart_count: None,
            backoff_sec: None,
        });
    }

    pub fn restart(&self, run_id: &str, reason: &str, restart_count: u32, backoff_sec: u64) {
        self.write(EventRecord {
            ts: now(),
            event: EventKind::Restart,
            run_id: Some(run_id),
            job_id: None,
            node: None,
            reason: Some(reason),
            partition: None,
            restart_count: Some(restart_count),
            backoff_sec: Some(backoff_sec),
        });
    }

    pub fn quarantine(&self, run_id: &str, node: &str, reason: &str) {
        self.write(EventRecord {
            ts: now(),
            event: EventKind::Quarantine,
            run_id: Some(run_id),
            job_id: None,
            node: Some(node),
            reason: Some(reason),
            partition: None,
            restart_count: None,
            backoff_sec: None,
        });
    }

    pub fn expire(&self, run_id: &str, reason: &str) {
        self.write(EventRecord {
            ts: now(),
            event: EventKind::Expire,
            run_id: Some(run_id),
            job_id: None,
            node: None,
            reason: Some(reason),
            partition: None,
            restart_count: None,
            backoff_sec: None,
        });
    }

    pub fn daemon_start(&self) {
        self.write(EventRecord {
            ts: now(),
            event: EventKind::DaemonStart,
            run_id: None,
            job_id: None,
            node: None,
            reason: None,
            partition: None,
            restart_count: None,
            backoff_sec: None,
        });
    }

    pub fn daemon_stop(&self) {
        self.write(EventRecord {
            ts: now(),
            event: EventKind::DaemonStop,
            run_id: None,
            job_id: None,
            node: None,
            reason: None,
            partition: None,
            restart_count: None,
            backoff_sec: None,
        });
    }

    fn write(&self, record: EventRecord<'_>) {
        let Ok(line) = serde_json::to_string(&record) else { return };
        let mut guard = self.writer.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match &mut *guard {
            WriterState::Normal(file) => {
                if writeln!(file, "{line}").is_err() {
                    eprintln!("[SHEP-EVENTLOG] {line}");
                    *guard = WriterState::Stderr;
                }
            }
            WriterState::Stderr => eprintln!("[SHEP-EVENTLOG] {line}"),
            WriterState::Discard => {}
        }
    }
}

fn open_primary(path: &PathBuf) -> WriterState {
    if let Some(parent) = path.parent() {
        if std::fs::create_dir_all(parent).is_err() {
            return WriterState::Stderr;
        }
    }
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => WriterState::Normal(file),
        Err(_) => WriterState::Stderr,
    }
}

fn now() -> String {
    Utc::now().to_rfc3339()
}
