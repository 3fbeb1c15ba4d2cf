//! Heartbeat file reading and the staleness predicate the Supervisor Loop
//! and Status Evaluator both consult. The wrapper-side periodic writer
//! lives in `wrapper::beacon_thread` since it needs a cancellation channel;
//! this module is the pure, allocation-free read side.

use std::path::Path;

/// Default interval the wrapper writes a heartbeat at, seconds.
pub const DEFAULT_INTERVAL_SEC: u64 = 30;
/// Default extra grace window before a heartbeat is considered stale, seconds.
pub const DEFAULT_GRACE_SEC: u64 = 90;

/// Parse the heartbeat file's epoch-seconds content. Returns `None` for a
/// missing file, unparseable content, or any other read failure — all
/// treated identically by callers (heartbeat unknown, not an error).
#[must_use]
pub fn read_heartbeat(path: &Path) -> Option<i64> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Whether a heartbeat is stale: absent, or older than
/// `interval_sec + grace_sec` relative to `now`.
#[must_use]
pub fn is_stale(last_beat: Option<i64>, interval_sec: u64, grace_sec: u64, now: i64) -> bool {
    let Some(last_beat) = last_beat else { return true };
    let threshold = i64::try_from(interval_sec.saturating_add(grace_sec)).unwrap_or(i64::MAX);
    now.saturating_sub(last_beat) > threshold
}
