//! Node quarantine list: add/remove/prune/exclude-list over the
//! `<state>/blacklist.json` document. Pure functions over [`Blacklist`];
//! persistence is the caller's job via `store::atomic`.

use crate::model::{Blacklist, BlacklistEntry};

/// Insert or refresh a quarantine entry for `node`.
pub fn add_node(blacklist: &mut Blacklist, node: &str, ttl_sec: Option<u64>, reason: &str, now: i64) {
    let expires_at = ttl_sec.map(|ttl| now.saturating_add(i64::try_from(ttl).unwrap_or(i64::MAX)));
    blacklist.nodes.insert(
        node.to_string(),
        BlacklistEntry { added_at: now, expires_at, reason: reason.to_string() },
    );
    blacklist.updated_at = Some(now);
}

/// Remove a node from quarantine, e.g. via manual operator action.
pub fn remove_node(blacklist: &mut Blacklist, node: &str, now: i64) {
    blacklist.nodes.remove(node);
    blacklist.updated_at = Some(now);
}

/// Drop entries whose `expires_at` has passed. Entries with no expiry
/// (permanent quarantine) are never pruned.
pub fn prune_expired(blacklist: &mut Blacklist, now: i64) {
    blacklist.nodes.retain(|_, entry| match entry.expires_at {
        Some(expires_at) => expires_at > now,
        None => true,
    });
}

/// The nodes to exclude from a submission: pruned, sorted ascending by
/// node name for determinism, capped at `limit` entries.
#[must_use]
pub fn exclude_list(blacklist: &Blacklist, limit: usize, now: i64) -> Vec<String> {
    let mut pruned = blacklist.clone();
    prune_expired(&mut pruned, now);
    let mut nodes: Vec<String> = pruned.nodes.into_keys().collect();
    nodes.sort();
    nodes.truncate(limit);
    nodes
}
