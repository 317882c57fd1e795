//! Working-memory decay and archival selection.  Pure functions; the store
//! applies them under its per-persona lock.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::schema::WorkingEntry;

/// `importance · 0.5^(age / half_life)`.  Entries from the future (clock
/// skew) are treated as brand new.
pub fn decay_score(importance: f64, age: chrono::Duration, half_life: Duration) -> f64 {
    let age_secs = age.num_milliseconds().max(0) as f64 / 1000.0;
    let half_life_secs = half_life.as_secs_f64().max(1.0);
    (importance * 0.5f64.powf(age_secs / half_life_secs)).clamp(0.0, 1.0)
}

pub fn is_expired(entry: &WorkingEntry, now: DateTime<Utc>) -> bool {
    entry.expires_at <= now
}

/// Keep the `keep` most recent entries (by `created_at`) in `working` and
/// return the rest, lowest importance first.
pub fn split_for_archival(working: &mut Vec<WorkingEntry>, keep: usize) -> Vec<WorkingEntry> {
    if working.len() <= keep {
        return Vec::new();
    }
    working.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    let split_at = working.len() - keep;
    let mut archived = working.drain(..split_at).collect::<Vec<_>>();
    archived.sort_by(|a, b| a.importance.total_cmp(&b.importance));
    archived
}

/// Remove the oldest `count` entries, used when the size ceiling still holds
/// after a regular archival pass.
pub fn take_oldest(working: &mut Vec<WorkingEntry>, count: usize) -> Vec<WorkingEntry> {
    working.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
    let count = count.min(working.len());
    working.drain(..count).collect()
}
