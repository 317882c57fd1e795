//! Background-safe maintenance passes over a persona document: archival,
//! decay, deduplication, promotion.  Each pass is one locked
//! read-modify-write through [`MemoryStore::mutate`].

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::decay::{decay_score, is_expired, split_for_archival};
use crate::error::{MemoryError, MemoryResult};
use crate::schema::{CanonEntry, content_hash};
use crate::store::{ArchiveReason, ArchiveReport, MemoryStore};

#[derive(Debug, Clone, Default, Serialize)]
pub struct DecayReport {
    pub persona_id: String,
    pub rescored: usize,
    pub expired: usize,
    pub below_threshold: usize,
}

impl DecayReport {
    pub fn pruned(&self) -> usize {
        self.expired + self.below_threshold
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DedupReport {
    pub persona_id: String,
    pub canon_merged: usize,
    pub working_removed: usize,
}

impl MemoryStore {
    /// Archive all but the `archive_keep_recent` most recent working entries.
    pub async fn archive(&self, persona_id: &str) -> MemoryResult<ArchiveReport> {
        let keep = self.policy().archive_keep_recent;
        let (kept_working, report) = self
            .mutate(persona_id, ArchiveReason::Explicit, move |memory, evicted| {
                evicted.extend(split_for_archival(&mut memory.working, keep));
                Ok(memory.working.len())
            })
            .await?;

        match report {
            Some(report) => Ok(report),
            None => Ok(ArchiveReport {
                persona_id: persona_id.to_string(),
                reason: ArchiveReason::Explicit,
                archived: 0,
                kept_working,
                bytes_after: self.size_bytes(persona_id).await?,
            }),
        }
    }

    /// Rescore working memory and archive entries that expired or decayed
    /// below the prune threshold.
    pub async fn decay(&self, persona_id: &str, now: DateTime<Utc>) -> MemoryResult<DecayReport> {
        let half_life = self.policy().decay_half_life;
        let threshold = self.policy().decay_prune_threshold;
        let owner = persona_id.to_string();

        let (report, _) = self
            .mutate(persona_id, ArchiveReason::Decay, move |memory, evicted| {
                let mut report = DecayReport {
                    persona_id: owner,
                    ..Default::default()
                };
                let mut kept = Vec::with_capacity(memory.working.len());
                for mut entry in memory.working.drain(..) {
                    entry.decay_score = decay_score(entry.importance, now - entry.created_at, half_life);
                    report.rescored += 1;
                    if is_expired(&entry, now) {
                        report.expired += 1;
                        evicted.push(entry);
                    } else if entry.decay_score < threshold {
                        report.below_threshold += 1;
                        evicted.push(entry);
                    } else {
                        kept.push(entry);
                    }
                }
                memory.working = kept;
                Ok(report)
            })
            .await?;

        if report.pruned() > 0 {
            info!(
                persona_id,
                expired = report.expired,
                decayed = report.below_threshold,
                "working memory decay pass"
            );
        }
        Ok(report)
    }

    /// Collapse exact duplicates.  Working duplicates keep the newest copy;
    /// canon duplicates fold into the oldest entry with tags unioned.
    pub async fn deduplicate(&self, persona_id: &str) -> MemoryResult<DedupReport> {
        let owner = persona_id.to_string();
        let (report, _) = self
            .mutate(persona_id, ArchiveReason::Explicit, move |memory, _| {
                let mut report = DedupReport {
                    persona_id: owner,
                    ..Default::default()
                };

                memory.canon.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
                let mut canonical: HashMap<String, usize> = HashMap::new();
                let mut merged: Vec<CanonEntry> = Vec::with_capacity(memory.canon.len());
                for mut entry in memory.canon.drain(..) {
                    entry.content_hash = content_hash(&entry.content);
                    match canonical.get(&entry.content_hash) {
                        Some(&index) => {
                            let target = &mut merged[index];
                            target.tags.extend(entry.tags);
                            target.relevance_score = target.relevance_score.max(entry.relevance_score);
                            target.last_used = target.last_used.max(entry.last_used);
                            report.canon_merged += 1;
                        }
                        None => {
                            canonical.insert(entry.content_hash.clone(), merged.len());
                            merged.push(entry);
                        }
                    }
                }
                memory.canon = merged;

                memory.working.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                let mut seen = BTreeSet::new();
                let before = memory.working.len();
                memory.working.retain_mut(|entry| {
                    entry.content_hash = content_hash(&entry.content);
                    seen.insert((entry.client_id.clone(), entry.content_hash.clone()))
                });
                report.working_removed = before - memory.working.len();
                memory.working.sort_by(|a, b| a.created_at.cmp(&b.created_at));
                Ok(report)
            })
            .await?;

        debug!(
            persona_id,
            canon_merged = report.canon_merged,
            working_removed = report.working_removed,
            "deduplication pass"
        );
        Ok(report)
    }

    /// Move a working entry into canon.  Returns the canon entry id, which is
    /// an existing entry's id when the content was already canon.
    pub async fn promote(&self, persona_id: &str, working_id: Uuid, category: &str) -> MemoryResult<Uuid> {
        let category = category.to_string();
        let (id, _) = self
            .mutate(persona_id, ArchiveReason::Explicit, move |memory, _| {
                let position = memory
                    .working
                    .iter()
                    .position(|entry| entry.id == working_id)
                    .ok_or_else(|| MemoryError::NotFound(format!("working entry {working_id}")))?;
                let entry = memory.working.remove(position);
                let hash = content_hash(&entry.content);
                let now = Utc::now();

                if let Some(existing) = memory.canon.iter_mut().find(|c| c.content_hash == hash) {
                    existing.last_used = now;
                    return Ok(existing.id);
                }
                let canon = CanonEntry {
                    id: Uuid::new_v4(),
                    content: entry.content,
                    category,
                    relevance_score: entry.importance.max(0.5),
                    tags: BTreeSet::from(["promoted".to_string()]),
                    created_at: now,
                    last_used: now,
                    content_hash: hash,
                };
                let id = canon.id;
                memory.canon.push(canon);
                Ok(id)
            })
            .await?;
        info!(persona_id, %working_id, canon_id = %id, "working memory promoted to canon");
        Ok(id)
    }

    /// Refresh `last_used` on the given canon entries.
    pub async fn touch_canon(&self, persona_id: &str, ids: &[Uuid]) -> MemoryResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids = ids.iter().copied().collect::<BTreeSet<_>>();
        let (touched, _) = self
            .mutate(persona_id, ArchiveReason::Explicit, move |memory, _| {
                let now = Utc::now();
                let mut touched = 0;
                for entry in memory.canon.iter_mut().filter(|entry| ids.contains(&entry.id)) {
                    entry.last_used = now;
                    touched += 1;
                }
                Ok(touched)
            })
            .await?;
        Ok(touched)
    }
}
