use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use persona_config::MemoryConfig;
use persona_core::PersonaCatalog;

use crate::backend::{MemoryBackend, RawDocument};
use crate::decay::{is_expired, split_for_archival, take_oldest};
use crate::document::{CorruptionKind, decode_document};
use crate::error::{MemoryError, MemoryResult};
use crate::schema::{
    CanonEntry, ClientProfile, MemoryLayer, PersonaMemory, SelfProfile, TurnRecord, WorkingEntry,
    content_hash,
};

/// Size and retention limits applied by the store.
#[derive(Debug, Clone)]
pub struct MemoryPolicy {
    pub max_file_size: u64,
    pub archive_threshold: u64,
    pub archive_keep_recent: usize,
    pub session_history_limit: usize,
    pub working_ttl: Duration,
    pub decay_half_life: Duration,
    pub decay_prune_threshold: f64,
}

impl Default for MemoryPolicy {
    fn default() -> Self {
        Self::from_config(&MemoryConfig::default())
    }
}

impl MemoryPolicy {
    pub fn from_config(config: &MemoryConfig) -> Self {
        Self {
            max_file_size: config.max_memory_file_size,
            archive_threshold: config.archive_threshold,
            archive_keep_recent: config.archive_keep_recent,
            session_history_limit: config.session_history_limit.max(1),
            working_ttl: Duration::from_secs(config.working_memory_ttl_hours * 3600),
            decay_half_life: Duration::from_secs(config.decay_half_life_hours * 3600),
            decay_prune_threshold: config.decay_prune_threshold,
        }
    }
}

/// A layer-tagged write.  The variant is the routing tag.
#[derive(Debug, Clone)]
pub enum MemoryWrite {
    Canon {
        content: String,
        category: String,
        tags: BTreeSet<String>,
    },
    ClientFact {
        client_id: String,
        name: String,
        value: String,
    },
    Working {
        client_id: Option<String>,
        content: String,
        importance: f64,
    },
    Turn {
        client_id: String,
        turn: TurnRecord,
    },
}

impl MemoryWrite {
    pub fn layer(&self) -> MemoryLayer {
        match self {
            Self::Canon { .. } => MemoryLayer::Canon,
            Self::ClientFact { .. } => MemoryLayer::ClientProfile,
            Self::Working { .. } => MemoryLayer::Working,
            Self::Turn { .. } => MemoryLayer::SessionHistory,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveReason {
    Explicit,
    SizeThreshold,
    Decay,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveReport {
    pub persona_id: String,
    pub reason: ArchiveReason,
    pub archived: usize,
    pub kept_working: usize,
    pub bytes_after: u64,
}

#[derive(Debug, Clone)]
pub struct WriteReceipt {
    pub layer: MemoryLayer,
    pub id: Option<Uuid>,
    /// `true` when the write merged into an existing identical entry.
    pub merged: bool,
    pub archive: Option<ArchiveReport>,
}

/// Everything [`MemoryStore::assemble`] hands to a turn.
#[derive(Debug, Clone, Default)]
pub struct MemoryPayload {
    pub core_biography: String,
    pub canon: Vec<CanonEntry>,
    pub client_profile: Option<ClientProfile>,
    pub working_memory: Vec<WorkingEntry>,
    pub session_history: Vec<TurnRecord>,
    /// Set when the payload is a stand-in because storage failed.
    pub degraded: bool,
}

impl MemoryPayload {
    pub fn degraded(core_biography: String) -> Self {
        Self {
            core_biography,
            degraded: true,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.canon.is_empty()
            && self.client_profile.as_ref().is_none_or(|p| p.facts.is_empty())
            && self.working_memory.is_empty()
            && self.session_history.is_empty()
    }

    /// Memory rendered as context lines, oldest and most durable first, so
    /// a recency-biased compressor keeps the freshest conversation.
    pub fn handoff_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for entry in &self.canon {
            lines.push(format!("[canon] {}", entry.content));
        }
        if let Some(profile) = &self.client_profile {
            for (name, value) in &profile.facts {
                lines.push(format!("[client] {name}: {value}"));
            }
        }
        for entry in &self.working_memory {
            lines.push(format!("[note] {}", entry.content));
        }
        for turn in &self.session_history {
            lines.push(turn.as_context_line());
        }
        lines
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MemoryStats {
    pub personas: usize,
    pub total_entries: usize,
    pub canon: usize,
    pub working: usize,
    pub client_facts: usize,
    pub history_turns: usize,
    pub total_bytes: u64,
    pub largest_document_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DocumentState {
    Missing,
    Unreadable(String),
    Loaded,
}

/// Integrity view of one persona document.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentInspection {
    pub persona_id: String,
    pub state: DocumentState,
    pub bytes: u64,
    pub malformed: usize,
    #[serde(skip)]
    pub malformed_kinds: BTreeSet<CorruptionKind>,
    /// Entries whose exact content already appears earlier in the same layer.
    pub duplicate_entries: usize,
}

/// Persists and retrieves the memory layers of every persona.
///
/// Writes take a per-persona async lock for the whole read-modify-write
/// cycle; reads never take it, so health scans do not stall requests.
pub struct MemoryStore {
    backend: Arc<dyn MemoryBackend>,
    policy: MemoryPolicy,
    catalog: Arc<PersonaCatalog>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl MemoryStore {
    pub fn new(backend: Arc<dyn MemoryBackend>, policy: MemoryPolicy) -> Self {
        Self {
            backend,
            policy,
            catalog: Arc::new(PersonaCatalog::default()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_catalog(mut self, catalog: Arc<PersonaCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn policy(&self) -> &MemoryPolicy {
        &self.policy
    }

    pub fn catalog(&self) -> &PersonaCatalog {
        &self.catalog
    }

    fn persona_lock(&self, persona_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(persona_id.to_string())
            .or_default()
            .clone()
    }

    // ── Reads ────────────────────────────────────────────────────────────────

    async fn load_for_read(&self, persona_id: &str) -> MemoryResult<PersonaMemory> {
        match self.backend.load_raw(persona_id).await? {
            RawDocument::Missing => Ok(PersonaMemory::new(persona_id)),
            RawDocument::Present(raw) => Ok(decode_document(persona_id, &raw)?.memory),
        }
    }

    /// Gather every layer for `(persona_id, client_id)`.  Side-effect free.
    ///
    /// Fails with [`MemoryError::StorageUnavailable`] when the medium is
    /// unreachable; callers are expected to continue with
    /// [`MemoryPayload::degraded`].
    pub async fn assemble(&self, persona_id: &str, client_id: &str) -> MemoryResult<MemoryPayload> {
        let core_biography = self.catalog.get_or_placeholder(persona_id).core_biography();
        let memory = self.load_for_read(persona_id).await?;
        let now = Utc::now();

        let mut working_memory = memory
            .working
            .into_iter()
            .filter(|entry| entry.visible_to(client_id) && !is_expired(entry, now))
            .collect::<Vec<_>>();
        working_memory.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let session_history = memory
            .session_history
            .get(client_id)
            .map(|turns| turns.iter().cloned().collect())
            .unwrap_or_default();

        Ok(MemoryPayload {
            core_biography,
            canon: memory.canon,
            client_profile: memory.client_profiles.get(client_id).cloned(),
            working_memory,
            session_history,
            degraded: false,
        })
    }

    /// [`assemble`](Self::assemble) with graceful degradation to an empty payload.
    pub async fn assemble_or_empty(&self, persona_id: &str, client_id: &str) -> MemoryPayload {
        match self.assemble(persona_id, client_id).await {
            Ok(payload) => payload,
            Err(err) => {
                warn!(persona_id, client_id, error = %err, "memory unavailable, continuing with empty payload");
                MemoryPayload::degraded(self.catalog.get_or_placeholder(persona_id).core_biography())
            }
        }
    }

    pub async fn load_self_profile(&self, persona_id: &str) -> MemoryResult<Option<SelfProfile>> {
        Ok(self.load_for_read(persona_id).await?.self_profile)
    }

    pub async fn personas(&self) -> MemoryResult<Vec<String>> {
        self.backend.personas().await
    }

    pub async fn size_bytes(&self, persona_id: &str) -> MemoryResult<u64> {
        self.backend.size_bytes(persona_id).await
    }

    pub async fn stats(&self) -> MemoryResult<MemoryStats> {
        let mut stats = MemoryStats::default();
        for persona_id in self.backend.personas().await? {
            let bytes = self.backend.size_bytes(&persona_id).await?;
            stats.personas += 1;
            stats.total_bytes += bytes;
            stats.largest_document_bytes = stats.largest_document_bytes.max(bytes);

            let memory = match self.load_for_read(&persona_id).await {
                Ok(memory) => memory,
                Err(MemoryError::Corrupt { .. }) => continue,
                Err(err) => return Err(err),
            };
            stats.canon += memory.canon.len();
            stats.working += memory.working.len();
            stats.client_facts += memory
                .client_profiles
                .values()
                .map(|profile| profile.facts.len())
                .sum::<usize>();
            stats.history_turns += memory.session_history.values().map(|turns| turns.len()).sum::<usize>();
            stats.total_entries += memory.entry_count();
        }
        Ok(stats)
    }

    /// Decode `persona_id` without repairing anything and report what is wrong.
    pub async fn inspect(&self, persona_id: &str) -> DocumentInspection {
        let mut inspection = DocumentInspection {
            persona_id: persona_id.to_string(),
            state: DocumentState::Missing,
            bytes: 0,
            malformed: 0,
            malformed_kinds: BTreeSet::new(),
            duplicate_entries: 0,
        };

        let raw = match self.backend.load_raw(persona_id).await {
            Ok(RawDocument::Missing) => return inspection,
            Ok(RawDocument::Present(raw)) => raw,
            Err(err) => {
                inspection.state = DocumentState::Unreadable(err.to_string());
                return inspection;
            }
        };
        inspection.bytes = raw.len() as u64;

        let decoded = match decode_document(persona_id, &raw) {
            Ok(decoded) => decoded,
            Err(err) => {
                inspection.state = DocumentState::Unreadable(err.to_string());
                return inspection;
            }
        };

        inspection.state = DocumentState::Loaded;
        inspection.malformed = decoded.malformed.len();
        inspection.malformed_kinds = decoded.malformed.iter().map(|m| m.kind).collect();
        inspection.duplicate_entries =
            count_duplicates(decoded.memory.canon.iter().map(|e| e.content.as_str()))
                + count_duplicates(decoded.memory.working.iter().map(|e| e.content.as_str()));
        inspection
    }

    // ── Writes ───────────────────────────────────────────────────────────────

    /// Load for mutation.  Undecodable fragments are moved to quarantine so
    /// the next save heals the document.
    async fn load_for_write(&self, persona_id: &str) -> MemoryResult<PersonaMemory> {
        let raw = match self.backend.load_raw(persona_id).await? {
            RawDocument::Missing => return Ok(PersonaMemory::new(persona_id)),
            RawDocument::Present(raw) => raw,
        };

        match decode_document(persona_id, &raw) {
            Ok(decoded) => {
                if !decoded.malformed.is_empty() {
                    let fragments = decoded.malformed.iter().map(|m| m.raw.clone()).collect::<Vec<_>>();
                    self.backend.quarantine(persona_id, &fragments).await?;
                }
                Ok(decoded.memory)
            }
            Err(MemoryError::Corrupt { detail, .. }) => {
                warn!(persona_id, %detail, "memory document corrupt, quarantining and starting fresh");
                self.backend.quarantine(persona_id, &[raw]).await?;
                Ok(PersonaMemory::new(persona_id))
            }
            Err(err) => Err(err),
        }
    }

    /// Run `apply` against the persona document under its lock, enforce the
    /// size invariant, archive whatever `apply` or the size check evicted,
    /// and save.
    pub(crate) async fn mutate<T, F>(
        &self,
        persona_id: &str,
        reason: ArchiveReason,
        apply: F,
    ) -> MemoryResult<(T, Option<ArchiveReport>)>
    where
        F: FnOnce(&mut PersonaMemory, &mut Vec<WorkingEntry>) -> MemoryResult<T>,
    {
        let lock = self.persona_lock(persona_id);
        let _guard = lock.lock().await;

        let mut memory = self.load_for_write(persona_id).await?;
        let mut evicted = Vec::new();
        let value = apply(&mut memory, &mut evicted)?;

        let mut reason = reason;
        let mut document = serde_json::to_string(&memory)?;
        if document.len() as u64 > self.policy.archive_threshold {
            let batch = split_for_archival(&mut memory.working, self.policy.archive_keep_recent);
            if !batch.is_empty() {
                reason = ArchiveReason::SizeThreshold;
                evicted.extend(batch);
                document = serde_json::to_string(&memory)?;
            }
        }
        while document.len() as u64 > self.policy.max_file_size && !memory.working.is_empty() {
            let chunk = (memory.working.len() / 10).max(1);
            evicted.extend(take_oldest(&mut memory.working, chunk));
            reason = ArchiveReason::SizeThreshold;
            document = serde_json::to_string(&memory)?;
        }
        if document.len() as u64 > self.policy.max_file_size {
            warn!(
                persona_id,
                bytes = document.len(),
                limit = self.policy.max_file_size,
                "memory document exceeds size ceiling with no working memory left to archive"
            );
        }

        let mut report = None;
        if !evicted.is_empty() {
            self.backend.append_archive(persona_id, &evicted).await?;
            memory.archive.total_archived += evicted.len() as u64;
            memory.archive.last_batch = evicted.len();
            memory.archive.last_archived_at = Some(Utc::now());
            document = serde_json::to_string(&memory)?;
            info!(
                persona_id,
                archived = evicted.len(),
                kept = memory.working.len(),
                ?reason,
                "working memory archived"
            );
            report = Some(ArchiveReport {
                persona_id: persona_id.to_string(),
                reason,
                archived: evicted.len(),
                kept_working: memory.working.len(),
                bytes_after: document.len() as u64,
            });
        }

        self.backend.save_raw(persona_id, &document).await?;
        Ok((value, report))
    }

    /// Append or upsert into the layer named by `write`.
    pub async fn write(&self, persona_id: &str, write: MemoryWrite) -> MemoryResult<WriteReceipt> {
        let layer = write.layer();
        let policy = self.policy.clone();
        let ((id, merged), archive) = self
            .mutate(persona_id, ArchiveReason::SizeThreshold, move |memory, _| {
                Ok(apply_write(memory, write, &policy, Utc::now()))
            })
            .await?;
        debug!(persona_id, layer = layer.slug(), ?id, merged, "memory write applied");
        Ok(WriteReceipt {
            layer,
            id,
            merged,
            archive,
        })
    }

    pub async fn save_self_profile(&self, profile: SelfProfile) -> MemoryResult<()> {
        let persona_id = profile.persona_id.clone();
        self.mutate(&persona_id, ArchiveReason::SizeThreshold, move |memory, _| {
            memory.self_profile = Some(profile);
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Fold a new state into the persona's self profile under the persona
    /// lock.  `update` sees the stored profile, if any.
    pub async fn update_self_profile<F>(&self, persona_id: &str, update: F) -> MemoryResult<SelfProfile>
    where
        F: FnOnce(Option<SelfProfile>) -> SelfProfile,
    {
        let (profile, _) = self
            .mutate(persona_id, ArchiveReason::SizeThreshold, move |memory, _| {
                let profile = update(memory.self_profile.take());
                memory.self_profile = Some(profile.clone());
                Ok(profile)
            })
            .await?;
        Ok(profile)
    }
}

fn apply_write(
    memory: &mut PersonaMemory,
    write: MemoryWrite,
    policy: &MemoryPolicy,
    now: DateTime<Utc>,
) -> (Option<Uuid>, bool) {
    match write {
        MemoryWrite::Canon {
            content,
            category,
            tags,
        } => {
            let hash = content_hash(&content);
            if let Some(existing) = memory.canon.iter_mut().find(|entry| entry.content_hash == hash) {
                existing.tags.extend(tags);
                existing.last_used = now;
                return (Some(existing.id), true);
            }
            let entry = CanonEntry {
                id: Uuid::new_v4(),
                content,
                category,
                relevance_score: 1.0,
                tags,
                created_at: now,
                last_used: now,
                content_hash: hash,
            };
            let id = entry.id;
            memory.canon.push(entry);
            (Some(id), false)
        }
        MemoryWrite::ClientFact {
            client_id,
            name,
            value,
        } => {
            let profile = memory
                .client_profiles
                .entry(client_id.clone())
                .or_insert_with(|| ClientProfile {
                    client_id,
                    ..Default::default()
                });
            let merged = profile.facts.insert(name, value).is_some();
            profile.updated_at = Some(now);
            (None, merged)
        }
        MemoryWrite::Working {
            client_id,
            content,
            importance,
        } => {
            let importance = importance.clamp(0.0, 1.0);
            let ttl = chrono::Duration::from_std(policy.working_ttl).unwrap_or(chrono::Duration::hours(72));
            let entry = WorkingEntry {
                id: Uuid::new_v4(),
                client_id,
                content_hash: content_hash(&content),
                content,
                importance,
                decay_score: importance,
                created_at: now,
                expires_at: now + ttl,
            };
            let id = entry.id;
            memory.working.push(entry);
            (Some(id), false)
        }
        MemoryWrite::Turn { client_id, turn } => {
            let history = memory.session_history.entry(client_id).or_default();
            history.push_back(turn);
            while history.len() > policy.session_history_limit {
                history.pop_front();
            }
            (None, false)
        }
    }
}

fn count_duplicates<'a>(contents: impl Iterator<Item = &'a str>) -> usize {
    let mut seen = HashSet::new();
    contents.filter(|content| !seen.insert(content_hash(content))).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use persona_core::PersonaDescriptor;

    fn store_with(policy: MemoryPolicy) -> (Arc<InMemoryBackend>, MemoryStore) {
        let backend = Arc::new(InMemoryBackend::new());
        let store = MemoryStore::new(backend.clone(), policy);
        (backend, store)
    }

    fn working(content: &str) -> MemoryWrite {
        MemoryWrite::Working {
            client_id: Some("c1".into()),
            content: content.into(),
            importance: 0.5,
        }
    }

    #[tokio::test]
    async fn assemble_missing_persona_is_empty() {
        let (_, store) = store_with(MemoryPolicy::default());
        let payload = store.assemble("jane", "c1").await.unwrap();
        assert!(payload.is_empty());
        assert!(!payload.degraded);
        assert!(payload.core_biography.starts_with("jane"));
    }

    #[tokio::test]
    async fn assemble_uses_catalog_biography() {
        let backend = Arc::new(InMemoryBackend::new());
        let catalog = PersonaCatalog::from_descriptors([PersonaDescriptor {
            id: "jane".into(),
            name: "Jane Doe".into(),
            role: "coordinator".into(),
            ..Default::default()
        }]);
        let store = MemoryStore::new(backend, MemoryPolicy::default()).with_catalog(Arc::new(catalog));
        let payload = store.assemble("jane", "c1").await.unwrap();
        assert!(payload.core_biography.starts_with("Jane Doe (coordinator)"));
    }

    #[tokio::test]
    async fn writes_route_to_their_layers() {
        let (_, store) = store_with(MemoryPolicy::default());
        store
            .write(
                "jane",
                MemoryWrite::Canon {
                    content: "Fixed the roster".into(),
                    category: "achievement".into(),
                    tags: BTreeSet::from(["canon".to_string()]),
                },
            )
            .await
            .unwrap();
        store
            .write(
                "jane",
                MemoryWrite::ClientFact {
                    client_id: "c1".into(),
                    name: "name".into(),
                    value: "Sam".into(),
                },
            )
            .await
            .unwrap();
        store.write("jane", working("likes tea")).await.unwrap();

        let payload = store.assemble("jane", "c1").await.unwrap();
        assert_eq!(payload.canon.len(), 1);
        assert_eq!(payload.canon[0].category, "achievement");
        assert_eq!(payload.client_profile.unwrap().facts["name"], "Sam");
        assert_eq!(payload.working_memory.len(), 1);

        // Client-scoped working memory is invisible to other clients.
        let other = store.assemble("jane", "c2").await.unwrap();
        assert!(other.working_memory.is_empty());
        assert!(other.client_profile.is_none());
        assert_eq!(other.canon.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_canon_merges_tags() {
        let (_, store) = store_with(MemoryPolicy::default());
        let first = store
            .write(
                "jane",
                MemoryWrite::Canon {
                    content: "Prefers mornings".into(),
                    category: "general".into(),
                    tags: BTreeSet::from(["a".to_string()]),
                },
            )
            .await
            .unwrap();
        let second = store
            .write(
                "jane",
                MemoryWrite::Canon {
                    content: "Prefers   mornings".into(),
                    category: "general".into(),
                    tags: BTreeSet::from(["b".to_string()]),
                },
            )
            .await
            .unwrap();
        assert!(second.merged);
        assert_eq!(first.id, second.id);
        let payload = store.assemble("jane", "c1").await.unwrap();
        assert_eq!(payload.canon.len(), 1);
        assert_eq!(payload.canon[0].tags.len(), 2);
    }

    #[tokio::test]
    async fn session_history_is_bounded() {
        let policy = MemoryPolicy {
            session_history_limit: 3,
            ..Default::default()
        };
        let (_, store) = store_with(policy);
        for i in 0..5 {
            store
                .write(
                    "jane",
                    MemoryWrite::Turn {
                        client_id: "c1".into(),
                        turn: TurnRecord {
                            user: format!("q{i}"),
                            assistant: format!("a{i}"),
                            provider: "echo".into(),
                            timestamp: Utc::now(),
                        },
                    },
                )
                .await
                .unwrap();
        }
        let payload = store.assemble("jane", "c1").await.unwrap();
        let users = payload.session_history.iter().map(|t| t.user.as_str()).collect::<Vec<_>>();
        assert_eq!(users, vec!["q2", "q3", "q4"]);
    }

    #[tokio::test]
    async fn unavailable_storage_degrades_to_empty_payload() {
        let (backend, store) = store_with(MemoryPolicy::default());
        store.write("jane", working("remember me")).await.unwrap();
        backend.set_available(false);

        assert!(matches!(
            store.assemble("jane", "c1").await,
            Err(MemoryError::StorageUnavailable(_))
        ));
        let payload = store.assemble_or_empty("jane", "c1").await;
        assert!(payload.degraded);
        assert!(payload.is_empty());
        assert!(!payload.core_biography.is_empty());
    }

    #[tokio::test]
    async fn size_threshold_triggers_archival_and_preserves_canon() {
        let policy = MemoryPolicy {
            archive_threshold: 4_000,
            max_file_size: 8_000,
            archive_keep_recent: 5,
            ..Default::default()
        };
        let (backend, store) = store_with(policy);
        store
            .write(
                "jane",
                MemoryWrite::Canon {
                    content: "Canon survives".into(),
                    category: "general".into(),
                    tags: BTreeSet::new(),
                },
            )
            .await
            .unwrap();

        let mut saw_archive = false;
        for i in 0..60 {
            let receipt = store
                .write("jane", working(&format!("working note number {i} with some padding text")))
                .await
                .unwrap();
            saw_archive |= receipt.archive.is_some();
        }
        assert!(saw_archive);
        assert!(store.size_bytes("jane").await.unwrap() <= 8_000);
        assert!(!backend.archived("jane").is_empty());

        let payload = store.assemble("jane", "c1").await.unwrap();
        assert_eq!(payload.canon.len(), 1);
        assert!(payload.working_memory.len() < 60);
        // The newest note is never the one archived.
        assert!(
            payload
                .working_memory
                .iter()
                .any(|e| e.content.starts_with("working note number 59"))
        );
    }

    #[tokio::test]
    async fn corrupt_document_is_quarantined_on_write() {
        let (backend, store) = store_with(MemoryPolicy::default());
        backend.put_raw("jane", "{ this is not json");
        assert!(store.assemble("jane", "c1").await.is_err());

        store.write("jane", working("fresh start")).await.unwrap();
        assert_eq!(backend.quarantined("jane"), vec!["{ this is not json".to_string()]);
        let payload = store.assemble("jane", "c1").await.unwrap();
        assert_eq!(payload.working_memory.len(), 1);
    }

    #[tokio::test]
    async fn inspect_reports_malformed_and_duplicates() {
        let (backend, store) = store_with(MemoryPolicy::default());
        let id_a = Uuid::new_v4();
        let id_b = Uuid::new_v4();
        backend.put_raw(
            "jane",
            format!(
                r#"{{"persona_id":"jane","canon":[
                    {{"id":"{id_a}","content":"same"}},
                    {{"id":"{id_b}","content":"same"}},
                    {{"content":"orphan"}}
                ]}}"#
            ),
        );
        let inspection = store.inspect("jane").await;
        assert_eq!(inspection.state, DocumentState::Loaded);
        assert_eq!(inspection.malformed, 1);
        assert!(inspection.malformed_kinds.contains(&CorruptionKind::MissingId));
        assert_eq!(inspection.duplicate_entries, 1);

        assert_eq!(store.inspect("nobody").await.state, DocumentState::Missing);
    }

    #[tokio::test]
    async fn self_profile_round_trip() {
        let (_, store) = store_with(MemoryPolicy::default());
        assert!(store.load_self_profile("jane").await.unwrap().is_none());
        store
            .save_self_profile(SelfProfile {
                persona_id: "jane".into(),
                traits: Default::default(),
                last_alignment_score: 0.8,
                working_self_state: "steady".into(),
                evaluations: 1,
                updated_at: Some(Utc::now()),
            })
            .await
            .unwrap();
        let profile = store.load_self_profile("jane").await.unwrap().unwrap();
        assert!((profile.last_alignment_score - 0.8).abs() < f64::EPSILON);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_self_profile_updates_are_not_lost() {
        let (_, store) = store_with(MemoryPolicy::default());
        let store = Arc::new(store);
        let mut tasks = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .update_self_profile("jane", |current| {
                        let mut profile = current.unwrap_or(SelfProfile {
                            persona_id: "jane".into(),
                            traits: Default::default(),
                            last_alignment_score: 0.5,
                            working_self_state: String::new(),
                            evaluations: 0,
                            updated_at: None,
                        });
                        profile.evaluations += 1;
                        profile
                    })
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        let profile = store.load_self_profile("jane").await.unwrap().unwrap();
        assert_eq!(profile.evaluations, 50);
    }

    #[tokio::test]
    async fn stats_aggregate_across_personas() {
        let (_, store) = store_with(MemoryPolicy::default());
        store.write("jane", working("a")).await.unwrap();
        store.write("omar", working("b")).await.unwrap();
        store.write("omar", working("c")).await.unwrap();
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.personas, 2);
        assert_eq!(stats.working, 3);
        assert_eq!(stats.total_entries, 3);
        assert!(stats.total_bytes > 0);
    }
}
