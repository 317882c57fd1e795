use std::collections::{BTreeMap, BTreeSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use persona_core::TraitValue;

/// Memory layers from most protected to most volatile.
///
/// | Layer            | Purpose                                                  |
/// |------------------|----------------------------------------------------------|
/// | `CoreBiography`  | Authored persona biography, read-only at runtime         |
/// | `Canon`          | Curated long-term facts, archived but never deleted      |
/// | `ClientProfile`  | Per-client key/value facts, upserted on extraction       |
/// | `Working`        | Ephemeral importance-weighted notes subject to decay     |
/// | `SessionHistory` | Bounded rolling list of the most recent turns            |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryLayer {
    CoreBiography,
    Canon,
    ClientProfile,
    Working,
    SessionHistory,
}

impl MemoryLayer {
    pub fn label(self) -> &'static str {
        match self {
            Self::CoreBiography => "CoreBiography",
            Self::Canon => "Canon",
            Self::ClientProfile => "ClientProfile",
            Self::Working => "Working",
            Self::SessionHistory => "SessionHistory",
        }
    }

    /// Kebab-case slug used in log lines.
    pub fn slug(self) -> &'static str {
        match self {
            Self::CoreBiography => "core-biography",
            Self::Canon => "canon",
            Self::ClientProfile => "client-profile",
            Self::Working => "working",
            Self::SessionHistory => "session-history",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonEntry {
    pub id: Uuid,
    pub content: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default = "default_relevance")]
    pub relevance_score: f64,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub last_used: DateTime<Utc>,
    #[serde(default)]
    pub content_hash: String,
}

fn default_category() -> String {
    "general".to_string()
}

fn default_relevance() -> f64 {
    1.0
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientProfile {
    pub client_id: String,
    #[serde(default)]
    pub facts: BTreeMap<String, String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingEntry {
    pub id: Uuid,
    /// `None` means visible to every client of the persona.
    #[serde(default)]
    pub client_id: Option<String>,
    pub content: String,
    #[serde(default = "default_importance")]
    pub importance: f64,
    #[serde(default = "default_importance")]
    pub decay_score: f64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub content_hash: String,
}

fn default_importance() -> f64 {
    0.5
}

impl WorkingEntry {
    pub fn visible_to(&self, client_id: &str) -> bool {
        self.client_id.as_deref().is_none_or(|owner| owner == client_id)
    }
}

/// One completed exchange in a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub user: String,
    pub assistant: String,
    #[serde(default)]
    pub provider: String,
    pub timestamp: DateTime<Utc>,
}

impl TurnRecord {
    pub fn as_context_line(&self) -> String {
        format!("User: {} | Persona: {}", self.user, self.assistant)
    }
}

/// Persisted self-assessment of a persona.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelfProfile {
    pub persona_id: String,
    #[serde(default)]
    pub traits: BTreeMap<String, TraitValue>,
    #[serde(default = "default_importance")]
    pub last_alignment_score: f64,
    #[serde(default)]
    pub working_self_state: String,
    #[serde(default)]
    pub evaluations: u64,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Running record of archival passes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchiveLedger {
    pub total_archived: u64,
    pub last_batch: usize,
    pub last_archived_at: Option<DateTime<Utc>>,
}

/// Everything stored for one persona: the unit of persistence and of the
/// `max_memory_file_size` invariant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersonaMemory {
    pub persona_id: String,
    #[serde(default)]
    pub canon: Vec<CanonEntry>,
    #[serde(default)]
    pub client_profiles: BTreeMap<String, ClientProfile>,
    #[serde(default)]
    pub working: Vec<WorkingEntry>,
    /// Keyed by client id; one live session per (persona, client).
    #[serde(default)]
    pub session_history: BTreeMap<String, VecDeque<TurnRecord>>,
    #[serde(default)]
    pub self_profile: Option<SelfProfile>,
    #[serde(default)]
    pub archive: ArchiveLedger,
}

impl PersonaMemory {
    pub fn new(persona_id: impl Into<String>) -> Self {
        Self {
            persona_id: persona_id.into(),
            ..Default::default()
        }
    }

    pub fn entry_count(&self) -> usize {
        self.canon.len()
            + self.working.len()
            + self
                .client_profiles
                .values()
                .map(|profile| profile.facts.len())
                .sum::<usize>()
            + self.session_history.values().map(VecDeque::len).sum::<usize>()
    }

    pub fn serialized_len(&self) -> usize {
        serde_json::to_vec(self).map(|bytes| bytes.len()).unwrap_or(0)
    }
}

/// Hex SHA-256 of the content bytes; equal hashes mean an exact textual
/// duplicate.
pub fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Truncate `s` to at most `max_chars` Unicode scalar values.
pub fn truncate_str(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}
