//! Lenient decoding of persisted persona documents.
//!
//! A single malformed entry must not take the whole persona offline, so the
//! canon and working arrays are decoded entry by entry.  Entries that fail
//! are reported as [`MalformedEntry`] and left out of the decoded document.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::warn;

use crate::error::{MemoryError, MemoryResult};
use crate::schema::{
    ArchiveLedger, CanonEntry, ClientProfile, MemoryLayer, PersonaMemory, SelfProfile,
    WorkingEntry,
};

/// Distinct classes of corruption an entry can exhibit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CorruptionKind {
    MissingId,
    MissingContent,
    MissingTimestamp,
    InvalidShape,
}

impl CorruptionKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::MissingId => "missing-id",
            Self::MissingContent => "missing-content",
            Self::MissingTimestamp => "missing-timestamp",
            Self::InvalidShape => "invalid-shape",
        }
    }
}

#[derive(Debug, Clone)]
pub struct MalformedEntry {
    pub layer: MemoryLayer,
    pub index: usize,
    pub kind: CorruptionKind,
    /// The raw JSON of the entry, kept for the `.corrupt` sidecar.
    pub raw: String,
}

#[derive(Debug, Clone)]
pub struct DecodedDocument {
    pub memory: PersonaMemory,
    pub malformed: Vec<MalformedEntry>,
}

const CANON_REQUIRED: &[(&str, CorruptionKind)] = &[
    ("id", CorruptionKind::MissingId),
    ("content", CorruptionKind::MissingContent),
];

const WORKING_REQUIRED: &[(&str, CorruptionKind)] = &[
    ("id", CorruptionKind::MissingId),
    ("content", CorruptionKind::MissingContent),
    ("created_at", CorruptionKind::MissingTimestamp),
];

pub fn decode_document(persona_id: &str, raw: &str) -> MemoryResult<DecodedDocument> {
    let value: Value = serde_json::from_str(raw).map_err(|err| MemoryError::Corrupt {
        persona_id: persona_id.to_string(),
        detail: err.to_string(),
    })?;
    let Value::Object(mut object) = value else {
        return Err(MemoryError::Corrupt {
            persona_id: persona_id.to_string(),
            detail: "document root is not an object".to_string(),
        });
    };

    let mut malformed = Vec::new();
    let canon = decode_entries::<CanonEntry>(
        object.remove("canon"),
        MemoryLayer::Canon,
        CANON_REQUIRED,
        &mut malformed,
    );
    let working = decode_entries::<WorkingEntry>(
        object.remove("working"),
        MemoryLayer::Working,
        WORKING_REQUIRED,
        &mut malformed,
    );

    let client_profiles: BTreeMap<String, ClientProfile> =
        lenient_field(&mut object, "client_profiles", persona_id);
    let session_history = lenient_field(&mut object, "session_history", persona_id);
    let self_profile: Option<SelfProfile> = lenient_field(&mut object, "self_profile", persona_id);
    let archive: ArchiveLedger = lenient_field(&mut object, "archive", persona_id);

    if !malformed.is_empty() {
        warn!(
            persona_id,
            malformed = malformed.len(),
            "memory document loaded with skipped malformed entries"
        );
    }

    Ok(DecodedDocument {
        memory: PersonaMemory {
            persona_id: persona_id.to_string(),
            canon,
            client_profiles,
            working,
            session_history,
            self_profile,
            archive,
        },
        malformed,
    })
}

fn decode_entries<T: DeserializeOwned>(
    value: Option<Value>,
    layer: MemoryLayer,
    required: &[(&str, CorruptionKind)],
    malformed: &mut Vec<MalformedEntry>,
) -> Vec<T> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };

    let mut decoded = Vec::with_capacity(items.len());
    for (index, item) in items.into_iter().enumerate() {
        let missing = required.iter().find(|(field, _)| {
            item.get(*field)
                .is_none_or(|v| v.is_null() || v.as_str().is_some_and(|s| s.trim().is_empty()))
        });
        if let Some((_, kind)) = missing {
            malformed.push(MalformedEntry {
                layer,
                index,
                kind: *kind,
                raw: item.to_string(),
            });
            continue;
        }
        let raw = item.to_string();
        match serde_json::from_value::<T>(item) {
            Ok(entry) => decoded.push(entry),
            Err(_) => malformed.push(MalformedEntry {
                layer,
                index,
                kind: CorruptionKind::InvalidShape,
                raw,
            }),
        }
    }
    decoded
}

fn lenient_field<T: DeserializeOwned + Default>(
    object: &mut serde_json::Map<String, Value>,
    key: &str,
    persona_id: &str,
) -> T {
    match object.remove(key) {
        None | Some(Value::Null) => T::default(),
        Some(value) => serde_json::from_value(value).unwrap_or_else(|err| {
            warn!(persona_id, field = key, error = %err, "discarding unreadable memory field");
            T::default()
        }),
    }
}
