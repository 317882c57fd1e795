use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::debug;

use persona_core::TraitValue;
use persona_memory::{MemoryResult, MemoryStore, SelfProfile};

use crate::alignment::{NEUTRAL_SCORE, evaluate_alignment};

const DEFAULT_TRAIT_WEIGHT: f64 = 0.5;
const CONFIDENCE_TRAIT: &str = "confidence";
/// Weight of the newest score when the confidence dial follows alignment.
const CONFIDENCE_ALPHA: f64 = 0.2;

/// Self-description injected into the next prompt.
#[derive(Debug, Clone, Serialize)]
pub struct SelfStateBlob {
    pub confidence: f64,
    pub alignment_score: f64,
    pub working_state: String,
    pub self_awareness_text: String,
}

/// Alignment band phrasing, highest first.
pub fn alignment_band(score: f64) -> &'static str {
    if score > 0.8 {
        "confident and aligned with my character"
    } else if score >= 0.6 {
        "mostly aligned, with small drifts from my usual voice"
    } else if score >= 0.4 {
        "working to stay consistent with who I am"
    } else {
        "having difficulty maintaining consistency with my character"
    }
}

/// Scores turns against persona traits and keeps the per-persona
/// [`SelfProfile`] in the memory store.
pub struct SelfModel {
    store: Arc<MemoryStore>,
}

impl SelfModel {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self { store }
    }

    /// Alignment of `transcript` with the catalog traits of `persona_id`.
    pub fn evaluate(&self, persona_id: &str, transcript: &str) -> f64 {
        let descriptor = self.store.catalog().get_or_placeholder(persona_id);
        evaluate_alignment(transcript, &descriptor.traits)
    }

    fn fresh_profile(&self, persona_id: &str) -> SelfProfile {
        let descriptor = self.store.catalog().get_or_placeholder(persona_id);
        let mut traits = descriptor
            .traits
            .keys()
            .map(|name| (name.clone(), TraitValue::Dial(DEFAULT_TRAIT_WEIGHT)))
            .collect::<BTreeMap<_, _>>();
        traits
            .entry(CONFIDENCE_TRAIT.to_string())
            .or_insert(TraitValue::Dial(DEFAULT_TRAIT_WEIGHT));
        SelfProfile {
            persona_id: persona_id.to_string(),
            traits,
            last_alignment_score: NEUTRAL_SCORE,
            working_self_state: String::new(),
            evaluations: 0,
            updated_at: None,
        }
    }

    /// Record a scored turn, creating the profile on first use.  The fold
    /// runs under the store's persona lock so concurrent turns all count.
    pub async fn update_profile(&self, persona_id: &str, score: f64, notes: &str) -> MemoryResult<SelfProfile> {
        let score = score.clamp(0.0, 1.0);
        let fresh = self.fresh_profile(persona_id);
        let notes = notes.trim().to_string();
        let profile = self
            .store
            .update_self_profile(persona_id, move |current| {
                fold_score(current.unwrap_or(fresh), score, notes)
            })
            .await?;
        debug!(persona_id, score, evaluations = profile.evaluations, "self profile updated");
        Ok(profile)
    }

    pub async fn export_state_blob(&self, persona_id: &str) -> MemoryResult<SelfStateBlob> {
        let profile = self.store.load_self_profile(persona_id).await?;
        let (score, confidence, working_state) = match profile {
            Some(profile) => {
                let confidence = match profile.traits.get(CONFIDENCE_TRAIT) {
                    Some(TraitValue::Dial(level)) => *level,
                    _ => DEFAULT_TRAIT_WEIGHT,
                };
                (profile.last_alignment_score, confidence, profile.working_self_state)
            }
            None => (NEUTRAL_SCORE, DEFAULT_TRAIT_WEIGHT, String::new()),
        };

        let name = self.store.catalog().get_or_placeholder(persona_id).display_name().to_string();
        let mut text = format!("As {name}, I am currently {}.", alignment_band(score));
        if !working_state.is_empty() && working_state != alignment_band(score) {
            text.push_str(&format!(" Recent note: {working_state}."));
        }

        Ok(SelfStateBlob {
            confidence,
            alignment_score: score,
            working_state,
            self_awareness_text: text,
        })
    }
}

fn fold_score(mut profile: SelfProfile, score: f64, notes: String) -> SelfProfile {
    let confidence = match profile.traits.get(CONFIDENCE_TRAIT) {
        Some(TraitValue::Dial(level)) => *level,
        _ => DEFAULT_TRAIT_WEIGHT,
    };
    let confidence = (CONFIDENCE_ALPHA * score + (1.0 - CONFIDENCE_ALPHA) * confidence).clamp(0.0, 1.0);
    profile
        .traits
        .insert(CONFIDENCE_TRAIT.to_string(), TraitValue::Dial(confidence));

    profile.last_alignment_score = score;
    profile.evaluations += 1;
    profile.working_self_state = if notes.is_empty() {
        alignment_band(score).to_string()
    } else {
        notes
    };
    profile.updated_at = Some(Utc::now());
    profile
}

#[cfg(test)]
mod tests {
    use super::*;
    use persona_core::{PersonaCatalog, PersonaDescriptor};
    use persona_memory::{InMemoryBackend, MemoryPolicy};

    fn model() -> SelfModel {
        let mut traits = BTreeMap::new();
        traits.insert("warmth".to_string(), TraitValue::Keywords(vec!["warm".into(), "kind".into()]));
        let catalog = PersonaCatalog::from_descriptors([PersonaDescriptor {
            id: "jane".into(),
            name: "Jane".into(),
            traits,
            ..Default::default()
        }]);
        let store = MemoryStore::new(Arc::new(InMemoryBackend::new()), MemoryPolicy::default())
            .with_catalog(Arc::new(catalog));
        SelfModel::new(Arc::new(store))
    }

    #[test]
    fn evaluate_uses_catalog_traits() {
        let model = model();
        assert!(model.evaluate("jane", "a warm and kind answer") > 0.9);
        assert_eq!(model.evaluate("unknown", "anything"), NEUTRAL_SCORE);
    }

    #[tokio::test]
    async fn first_update_creates_profile_with_default_weights() {
        let model = model();
        let profile = model.update_profile("jane", 0.9, "").await.unwrap();
        assert_eq!(profile.evaluations, 1);
        assert!(matches!(profile.traits.get("warmth"), Some(TraitValue::Dial(w)) if *w == 0.5));
        assert_eq!(profile.working_self_state, alignment_band(0.9));

        let again = model.update_profile("jane", 0.3, "tired").await.unwrap();
        assert_eq!(again.evaluations, 2);
        assert_eq!(again.working_self_state, "tired");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_updates_each_count() {
        let model = Arc::new(model());
        let mut tasks = Vec::new();
        for _ in 0..50 {
            let model = model.clone();
            tasks.push(tokio::spawn(async move { model.update_profile("jane", 0.9, "").await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        let profile = model.store.load_self_profile("jane").await.unwrap().unwrap();
        assert_eq!(profile.evaluations, 50);
        // Fifty EMA steps toward 0.9 from 0.5 land within rounding of 0.9.
        assert!(matches!(profile.traits.get("confidence"), Some(TraitValue::Dial(c)) if *c > 0.89));
    }

    #[tokio::test]
    async fn state_blob_bands_by_score() {
        let model = model();
        let neutral = model.export_state_blob("jane").await.unwrap();
        assert_eq!(neutral.alignment_score, 0.5);
        assert!(neutral.self_awareness_text.contains("working to stay consistent"));

        model.update_profile("jane", 0.95, "").await.unwrap();
        let high = model.export_state_blob("jane").await.unwrap();
        assert!(high.self_awareness_text.starts_with("As Jane, I am currently confident and aligned"));
        assert!(high.confidence > 0.5);

        model.update_profile("jane", 0.1, "").await.unwrap();
        let low = model.export_state_blob("jane").await.unwrap();
        assert!(low.self_awareness_text.contains("difficulty maintaining consistency"));
    }
}
