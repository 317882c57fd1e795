//! Persona descriptors: the read-only record authored outside this system.
//!
//! Descriptors feed two consumers: the memory store renders the
//! CoreBiography layer from them, and the self model scores responses
//! against their `traits`.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};

/// A single declared trait.
///
/// Authored JSON uses plain values, so the representation is untagged:
/// `["warm", "patient"]` → `Keywords`, `"calm, precise"` → `Text`,
/// `0.7` → `Dial`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TraitValue {
    Keywords(Vec<String>),
    Dial(f64),
    Text(String),
}

impl TraitValue {
    /// Lower-cased keywords for textual traits; `None` for numeric dials.
    pub fn keywords(&self) -> Option<Vec<String>> {
        match self {
            Self::Keywords(words) => Some(
                words
                    .iter()
                    .map(|w| w.trim().to_lowercase())
                    .filter(|w| !w.is_empty())
                    .collect(),
            ),
            Self::Text(text) => Some(
                text.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
                    .map(|w| w.trim().to_lowercase())
                    .filter(|w| !w.is_empty())
                    .collect(),
            ),
            Self::Dial(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonaDescriptor {
    pub id: String,
    pub name: String,
    pub role: String,
    pub background: String,
    pub tone: String,
    pub traits: BTreeMap<String, TraitValue>,
    pub expertise_areas: Vec<String>,
}

impl Default for PersonaDescriptor {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            role: "assistant".to_string(),
            background: String::new(),
            tone: "neutral".to_string(),
            traits: BTreeMap::new(),
            expertise_areas: Vec::new(),
        }
    }
}

impl PersonaDescriptor {
    /// Minimal descriptor used when a request names a persona the catalog
    /// does not know.
    pub fn placeholder(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            ..Default::default()
        }
    }

    /// Render the CoreBiography layer.
    pub fn core_biography(&self) -> String {
        let mut lines = vec![format!("{} ({})", self.display_name(), self.role)];
        if !self.background.trim().is_empty() {
            lines.push(format!("Background: {}", self.background.trim()));
        }
        if !self.tone.trim().is_empty() {
            lines.push(format!("Tone: {}", self.tone.trim()));
        }
        if !self.expertise_areas.is_empty() {
            lines.push(format!("Expertise: {}", self.expertise_areas.join(", ")));
        }
        lines.join("\n")
    }

    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// In-process lookup of persona descriptors by id.
#[derive(Debug, Clone, Default)]
pub struct PersonaCatalog {
    personas: HashMap<String, PersonaDescriptor>,
}

impl PersonaCatalog {
    pub fn from_descriptors(descriptors: impl IntoIterator<Item = PersonaDescriptor>) -> Self {
        let personas = descriptors
            .into_iter()
            .map(|descriptor| (descriptor.id.clone(), descriptor))
            .collect();
        Self { personas }
    }

    /// Load every `*.json` file in `dir`.  A missing directory yields an empty
    /// catalog; unparseable files are skipped with a warning.
    pub fn load_dir(dir: impl AsRef<Path>) -> CoreResult<Self> {
        let dir = dir.as_ref();
        if !dir.exists() {
            return Ok(Self::default());
        }
        let entries = fs::read_dir(dir)
            .map_err(|err| CoreError::StorageUnavailable(format!("{}: {err}", dir.display())))?;

        let mut catalog = Self::default();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let parsed = fs::read_to_string(&path)
                .map_err(|err| err.to_string())
                .and_then(|raw| {
                    serde_json::from_str::<PersonaDescriptor>(&raw).map_err(|err| err.to_string())
                });
            match parsed {
                Ok(mut descriptor) => {
                    if descriptor.id.trim().is_empty() {
                        descriptor.id = path
                            .file_stem()
                            .map(|stem| stem.to_string_lossy().to_string())
                            .unwrap_or_default();
                    }
                    debug!(persona_id = %descriptor.id, path = %path.display(), "persona loaded");
                    catalog.insert(descriptor);
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable persona file");
                }
            }
        }
        Ok(catalog)
    }

    pub fn insert(&mut self, descriptor: PersonaDescriptor) {
        self.personas.insert(descriptor.id.clone(), descriptor);
    }

    pub fn get(&self, id: &str) -> Option<&PersonaDescriptor> {
        self.personas.get(id)
    }

    pub fn get_or_placeholder(&self, id: &str) -> PersonaDescriptor {
        self.get(id)
            .cloned()
            .unwrap_or_else(|| PersonaDescriptor::placeholder(id))
    }

    pub fn len(&self) -> usize {
        self.personas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.personas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn untagged_traits_parse_from_plain_json() {
        let raw = r#"{
            "id": "jane",
            "name": "Jane",
            "traits": {
                "empathy": ["caring", "supportive"],
                "style": "calm, precise",
                "confidence": 0.5
            }
        }"#;
        let persona: PersonaDescriptor = serde_json::from_str(raw).unwrap();
        assert_eq!(
            persona.traits["empathy"],
            TraitValue::Keywords(vec!["caring".into(), "supportive".into()])
        );
        assert_eq!(persona.traits["confidence"], TraitValue::Dial(0.5));
        assert_eq!(
            persona.traits["style"].keywords().unwrap(),
            vec!["calm".to_string(), "precise".to_string()]
        );
        // Optional fields default.
        assert_eq!(persona.role, "assistant");
        assert!(persona.expertise_areas.is_empty());
    }

    #[test]
    fn dial_has_no_keywords() {
        assert!(TraitValue::Dial(0.3).keywords().is_none());
    }

    #[test]
    fn core_biography_lists_available_fields() {
        let persona = PersonaDescriptor {
            id: "jane".into(),
            name: "Jane".into(),
            role: "project manager".into(),
            background: "Ran logistics for ten years.".into(),
            expertise_areas: vec!["scheduling".into(), "budgets".into()],
            ..Default::default()
        };
        let bio = persona.core_biography();
        assert!(bio.starts_with("Jane (project manager)"));
        assert!(bio.contains("Background: Ran logistics"));
        assert!(bio.contains("Expertise: scheduling, budgets"));
    }

    #[test]
    fn unknown_persona_gets_placeholder() {
        let catalog = PersonaCatalog::default();
        let persona = catalog.get_or_placeholder("ghost");
        assert_eq!(persona.id, "ghost");
        assert_eq!(persona.display_name(), "ghost");
    }

    #[test]
    fn load_dir_skips_malformed_files() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("jane.json"),
            r#"{"name": "Jane", "tone": "warm"}"#,
        )
        .unwrap();
        fs::write(dir.path().join("broken.json"), "{{ not json").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let catalog = PersonaCatalog::load_dir(dir.path()).unwrap();
        assert_eq!(catalog.len(), 1);
        // Id falls back to the file stem.
        assert_eq!(catalog.get("jane").unwrap().tone, "warm");
    }

    #[test]
    fn load_dir_missing_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        let catalog = PersonaCatalog::load_dir(dir.path().join("nope")).unwrap();
        assert!(catalog.is_empty());
    }
}
