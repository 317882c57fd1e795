//! Per-turn client fact extraction.
//!
//! Two sources feed the ClientProfile: conversational phrases ("my name is
//! Sam") found in any message, and explicit `key: value` pairs in a message
//! carrying the `#client_fact` marker.

const MAX_VALUE_CHARS: usize = 80;

/// `(fact name, lowercase trigger phrase, first word only)`.
const PHRASES: &[(&str, &str, bool)] = &[
    ("name", "my name is ", true),
    ("preference", "i prefer ", false),
    ("current_project", "i'm working on ", false),
    ("current_project", "i am working on ", false),
    ("tooling", "i use ", false),
    ("goal", "my goal is ", false),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientFact {
    pub name: String,
    pub value: String,
}

impl ClientFact {
    fn new(name: &str, value: String) -> Self {
        Self {
            name: name.to_string(),
            value,
        }
    }
}

/// Facts stated in passing.  The first match per fact name wins.
pub fn extract_phrase_facts(message: &str) -> Vec<ClientFact> {
    let lower = message.to_lowercase();
    let mut facts: Vec<ClientFact> = Vec::new();

    for (name, trigger, single_word) in PHRASES {
        if facts.iter().any(|fact| fact.name == *name) {
            continue;
        }
        let Some(pos) = lower.find(trigger) else {
            continue;
        };
        // Lowercasing can shift byte offsets for some scripts.
        let Some(rest) = message.get(pos + trigger.len()..) else {
            continue;
        };
        let value = if *single_word { first_word(rest) } else { phrase(rest) };
        if !value.is_empty() && value.chars().count() <= MAX_VALUE_CHARS {
            facts.push(ClientFact::new(name, value));
        }
    }
    facts
}

/// `key: value` pairs separated by `;` or newlines.  Keys are normalised to
/// snake_case.
pub fn extract_explicit_facts(content: &str) -> Vec<ClientFact> {
    content
        .split(['\n', ';'])
        .filter_map(|part| {
            let (key, value) = part.split_once(':')?;
            let key = key
                .trim()
                .to_lowercase()
                .split_whitespace()
                .collect::<Vec<_>>()
                .join("_");
            let value = value.trim().trim_end_matches(['.', '!']).trim().to_string();
            if key.is_empty() || value.is_empty() || value.chars().count() > MAX_VALUE_CHARS {
                return None;
            }
            Some(ClientFact { name: key, value })
        })
        .collect()
}

/// All facts for a `#client_fact` message: explicit pairs first, then
/// phrases, and the whole text as a `note` when neither matched.
pub fn extract_marked_facts(content: &str) -> Vec<ClientFact> {
    let mut facts = extract_explicit_facts(content);
    for fact in extract_phrase_facts(content) {
        if !facts.iter().any(|f| f.name == fact.name) {
            facts.push(fact);
        }
    }
    if facts.is_empty() && !content.trim().is_empty() {
        facts.push(ClientFact::new("note", content.trim().to_string()));
    }
    facts
}

fn phrase(text: &str) -> String {
    let end = text.find(['.', '!', '?', '\n', ';', ',']).unwrap_or(text.len());
    text[..end].trim().to_string()
}

fn first_word(text: &str) -> String {
    text.split_whitespace()
        .next()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .unwrap_or_default()
}
