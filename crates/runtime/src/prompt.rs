//! Prompt assembly for one persona turn.

use persona_core::PersonaDescriptor;
use persona_memory::{MemoryPayload, truncate_str};

const MAX_CANON_LINES: usize = 12;
const MAX_WORKING_LINES: usize = 8;
const MAX_HISTORY_TURNS: usize = 6;

pub struct PromptInputs<'a> {
    pub persona: &'a PersonaDescriptor,
    pub payload: &'a MemoryPayload,
    /// Self-description from the self model, if one is available.
    pub self_state: Option<&'a str>,
    pub message: &'a str,
}

/// The final line is always `User: <message>`.
pub fn build_turn_prompt(inputs: &PromptInputs<'_>) -> String {
    let persona = inputs.persona;
    let mut prompt = format!(
        "You are {name}, speaking in a {tone} tone. Stay in character and answer the LATEST user message.\n\n\
         BIOGRAPHY:\n{bio}",
        name = persona.display_name(),
        tone = persona.tone,
        bio = inputs.payload.core_biography,
    );

    if let Some(state) = inputs.self_state.filter(|s| !s.trim().is_empty()) {
        prompt.push_str(&format!("\n\nSELF-STATE:\n{state}"));
    }

    push_block(&mut prompt, "CANON", canon_lines(inputs.payload));
    push_block(&mut prompt, "CLIENT PROFILE", profile_lines(inputs.payload));
    push_block(&mut prompt, "WORKING MEMORY", working_lines(inputs.payload));
    push_block(&mut prompt, "RECENT CONVERSATION", history_lines(inputs.payload));

    prompt.push_str(&format!("\n\nUser: {}", inputs.message.trim()));
    prompt
}

fn push_block(prompt: &mut String, title: &str, lines: Vec<String>) {
    if lines.is_empty() {
        return;
    }
    prompt.push_str(&format!("\n\n{title}:\n{}", lines.join("\n")));
}

fn canon_lines(payload: &MemoryPayload) -> Vec<String> {
    let mut canon = payload.canon.iter().collect::<Vec<_>>();
    canon.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score).then(b.last_used.cmp(&a.last_used)));
    canon
        .into_iter()
        .take(MAX_CANON_LINES)
        .map(|entry| format!("- [{}] {}", entry.category, truncate_str(&entry.content, 240)))
        .collect()
}

fn profile_lines(payload: &MemoryPayload) -> Vec<String> {
    payload
        .client_profile
        .iter()
        .flat_map(|profile| profile.facts.iter())
        .map(|(name, value)| format!("- {name}: {value}"))
        .collect()
}

fn working_lines(payload: &MemoryPayload) -> Vec<String> {
    let mut working = payload.working_memory.iter().collect::<Vec<_>>();
    working.sort_by(|a, b| b.importance.total_cmp(&a.importance).then(b.created_at.cmp(&a.created_at)));
    working
        .into_iter()
        .take(MAX_WORKING_LINES)
        .map(|entry| format!("- {}", truncate_str(&entry.content, 200)))
        .collect()
}

fn history_lines(payload: &MemoryPayload) -> Vec<String> {
    let start = payload.session_history.len().saturating_sub(MAX_HISTORY_TURNS);
    payload.session_history[start..]
        .iter()
        .map(|turn| {
            format!(
                "Client said: {}\nYou replied: {}",
                truncate_str(&turn.user, 280),
                truncate_str(&turn.assistant, 360)
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use persona_memory::{ClientProfile, TurnRecord};

    #[test]
    fn empty_payload_renders_biography_and_message() {
        let persona = PersonaDescriptor::placeholder("jane");
        let payload = MemoryPayload::degraded(persona.core_biography());
        let prompt = build_turn_prompt(&PromptInputs {
            persona: &persona,
            payload: &payload,
            self_state: None,
            message: "  hello  ",
        });
        assert!(prompt.starts_with("You are jane"));
        assert!(prompt.contains("BIOGRAPHY:"));
        assert!(!prompt.contains("CANON:"));
        assert!(prompt.ends_with("\n\nUser: hello"));
    }

    #[test]
    fn renders_layers_in_order() {
        let persona = PersonaDescriptor::placeholder("jane");
        let mut payload = MemoryPayload::degraded("Jane bio".into());
        payload.degraded = false;
        payload.client_profile = Some(ClientProfile {
            client_id: "c1".into(),
            facts: [("name".to_string(), "Sam".to_string())].into_iter().collect(),
            updated_at: None,
        });
        payload.session_history.push(TurnRecord {
            user: "first question".into(),
            assistant: "first answer".into(),
            provider: "echo".into(),
            timestamp: Utc::now(),
        });
        let prompt = build_turn_prompt(&PromptInputs {
            persona: &persona,
            payload: &payload,
            self_state: Some("I am steady."),
            message: "next",
        });
        let self_at = prompt.find("SELF-STATE").unwrap();
        let profile_at = prompt.find("CLIENT PROFILE").unwrap();
        let history_at = prompt.find("RECENT CONVERSATION").unwrap();
        assert!(self_at < profile_at && profile_at < history_at);
        assert!(prompt.contains("- name: Sam"));
        assert_eq!(prompt.lines().last(), Some("User: next"));
    }
}
