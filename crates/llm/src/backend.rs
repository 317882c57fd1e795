//! The capability every generation provider implements.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

/// Outcome of one backend call.  Failures are values, never panics or errors.
#[derive(Debug, Clone, Serialize)]
pub struct BackendReply {
    pub success: bool,
    pub response: String,
    pub latency: Duration,
    pub error: Option<String>,
}

impl BackendReply {
    pub fn ok(response: impl Into<String>, latency: Duration) -> Self {
        Self {
            success: true,
            response: response.into(),
            latency,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>, latency: Duration) -> Self {
        Self {
            success: false,
            response: String::new(),
            latency,
            error: Some(error.into()),
        }
    }
}

#[async_trait]
pub trait GenerationBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Generate a reply.  Implementations report transport and provider
    /// failures through [`BackendReply::failed`]; the caller imposes the
    /// timeout and may drop the future at any await point.
    async fn ask(&self, prompt: &str, client_id: &str, persona_id: &str) -> BackendReply;
}

/// Deterministic local backend.  Answers without network access, useful for
/// offline operation and smoke tests.
#[derive(Debug, Clone, Default)]
pub struct EchoBackend;

#[async_trait]
impl GenerationBackend for EchoBackend {
    fn name(&self) -> &str {
        "echo"
    }

    async fn ask(&self, prompt: &str, _client_id: &str, persona_id: &str) -> BackendReply {
        let message = prompt
            .lines()
            .rev()
            .find_map(|line| line.strip_prefix("User: "))
            .unwrap_or(prompt)
            .trim();
        BackendReply::ok(format!("[{persona_id}] {message}"), Duration::ZERO)
    }
}

/// Terminal responder used once every configured backend has failed or been
/// skipped.  It is synchronous and infallible.
#[derive(Debug, Clone, Default)]
pub struct TemplateFallback;

impl TemplateFallback {
    pub const NAME: &'static str = "fallback";

    pub fn respond(&self, persona_id: &str) -> String {
        format!(
            "I'm here, {persona_id} speaking. I'm having trouble reaching my usual resources right now, \
             so my answer may be brief. Could you give me a moment and try again, or rephrase what you need?"
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_answers_last_user_line() {
        let reply = EchoBackend.ask("System: be kind\nUser: hello there", "c1", "jane").await;
        assert!(reply.success);
        assert_eq!(reply.response, "[jane] hello there");
    }

    #[test]
    fn fallback_mentions_persona() {
        let text = TemplateFallback.respond("jane");
        assert!(text.contains("jane"));
        assert!(!text.is_empty());
    }
}
