use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use persona_config::CascadeConfig;

use crate::backend::{BackendReply, EchoBackend, GenerationBackend};

const OPENROUTER_ENDPOINT: &str = "https://openrouter.ai/api/v1/chat/completions";

#[derive(Debug, Clone)]
pub struct OllamaBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OllamaBackend {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            model: model.into(),
        }
    }

    async fn generate(&self, prompt: &str) -> Result<String> {
        let endpoint = format!("{}/api/generate", self.base_url.trim_end_matches('/'));
        let payload = json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false
        });

        let response = self
            .client
            .post(&endpoint)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("ollama unreachable at {}", self.base_url))?;

        let status = response.status();
        let body: serde_json::Value = response.json().await.context("ollama returned a non-JSON body")?;
        if !status.is_success() {
            bail!("ollama error ({status}): {body}");
        }

        match body.get("response").and_then(|value| value.as_str()) {
            Some(content) if !content.trim().is_empty() => Ok(content.to_string()),
            _ => bail!("ollama response missing text"),
        }
    }
}

#[async_trait]
impl GenerationBackend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn ask(&self, prompt: &str, _client_id: &str, _persona_id: &str) -> BackendReply {
        let started = Instant::now();
        match self.generate(prompt).await {
            Ok(text) => BackendReply::ok(text, started.elapsed()),
            Err(err) => BackendReply::failed(format!("{err:#}"), started.elapsed()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OpenRouterBackend {
    client: reqwest::Client,
    model: String,
}

impl OpenRouterBackend {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            model: model.into(),
        }
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        // Read per call so a rotated key takes effect without a restart.
        let api_key = std::env::var("OPENROUTER_API_KEY").unwrap_or_default();
        if api_key.trim().is_empty() {
            bail!("OPENROUTER_API_KEY is not set");
        }

        let payload = json!({
            "model": self.model,
            "messages": [
                {"role": "user", "content": prompt}
            ]
        });

        let response = self
            .client
            .post(OPENROUTER_ENDPOINT)
            .bearer_auth(api_key.trim())
            .header("HTTP-Referer", "https://persona.local")
            .header("X-Title", "Persona")
            .json(&payload)
            .send()
            .await
            .context("openrouter unreachable")?;

        let status = response.status();
        let body: serde_json::Value = response
            .json()
            .await
            .context("openrouter returned a non-JSON body")?;
        if !status.is_success() {
            bail!("openrouter error ({status}): {body}");
        }

        body.get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(|content| content.as_str())
            .filter(|content| !content.trim().is_empty())
            .map(ToString::to_string)
            .context("openrouter response missing content")
    }
}

#[async_trait]
impl GenerationBackend for OpenRouterBackend {
    fn name(&self) -> &str {
        "openrouter"
    }

    async fn ask(&self, prompt: &str, _client_id: &str, _persona_id: &str) -> BackendReply {
        let started = Instant::now();
        match self.complete(prompt).await {
            Ok(text) => BackendReply::ok(text, started.elapsed()),
            Err(err) => BackendReply::failed(format!("{err:#}"), started.elapsed()),
        }
    }
}

/// Construct the backend registered under `name`, or `None` for an unknown name.
pub fn build_backend(name: &str, config: &CascadeConfig) -> Option<Arc<dyn GenerationBackend>> {
    let backend: Arc<dyn GenerationBackend> = match name.trim().to_ascii_lowercase().as_str() {
        "ollama" => Arc::new(OllamaBackend::new(
            config.ollama_base_url.clone(),
            config.ollama_model.clone(),
        )),
        "openrouter" => Arc::new(OpenRouterBackend::new(config.openrouter_model.clone())),
        "echo" => Arc::new(EchoBackend),
        _ => return None,
    };
    debug!(provider = backend.name(), "generation backend constructed");
    Some(backend)
}

/// Backends for every configured provider, in priority order.  Unknown names
/// are skipped; [`CascadeConfig`] validation normally rejects them earlier.
pub fn build_backends(config: &CascadeConfig) -> Vec<Arc<dyn GenerationBackend>> {
    config
        .providers
        .iter()
        .filter_map(|name| build_backend(name, config))
        .collect()
}
