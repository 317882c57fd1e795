use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use persona_core::CoreError;

/// Backend names the cascade knows how to build.
pub const KNOWN_PROVIDERS: &[&str] = &["ollama", "openrouter", "echo"];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("{0}")]
    Invalid(String),
}

impl From<ConfigError> for CoreError {
    fn from(err: ConfigError) -> Self {
        CoreError::ConfigInvalid(err.to_string())
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;

// ── Sections ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonaConfig {
    /// Persona used when a caller does not name one.
    pub default_persona: String,
    /// Directory of `*.json` persona descriptors.
    pub personas_dir: String,
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            default_persona: "default".to_string(),
            personas_dir: ".persona/personas".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeConfig {
    /// Backends in priority order.  Overridden by `PERSONA_PROVIDERS`.
    pub providers: Vec<String>,
    pub provider_timeout_secs: u64,
    pub max_concurrent_requests: usize,
    /// Consecutive failures that open a backend's circuit.
    pub circuit_breaker_threshold: u32,
    /// Seconds an open circuit stays open before a half-open trial call.
    pub circuit_breaker_timeout_secs: u64,
    /// Delays (ms) slept after the 1st, 2nd, … failure of a single dispatch
    /// before moving on to the next backend.  Empty disables retry delays.
    pub retry_schedule_ms: Vec<u64>,
    /// Token budget for the compressed context handed to fallback backends.
    pub handoff_max_tokens: usize,
    pub ollama_model: String,
    /// Base URL for the Ollama API.  Overridden at runtime by the
    /// `OLLAMA_BASE_URL` environment variable when set.
    pub ollama_base_url: String,
    pub openrouter_model: String,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            providers: vec!["ollama".to_string(), "openrouter".to_string()],
            provider_timeout_secs: 30,
            max_concurrent_requests: 8,
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout_secs: 300,
            retry_schedule_ms: vec![],
            handoff_max_tokens: 500,
            ollama_model: "llama3.1:8b".to_string(),
            ollama_base_url: "http://localhost:11434".to_string(),
            openrouter_model: "openai/gpt-4o-mini".to_string(),
        }
    }
}

impl CascadeConfig {
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    pub fn circuit_breaker_timeout(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker_timeout_secs)
    }

    pub fn retry_schedule(&self) -> Vec<Duration> {
        self.retry_schedule_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Directory holding one JSON document per persona.
    pub data_dir: String,
    /// Hard ceiling (bytes) on a persona's serialized memory document.
    pub max_memory_file_size: u64,
    /// Crossing this size (bytes) triggers the archival protocol.
    pub archive_threshold: u64,
    /// Working-memory entries kept by an archival pass.
    pub archive_keep_recent: usize,
    /// Turns kept per session history before the oldest is evicted.
    pub session_history_limit: usize,
    pub working_memory_ttl_hours: u64,
    pub decay_half_life_hours: u64,
    /// Working entries whose decay score falls below this are archived.
    pub decay_prune_threshold: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            data_dir: ".persona/memory".to_string(),
            max_memory_file_size: 10 * 1024 * 1024,
            archive_threshold: 8 * 1024 * 1024,
            archive_keep_recent: 50,
            session_history_limit: 20,
            working_memory_ttl_hours: 72,
            decay_half_life_hours: 24,
            decay_prune_threshold: 0.05,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Handoff success rate below which a warning is logged.
    pub context_quality_threshold: f64,
    /// Smoothing factor of the handoff success EMA.
    pub ema_alpha: f64,
    pub cleanup_interval_minutes: u64,
    /// Entry count at which memory count health turns yellow.
    pub memory_count_warning: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            context_quality_threshold: 0.95,
            ema_alpha: 0.1,
            cleanup_interval_minutes: 10,
            memory_count_warning: 1000,
        }
    }
}

impl HealthConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_minutes * 60)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle minutes after which a session expires (`max_session_age`).
    pub session_ttl_minutes: u64,
    /// Turn summaries kept in a session's rolling summary.
    pub rolling_summary_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_ttl_minutes: 30,
            rolling_summary_limit: 10,
        }
    }
}

impl SessionConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_minutes * 60)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
    /// When non-empty, logs are also written to a daily rolling file here.
    pub log_dir: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub persona: PersonaConfig,
    pub cascade: CascadeConfig,
    pub memory: MemoryConfig,
    pub health: HealthConfig,
    pub session: SessionConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    /// Load, apply environment overrides, and validate.  A missing file
    /// yields defaults; a malformed or invalid one is an error.
    pub fn load_from(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let mut config = Self::default();
        if path.exists() {
            let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("PERSONA_PROVIDERS") {
            let providers = value
                .split(',')
                .map(|name| name.trim().to_lowercase())
                .filter(|name| !name.is_empty())
                .collect::<Vec<_>>();
            if !providers.is_empty() {
                config.cascade.providers = providers;
            }
        }

        if let Ok(value) = env::var("OLLAMA_BASE_URL") {
            if !value.is_empty() {
                config.cascade.ollama_base_url = value;
            }
        }

        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> ConfigResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let cascade = &self.cascade;
        if cascade.providers.is_empty() {
            return Err(ConfigError::Invalid(
                "cascade.providers must name at least one backend".to_string(),
            ));
        }
        for name in &cascade.providers {
            if !KNOWN_PROVIDERS.contains(&name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "unknown provider '{name}' (known: {})",
                    KNOWN_PROVIDERS.join(", ")
                )));
            }
        }
        if cascade.provider_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "cascade.provider_timeout_secs must be > 0".to_string(),
            ));
        }
        if cascade.max_concurrent_requests == 0 {
            return Err(ConfigError::Invalid(
                "cascade.max_concurrent_requests must be > 0".to_string(),
            ));
        }
        if cascade.circuit_breaker_threshold == 0 {
            return Err(ConfigError::Invalid(
                "cascade.circuit_breaker_threshold must be > 0".to_string(),
            ));
        }

        let memory = &self.memory;
        if memory.archive_threshold > memory.max_memory_file_size {
            return Err(ConfigError::Invalid(format!(
                "memory.archive_threshold ({}) exceeds memory.max_memory_file_size ({})",
                memory.archive_threshold, memory.max_memory_file_size
            )));
        }
        if memory.decay_half_life_hours == 0 {
            return Err(ConfigError::Invalid(
                "memory.decay_half_life_hours must be > 0".to_string(),
            ));
        }

        let health = &self.health;
        if !(0.0..=1.0).contains(&health.context_quality_threshold) {
            return Err(ConfigError::Invalid(
                "health.context_quality_threshold must be within [0, 1]".to_string(),
            ));
        }
        if !(health.ema_alpha > 0.0 && health.ema_alpha <= 1.0) {
            return Err(ConfigError::Invalid(
                "health.ema_alpha must be within (0, 1]".to_string(),
            ));
        }
        if health.cleanup_interval_minutes == 0 {
            return Err(ConfigError::Invalid(
                "health.cleanup_interval_minutes must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

// ── Hot reload ───────────────────────────────────────────────────────────────

/// Shared, swappable configuration.
///
/// Readers take an `Arc` snapshot, so a reload never changes the config an
/// in-flight request is already using.  A reload that fails to parse or
/// validate leaves the last-known-good config in place.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    current: Arc<RwLock<Arc<AppConfig>>>,
}

impl ConfigHandle {
    pub fn new(config: AppConfig) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    pub fn snapshot(&self) -> Arc<AppConfig> {
        self.current.read().clone()
    }

    /// Re-read `path`.  Returns `Ok(true)` when the new config was applied.
    pub fn reload(&self, path: impl AsRef<Path>) -> ConfigResult<bool> {
        let path = path.as_ref();
        match AppConfig::load_from(path) {
            Ok(config) => {
                *self.current.write() = Arc::new(config);
                info!(path = %path.display(), "configuration reloaded");
                Ok(true)
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "config reload rejected, keeping last-known-good");
                Err(err)
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_documented_constants() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.cascade.providers, vec!["ollama", "openrouter"]);
        assert_eq!(cfg.cascade.provider_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.cascade.circuit_breaker_threshold, 5);
        assert_eq!(cfg.cascade.circuit_breaker_timeout(), Duration::from_secs(300));
        assert!(cfg.cascade.retry_schedule().is_empty());
        assert_eq!(cfg.memory.archive_keep_recent, 50);
        assert!((cfg.health.ema_alpha - 0.1).abs() < f64::EPSILON);
        assert!((cfg.health.context_quality_threshold - 0.95).abs() < f64::EPSILON);
        assert_eq!(cfg.session.session_ttl(), Duration::from_secs(30 * 60));
        assert_eq!(cfg.health.cleanup_interval(), Duration::from_secs(10 * 60));
        assert_eq!(cfg.telemetry.log_level, "info");
        cfg.validate().unwrap();
    }

    #[test]
    fn load_from_missing_file_returns_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = AppConfig::load_from(dir.path().join("nonexistent.toml")).unwrap();
        assert_eq!(cfg.persona.default_persona, "default");
        assert_eq!(cfg.cascade.max_concurrent_requests, 8);
    }

    #[test]
    fn load_from_partial_toml_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.toml");
        fs::write(
            &path,
            r#"
[cascade]
circuit_breaker_threshold = 3
retry_schedule_ms = [1000, 2000, 4000]

[session]
session_ttl_minutes = 5
"#,
        )
        .unwrap();

        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.cascade.circuit_breaker_threshold, 3);
        assert_eq!(
            cfg.cascade.retry_schedule(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
        assert_eq!(cfg.session.session_ttl_minutes, 5);
        assert_eq!(cfg.memory.archive_keep_recent, 50);
    }

    #[test]
    fn load_from_invalid_toml_returns_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "this is not valid toml {{{{").unwrap();
        let err = AppConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
        assert!(matches!(CoreError::from(err), CoreError::ConfigInvalid(_)));
    }

    #[test]
    fn validate_rejects_unknown_provider() {
        let mut cfg = AppConfig::default();
        cfg.cascade.providers = vec!["ollama".into(), "mystery".into()];
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("mystery"));
    }

    #[test]
    fn validate_rejects_empty_providers_and_zero_threshold() {
        let mut cfg = AppConfig::default();
        cfg.cascade.providers.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.cascade.circuit_breaker_threshold = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_archive_threshold_above_max_size() {
        let mut cfg = AppConfig::default();
        cfg.memory.archive_threshold = cfg.memory.max_memory_file_size + 1;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_health_values() {
        let mut cfg = AppConfig::default();
        cfg.health.ema_alpha = 0.0;
        assert!(cfg.validate().is_err());

        let mut cfg = AppConfig::default();
        cfg.health.context_quality_threshold = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn save_and_reload_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub/config.toml");

        let mut cfg = AppConfig::default();
        cfg.persona.default_persona = "jane".to_string();
        cfg.cascade.openrouter_model = "anthropic/claude-3.5-sonnet".to_string();
        cfg.memory.archive_keep_recent = 25;

        cfg.save_to(&path).unwrap();
        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.persona.default_persona, "jane");
        assert_eq!(loaded.cascade.openrouter_model, "anthropic/claude-3.5-sonnet");
        assert_eq!(loaded.memory.archive_keep_recent, 25);
    }

    #[test]
    fn reload_keeps_last_known_good_on_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("live.toml");
        fs::write(&path, "[cascade]\ncircuit_breaker_threshold = 7\n").unwrap();

        let handle = ConfigHandle::new(AppConfig::load_from(&path).unwrap());
        let before = handle.snapshot();
        assert_eq!(before.cascade.circuit_breaker_threshold, 7);

        fs::write(&path, "[cascade]\ncircuit_breaker_threshold = 0\n").unwrap();
        assert!(handle.reload(&path).is_err());
        assert_eq!(handle.snapshot().cascade.circuit_breaker_threshold, 7);

        fs::write(&path, "[cascade]\ncircuit_breaker_threshold = 2\n").unwrap();
        assert!(handle.reload(&path).unwrap());
        assert_eq!(handle.snapshot().cascade.circuit_breaker_threshold, 2);
        // The earlier snapshot is unaffected by the swap.
        assert_eq!(before.cascade.circuit_breaker_threshold, 7);
    }

    #[test]
    fn env_providers_override_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("env.toml");
        fs::write(&path, "[cascade]\nproviders = [\"ollama\"]\n").unwrap();

        // SAFETY: test is single-threaded for this env var.
        unsafe { env::set_var("PERSONA_PROVIDERS", "openrouter, echo") };
        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.cascade.providers, vec!["openrouter", "echo"]);
        unsafe { env::remove_var("PERSONA_PROVIDERS") };
    }

    #[test]
    fn durations_serialize_as_plain_numbers() {
        let cfg = AppConfig::default();
        let json = serde_json::to_value(&cfg.cascade).unwrap();
        assert_eq!(json["provider_timeout_secs"], 30);
        assert_eq!(json["circuit_breaker_timeout_secs"], 300);
    }
}
