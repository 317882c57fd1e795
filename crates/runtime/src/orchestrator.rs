//! Top-level entry point: one call per inbound message.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use persona_config::{AppConfig, ConfigHandle};
use persona_core::{CoreError, CoreResult, PersonaCatalog};
use persona_health::{HealthMonitor, HealthReport, HealthThresholds};
use persona_llm::{DispatchRequest, ProviderCascade};
use persona_memory::{
    FileBackend, MemoryBackend, MemoryLayer, MemoryPolicy, MemoryStore, MemoryWrite, TurnRecord,
    route_message, truncate_str,
};
use persona_self::{PlanOutcome, Reflection, Reflector, SelfModel};

use crate::facts::{extract_marked_facts, extract_phrase_facts};
use crate::prompt::{PromptInputs, build_turn_prompt};
use crate::session::{SessionKey, SessionRegistry};

const REFLECTION_IMPORTANCE: f64 = 0.4;
const TURN_IMPORTANCE: f64 = 0.5;

#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub session_id: Uuid,
    pub response: String,
    pub provider_used: String,
    pub latency_ms: u64,
    pub neural_context_used: bool,
    pub context_handoff_successful: bool,
    /// Layer the inbound message was routed to.
    pub routed_to: MemoryLayer,
    /// Memory could not be read or written for this turn.
    pub memory_degraded: bool,
}

pub struct SessionOrchestrator {
    config: ConfigHandle,
    store: Arc<MemoryStore>,
    cascade: Arc<ProviderCascade>,
    self_model: Arc<SelfModel>,
    reflector: Reflector,
    health: Arc<HealthMonitor>,
    sessions: SessionRegistry,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionOrchestrator {
    pub fn new(config: ConfigHandle, store: Arc<MemoryStore>, cascade: Arc<ProviderCascade>) -> Self {
        let snapshot = config.snapshot();
        let health = HealthMonitor::new(store.clone(), HealthThresholds::from_config(&snapshot))
            .with_cascade(cascade.clone());
        Self {
            self_model: Arc::new(SelfModel::new(store.clone())),
            reflector: Reflector,
            health: Arc::new(health),
            sessions: SessionRegistry::new(),
            background: Mutex::new(Vec::new()),
            config,
            store,
            cascade,
        }
    }

    /// Wire the file-backed store, persona catalog and configured providers.
    pub fn from_config(config: ConfigHandle) -> Result<Self> {
        let snapshot = config.snapshot();
        let catalog = load_catalog(Path::new(&snapshot.persona.personas_dir))?;
        let backend: Arc<dyn MemoryBackend> = Arc::new(FileBackend::new(&snapshot.memory.data_dir));
        let store = MemoryStore::new(backend, MemoryPolicy::from_config(&snapshot.memory))
            .with_catalog(Arc::new(catalog));
        let cascade = ProviderCascade::from_config(&snapshot.cascade);
        info!(
            providers = ?cascade.provider_names(),
            data_dir = %snapshot.memory.data_dir,
            "session orchestrator ready"
        );
        Ok(Self::new(config, Arc::new(store), Arc::new(cascade)))
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn cascade(&self) -> &Arc<ProviderCascade> {
        &self.cascade
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub async fn handle_message(&self, persona_id: &str, client_id: &str, message: &str) -> CoreResult<TurnOutcome> {
        let message = message.trim();
        if message.is_empty() {
            return Err(CoreError::Validation("message is required".to_string()));
        }
        let client_id = client_id.trim();
        if client_id.is_empty() {
            return Err(CoreError::Validation("client id is required".to_string()));
        }
        // A message made only of markers carries nothing to store or answer.
        let routed = route_message(message);
        if routed.content.trim().is_empty() {
            return Err(CoreError::Validation("message is required".to_string()));
        }
        let config = self.config.snapshot();
        let persona_id = match persona_id.trim() {
            "" => config.persona.default_persona.clone(),
            id => id.to_string(),
        };

        let key = SessionKey::new(&persona_id, client_id);
        let mut session = self.sessions.acquire(&key, Utc::now()).await;

        let payload = self.store.assemble_or_empty(&persona_id, client_id).await;
        let self_state = match self.self_model.export_state_blob(&persona_id).await {
            Ok(blob) => Some(blob.self_awareness_text),
            Err(err) => {
                debug!(persona_id = %persona_id, error = %err, "self state unavailable");
                None
            }
        };
        let descriptor = self.store.catalog().get_or_placeholder(&persona_id);
        let prompt = build_turn_prompt(&PromptInputs {
            persona: &descriptor,
            payload: &payload,
            self_state: self_state.as_deref(),
            message: &routed.content,
        });

        let result = self
            .cascade
            .dispatch(&DispatchRequest {
                prompt,
                persona_id: persona_id.clone(),
                client_id: client_id.to_string(),
                handoff_memories: payload.handoff_lines(),
            })
            .await;

        if result.neural_context_used {
            let ratio = result.handoff.as_ref().map(|h| h.ratio()).unwrap_or(1.0);
            self.health
                .monitor_context_quality(result.context_handoff_successful, ratio);
        }

        let now = Utc::now();
        let mut writes = Vec::new();
        match routed.layer {
            MemoryLayer::Canon => writes.push(MemoryWrite::Canon {
                content: routed.content.clone(),
                category: "general".to_string(),
                tags: routed
                    .markers
                    .iter()
                    .map(|m| m.trim_start_matches('#').to_lowercase())
                    .collect(),
            }),
            MemoryLayer::ClientProfile => {
                for fact in extract_marked_facts(&routed.content) {
                    writes.push(MemoryWrite::ClientFact {
                        client_id: client_id.to_string(),
                        name: fact.name,
                        value: fact.value,
                    });
                }
            }
            _ => writes.push(MemoryWrite::Working {
                client_id: Some(client_id.to_string()),
                content: routed.content.clone(),
                importance: TURN_IMPORTANCE,
            }),
        }
        if routed.layer != MemoryLayer::ClientProfile {
            for fact in extract_phrase_facts(&routed.content) {
                writes.push(MemoryWrite::ClientFact {
                    client_id: client_id.to_string(),
                    name: fact.name,
                    value: fact.value,
                });
            }
        }
        writes.push(MemoryWrite::Turn {
            client_id: client_id.to_string(),
            turn: TurnRecord {
                user: routed.content.clone(),
                assistant: result.response.clone(),
                provider: result.provider_used.clone(),
                timestamp: now,
            },
        });

        let mut memory_degraded = payload.degraded;
        for write in writes {
            if let Err(err) = self.store.write(&persona_id, write).await {
                warn!(persona_id = %persona_id, client_id, error = %err, "memory write failed, continuing");
                memory_degraded = true;
            }
        }
        let canon_ids = payload.canon.iter().map(|entry| entry.id).collect::<Vec<_>>();
        if let Err(err) = self.store.touch_canon(&persona_id, &canon_ids).await {
            debug!(persona_id = %persona_id, error = %err, "canon touch skipped");
        }

        session.record_turn(
            format!(
                "User: {} | Persona: {}",
                truncate_str(&routed.content, 120),
                truncate_str(&result.response, 160)
            ),
            result.used_fallback(),
            config.session.rolling_summary_limit,
            now,
        );
        let session_id = session.id;
        drop(session);

        self.spawn_scoring(persona_id.clone(), result.response.clone());

        info!(
            persona_id = %persona_id,
            client_id,
            provider = %result.provider_used,
            layer = routed.layer.slug(),
            latency_ms = result.latency.as_millis() as u64,
            "turn complete"
        );

        Ok(TurnOutcome {
            session_id,
            response: result.response,
            provider_used: result.provider_used,
            latency_ms: result.latency.as_millis() as u64,
            neural_context_used: result.neural_context_used,
            context_handoff_successful: result.context_handoff_successful,
            routed_to: routed.layer,
            memory_degraded,
        })
    }

    fn spawn_scoring(&self, persona_id: String, response: String) {
        let model = self.self_model.clone();
        let handle = tokio::spawn(async move {
            let score = model.evaluate(&persona_id, &response);
            if let Err(err) = model.update_profile(&persona_id, score, "").await {
                warn!(persona_id = %persona_id, error = %err, "alignment profile update failed");
            }
        });
        let mut background = self.background.lock();
        background.retain(|task| !task.is_finished());
        background.push(handle);
    }

    /// Wait for every pending scoring task.
    pub async fn drain_background(&self) {
        let pending = std::mem::take(&mut *self.background.lock());
        for task in pending {
            if let Err(err) = task.await {
                warn!(error = %err, "background task panicked");
            }
        }
    }

    /// Close the session and record a reflection over it.  Returns `None`
    /// when there was no session or it had no turns.
    pub async fn end_session(&self, persona_id: &str, client_id: &str) -> CoreResult<Option<Reflection>> {
        let key = SessionKey::new(persona_id, client_id);
        let Some(handle) = self.sessions.remove(&key) else {
            return Ok(None);
        };
        let session = handle.lock().await;
        if session.request_count == 0 {
            return Ok(None);
        }

        let status = if session.fallback_turns == 0 {
            "completed"
        } else if session.fallback_turns < session.request_count {
            "partially_completed"
        } else {
            "failed"
        };
        let ego = match self.store.load_self_profile(persona_id).await {
            Ok(Some(profile)) => profile.last_alignment_score,
            Ok(None) => persona_self::NEUTRAL_SCORE,
            Err(err) => {
                debug!(persona_id, error = %err, "self profile unavailable for reflection");
                persona_self::NEUTRAL_SCORE
            }
        };
        let plan = format!("conversation with {client_id}");
        let outcome = PlanOutcome::new(status, format!("{} turns", session.request_count));
        let reflection = self
            .reflector
            .reflect_on_plan_result(&plan, &outcome, ego, &session.id.to_string());
        if self.reflector.suggest_replan(ego, outcome.success_score()) {
            info!(persona_id, client_id, ego, status, "reflection suggests a different approach next session");
        }

        let write = MemoryWrite::Working {
            client_id: Some(client_id.to_string()),
            content: format!("Reflection: {}", reflection.text),
            importance: REFLECTION_IMPORTANCE,
        };
        if let Err(err) = self.store.write(persona_id, write).await {
            warn!(persona_id, client_id, error = %err, "reflection could not be stored");
        }
        info!(persona_id, client_id, turns = session.request_count, register = ?reflection.register, "session ended");
        Ok(Some(reflection))
    }

    /// Drop sessions idle past the configured TTL.  Returns how many were removed.
    pub fn expire_sessions(&self, now: DateTime<Utc>) -> usize {
        let ttl = self.config.snapshot().session.session_ttl();
        let expired = self.sessions.expire(now, ttl);
        if !expired.is_empty() {
            info!(expired = expired.len(), remaining = self.sessions.len(), "sessions expired");
        }
        expired.len()
    }

    /// Re-read the configuration file.  `[persona]` and `[session]` apply
    /// from the next turn; `[cascade]`, `[memory]`, `[health]` and
    /// `[telemetry]` are wired at startup, so changes there wait for a
    /// restart and are only logged.  A rejected file keeps the current config.
    pub fn reload_config(&self, path: &Path) -> CoreResult<()> {
        let before = self.config.snapshot();
        self.config.reload(path)?;
        let after = self.config.snapshot();

        let restart_only = [
            ("cascade", before.cascade != after.cascade),
            ("memory", before.memory != after.memory),
            ("health", before.health != after.health),
            ("telemetry", before.telemetry != after.telemetry),
        ];
        for (section, changed) in restart_only {
            if changed {
                warn!(section, "config section changed on reload; takes effect after restart");
            }
        }
        Ok(())
    }

    pub async fn health_report(&self) -> HealthReport {
        self.health.get_comprehensive_health_report().await
    }
}

fn load_catalog(dir: &Path) -> Result<PersonaCatalog> {
    if !dir.exists() {
        debug!(dir = %dir.display(), "persona directory missing, using placeholder personas");
        return Ok(PersonaCatalog::default());
    }
    PersonaCatalog::load_dir(dir).with_context(|| format!("failed to load personas from {}", dir.display()))
}
