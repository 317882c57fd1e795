//! Ordered failover across generation backends.
//!
//! `dispatch` walks the backends in priority order as an explicit state
//! machine: each backend is admitted or skipped by its circuit breaker,
//! called under a timeout and a concurrency slot, and on failure the next
//! backend receives a compressed memory handoff.  When nothing answers, the
//! terminal [`TemplateFallback`] does, so `dispatch` cannot fail.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use persona_config::CascadeConfig;
use persona_core::CoreError;

use crate::backend::{BackendReply, GenerationBackend, TemplateFallback};
use crate::circuit::{Admission, CircuitBreaker, CircuitSnapshot};
use crate::compress::{CompressedContext, compress};
use crate::providers::build_backends;

/// Dispatch outcomes kept for health reporting.
pub const RECENT_OUTCOMES: usize = 100;

const HANDOFF_HEADER: &str = "[Context handoff: recent memory from this conversation]";

#[derive(Debug, Clone)]
pub struct CascadeSettings {
    pub provider_timeout: Duration,
    pub max_concurrent_requests: usize,
    pub circuit_breaker_threshold: u32,
    pub circuit_breaker_timeout: Duration,
    pub retry_schedule: Vec<Duration>,
    pub handoff_max_tokens: usize,
}

impl Default for CascadeSettings {
    fn default() -> Self {
        Self::from_config(&CascadeConfig::default())
    }
}

impl CascadeSettings {
    pub fn from_config(config: &CascadeConfig) -> Self {
        Self {
            provider_timeout: config.provider_timeout(),
            max_concurrent_requests: config.max_concurrent_requests.max(1),
            circuit_breaker_threshold: config.circuit_breaker_threshold,
            circuit_breaker_timeout: config.circuit_breaker_timeout(),
            retry_schedule: config.retry_schedule(),
            handoff_max_tokens: config.handoff_max_tokens,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DispatchRequest {
    pub prompt: String,
    pub persona_id: String,
    pub client_id: String,
    /// Context lines, oldest first, compressed into the handoff on failover.
    pub handoff_memories: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Failed(String),
    TimedOut,
    /// Circuit open; the backend was not called.
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct Attempt {
    pub provider: String,
    pub outcome: AttemptOutcome,
}

impl Attempt {
    /// The typed error for a timed-out or skipped attempt.
    pub fn as_error(&self, timeout: Duration) -> Option<CoreError> {
        match self.outcome {
            AttemptOutcome::TimedOut => Some(CoreError::ProviderTimeout {
                provider: self.provider.clone(),
                after: timeout,
            }),
            AttemptOutcome::Skipped => Some(CoreError::ProviderUnavailable {
                provider: self.provider.clone(),
            }),
            AttemptOutcome::Succeeded | AttemptOutcome::Failed(_) => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchResult {
    pub success: bool,
    pub response: String,
    pub provider_used: String,
    pub latency: Duration,
    pub neural_context_used: bool,
    pub context_handoff_successful: bool,
    pub handoff: Option<CompressedContext>,
    pub attempts: Vec<Attempt>,
}

impl DispatchResult {
    pub fn used_fallback(&self) -> bool {
        self.provider_used == TemplateFallback::NAME
    }
}

/// Compact record of one dispatch, kept in the recent-outcomes ring.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchRecord {
    pub provider_used: String,
    pub neural_context_used: bool,
    pub context_handoff_successful: bool,
    pub compression_ratio: Option<f64>,
    pub latency: Duration,
    pub failed_attempts: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CascadeSnapshot {
    pub backends: Vec<CircuitSnapshot>,
    pub recent: Vec<DispatchRecord>,
}

impl CascadeSnapshot {
    pub fn open_circuits(&self) -> usize {
        self.backends
            .iter()
            .filter(|b| b.state != crate::circuit::CircuitState::Closed)
            .count()
    }

    pub fn fallback_uses(&self) -> usize {
        self.recent
            .iter()
            .filter(|r| r.provider_used == TemplateFallback::NAME)
            .count()
    }
}

struct Route {
    backend: Arc<dyn GenerationBackend>,
    circuit: CircuitBreaker,
}

pub struct ProviderCascade {
    routes: Vec<Route>,
    settings: CascadeSettings,
    slots: Semaphore,
    fallback: TemplateFallback,
    recent: Mutex<VecDeque<DispatchRecord>>,
}

impl ProviderCascade {
    pub fn new(backends: Vec<Arc<dyn GenerationBackend>>, settings: CascadeSettings) -> Self {
        let routes = backends
            .into_iter()
            .map(|backend| Route {
                circuit: CircuitBreaker::new(
                    backend.name(),
                    settings.circuit_breaker_threshold,
                    settings.circuit_breaker_timeout,
                ),
                backend,
            })
            .collect();
        Self {
            routes,
            slots: Semaphore::new(settings.max_concurrent_requests.max(1)),
            settings,
            fallback: TemplateFallback,
            recent: Mutex::new(VecDeque::with_capacity(RECENT_OUTCOMES)),
        }
    }

    /// Build the configured providers in priority order.
    pub fn from_config(config: &CascadeConfig) -> Self {
        Self::new(build_backends(config), CascadeSettings::from_config(config))
    }

    pub fn settings(&self) -> &CascadeSettings {
        &self.settings
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.routes.iter().map(|r| r.backend.name().to_string()).collect()
    }

    pub async fn dispatch(&self, request: &DispatchRequest) -> DispatchResult {
        let started = Instant::now();
        let mut attempts = Vec::with_capacity(self.routes.len());
        let mut failures = 0usize;
        let mut handoff: Option<CompressedContext> = None;
        let mut neural_context_used = false;

        for (index, route) in self.routes.iter().enumerate() {
            let name = route.backend.name();
            let admission = route.circuit.try_acquire();
            if let Admission::Rejected { retry_in } = admission {
                let attempt = Attempt {
                    provider: name.to_string(),
                    outcome: AttemptOutcome::Skipped,
                };
                if let Some(err) = attempt.as_error(self.settings.provider_timeout) {
                    debug!(error = %err, retry_in_secs = retry_in.as_secs(), "skipping provider");
                }
                attempts.push(attempt);
                continue;
            }

            let prompt = if index > 0 {
                neural_context_used = true;
                let context = handoff.get_or_insert_with(|| {
                    compress(&request.handoff_memories, self.settings.handoff_max_tokens)
                });
                with_handoff(&request.prompt, context)
            } else {
                request.prompt.clone()
            };

            let outcome = self.call(route, &prompt, request).await;
            match outcome {
                Ok(reply) => {
                    route.circuit.record_success();
                    if index > 0 {
                        info!(
                            provider = %name,
                            persona_id = %request.persona_id,
                            failed_before = failures,
                            "failover succeeded with context handoff"
                        );
                    }
                    attempts.push(Attempt {
                        provider: name.to_string(),
                        outcome: AttemptOutcome::Succeeded,
                    });
                    let result = DispatchResult {
                        success: true,
                        response: reply.response,
                        provider_used: name.to_string(),
                        latency: started.elapsed(),
                        neural_context_used,
                        context_handoff_successful: neural_context_used,
                        handoff,
                        attempts,
                    };
                    self.remember(&result);
                    return result;
                }
                Err(outcome) => {
                    route.circuit.record_failure();
                    failures += 1;
                    let attempt = Attempt {
                        provider: name.to_string(),
                        outcome,
                    };
                    match attempt.as_error(self.settings.provider_timeout) {
                        Some(err) => warn!(persona_id = %request.persona_id, error = %err, "failing over"),
                        None => warn!(
                            provider = %name,
                            persona_id = %request.persona_id,
                            outcome = ?attempt.outcome,
                            "provider failed, failing over"
                        ),
                    }
                    attempts.push(attempt);
                    if index + 1 < self.routes.len() {
                        if let Some(delay) = self.settings.retry_schedule.get(failures - 1) {
                            tokio::time::sleep(*delay).await;
                        }
                    }
                }
            }
        }

        warn!(
            persona_id = %request.persona_id,
            attempted = attempts.len(),
            "all providers failed or skipped, using terminal fallback"
        );
        let result = DispatchResult {
            success: true,
            response: self.fallback.respond(&request.persona_id),
            provider_used: TemplateFallback::NAME.to_string(),
            latency: started.elapsed(),
            neural_context_used,
            context_handoff_successful: false,
            handoff,
            attempts,
        };
        self.remember(&result);
        result
    }

    /// One bounded call.  The timeout covers waiting for a concurrency slot,
    /// and the slot is released when the call finishes or is abandoned.
    async fn call(
        &self,
        route: &Route,
        prompt: &str,
        request: &DispatchRequest,
    ) -> Result<BackendReply, AttemptOutcome> {
        let bounded = async {
            let _permit = self
                .slots
                .acquire()
                .await
                .map_err(|err| AttemptOutcome::Failed(err.to_string()))?;
            Ok::<_, AttemptOutcome>(
                route
                    .backend
                    .ask(prompt, &request.client_id, &request.persona_id)
                    .await,
            )
        };

        match tokio::time::timeout(self.settings.provider_timeout, bounded).await {
            Err(_) => Err(AttemptOutcome::TimedOut),
            Ok(Err(outcome)) => Err(outcome),
            Ok(Ok(reply)) if reply.success => Ok(reply),
            Ok(Ok(reply)) => Err(AttemptOutcome::Failed(
                reply.error.unwrap_or_else(|| "backend reported failure".to_string()),
            )),
        }
    }

    fn remember(&self, result: &DispatchResult) {
        let record = DispatchRecord {
            provider_used: result.provider_used.clone(),
            neural_context_used: result.neural_context_used,
            context_handoff_successful: result.context_handoff_successful,
            compression_ratio: result.handoff.as_ref().map(CompressedContext::ratio),
            latency: result.latency,
            failed_attempts: result
                .attempts
                .iter()
                .filter(|a| a.outcome != AttemptOutcome::Succeeded)
                .count(),
        };
        let mut recent = self.recent.lock();
        if recent.len() == RECENT_OUTCOMES {
            recent.pop_front();
        }
        recent.push_back(record);
    }

    pub fn snapshot(&self) -> CascadeSnapshot {
        CascadeSnapshot {
            backends: self.routes.iter().map(|r| r.circuit.snapshot()).collect(),
            recent: self.recent.lock().iter().cloned().collect(),
        }
    }

    /// Manually close the named circuit.  Returns `false` for an unknown name.
    pub fn reset_circuit(&self, name: &str) -> bool {
        match self.routes.iter().find(|r| r.backend.name() == name) {
            Some(route) => {
                route.circuit.reset();
                true
            }
            None => false,
        }
    }
}

fn with_handoff(prompt: &str, context: &CompressedContext) -> String {
    if context.summary.is_empty() {
        return prompt.to_string();
    }
    format!("{HANDOFF_HEADER}\n{}\n\n{prompt}", context.summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::CircuitState;
    use crate::scripted::{ScriptedBackend, Step};

    fn settings() -> CascadeSettings {
        CascadeSettings {
            provider_timeout: Duration::from_secs(30),
            max_concurrent_requests: 4,
            circuit_breaker_threshold: 3,
            circuit_breaker_timeout: Duration::from_secs(300),
            retry_schedule: Vec::new(),
            handoff_max_tokens: 500,
        }
    }

    fn request() -> DispatchRequest {
        DispatchRequest {
            prompt: "User: where were we?".into(),
            persona_id: "jane".into(),
            client_id: "c1".into(),
            handoff_memories: vec!["User: budget review | Persona: noted".into()],
        }
    }

    fn cascade(backends: Vec<Arc<ScriptedBackend>>, settings: CascadeSettings) -> ProviderCascade {
        ProviderCascade::new(
            backends
                .into_iter()
                .map(|b| b as Arc<dyn GenerationBackend>)
                .collect(),
            settings,
        )
    }

    #[tokio::test]
    async fn primary_success_uses_no_handoff() {
        let primary = Arc::new(ScriptedBackend::healthy("primary", "hello"));
        let cascade = cascade(vec![primary.clone()], settings());
        let result = cascade.dispatch(&request()).await;
        assert!(result.success);
        assert_eq!(result.provider_used, "primary");
        assert!(!result.neural_context_used);
        assert!(!result.context_handoff_successful);
        assert_eq!(primary.prompts(), vec!["User: where were we?".to_string()]);
    }

    #[tokio::test]
    async fn failover_prepends_compressed_context() {
        let primary = Arc::new(ScriptedBackend::broken("primary"));
        let secondary = Arc::new(ScriptedBackend::healthy("secondary", "picking up"));
        let cascade = cascade(vec![primary, secondary.clone()], settings());

        let result = cascade.dispatch(&request()).await;
        assert!(result.success);
        assert_eq!(result.provider_used, "secondary");
        assert!(result.neural_context_used);
        assert!(result.context_handoff_successful);
        let prompt = &secondary.prompts()[0];
        assert!(prompt.starts_with(HANDOFF_HEADER));
        assert!(prompt.contains("budget review"));
        assert!(prompt.ends_with("User: where were we?"));
    }

    #[tokio::test]
    async fn everything_down_returns_terminal_fallback() {
        let cascade = cascade(
            vec![
                Arc::new(ScriptedBackend::broken("a")),
                Arc::new(ScriptedBackend::broken("b")),
            ],
            settings(),
        );
        let result = cascade.dispatch(&request()).await;
        assert!(result.success);
        assert!(result.used_fallback());
        assert!(!result.response.is_empty());
        assert!(result.neural_context_used);
        assert!(!result.context_handoff_successful);
        assert_eq!(cascade.snapshot().fallback_uses(), 1);
    }

    #[tokio::test]
    async fn no_backends_still_answers() {
        let cascade = ProviderCascade::new(Vec::new(), settings());
        let result = cascade.dispatch(&request()).await;
        assert!(result.success);
        assert_eq!(result.provider_used, "fallback");
    }

    #[tokio::test]
    async fn circuit_opens_after_threshold_and_skips_backend() {
        let primary = Arc::new(ScriptedBackend::broken("primary"));
        let secondary = Arc::new(ScriptedBackend::healthy("secondary", "ok"));
        let cascade = cascade(vec![primary.clone(), secondary], settings());

        for _ in 0..3 {
            cascade.dispatch(&request()).await;
        }
        assert_eq!(primary.calls(), 3);
        let snap = cascade.snapshot();
        assert_eq!(snap.backends[0].state, CircuitState::Open);
        assert_eq!(snap.open_circuits(), 1);

        let result = cascade.dispatch(&request()).await;
        assert_eq!(primary.calls(), 3);
        assert_eq!(result.attempts[0].outcome, AttemptOutcome::Skipped);
        assert_eq!(result.provider_used, "secondary");
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_trial_after_cooldown_then_recovers() {
        let primary = Arc::new(
            ScriptedBackend::healthy("primary", "back").then([
                Step::Fail("x".into()),
                Step::Fail("x".into()),
                Step::Fail("x".into()),
            ]),
        );
        let secondary = Arc::new(ScriptedBackend::healthy("secondary", "ok"));
        let cascade = cascade(vec![primary.clone(), secondary], settings());

        for _ in 0..3 {
            cascade.dispatch(&request()).await;
        }
        tokio::time::advance(Duration::from_secs(299)).await;
        cascade.dispatch(&request()).await;
        assert_eq!(primary.calls(), 3);

        tokio::time::advance(Duration::from_secs(1)).await;
        let result = cascade.dispatch(&request()).await;
        assert_eq!(primary.calls(), 4);
        assert_eq!(result.provider_used, "primary");
        assert_eq!(cascade.snapshot().backends[0].state, CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_counts_as_failure_and_fails_over() {
        let primary = Arc::new(ScriptedBackend::new("primary", Step::Hang));
        let secondary = Arc::new(ScriptedBackend::healthy("secondary", "ok"));
        let cascade = cascade(vec![primary, secondary], settings());

        let result = cascade.dispatch(&request()).await;
        assert_eq!(result.attempts[0].outcome, AttemptOutcome::TimedOut);
        assert_eq!(result.provider_used, "secondary");
        assert!(result.latency >= Duration::from_secs(30));
        assert!(result.latency < Duration::from_secs(31));
        assert_eq!(cascade.snapshot().backends[0].consecutive_failures, 1);

        let err = result.attempts[0].as_error(Duration::from_secs(30)).unwrap();
        assert!(err.is_recoverable_by_failover());
        assert!(result.attempts[1].as_error(Duration::from_secs(30)).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_schedule_waits_between_backends() {
        let mut with_retry = settings();
        with_retry.retry_schedule = vec![Duration::from_secs(1), Duration::from_secs(2)];
        let cascade = cascade(
            vec![
                Arc::new(ScriptedBackend::broken("a")),
                Arc::new(ScriptedBackend::broken("b")),
                Arc::new(ScriptedBackend::healthy("c", "ok")),
            ],
            with_retry,
        );
        let result = cascade.dispatch(&request()).await;
        assert_eq!(result.provider_used, "c");
        assert!(result.latency >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn concurrent_failures_accumulate_on_shared_circuit() {
        let primary = Arc::new(ScriptedBackend::broken("primary"));
        let cascade = Arc::new(cascade(
            vec![primary, Arc::new(ScriptedBackend::healthy("b", "ok"))],
            settings(),
        ));
        let mut tasks = Vec::new();
        for _ in 0..3 {
            let cascade = cascade.clone();
            tasks.push(tokio::spawn(async move { cascade.dispatch(&request()).await }));
        }
        for task in tasks {
            assert!(task.await.unwrap().success);
        }
        assert_eq!(cascade.snapshot().backends[0].state, CircuitState::Open);
    }

    #[tokio::test]
    async fn reset_circuit_closes_manually() {
        let cascade = cascade(vec![Arc::new(ScriptedBackend::broken("primary"))], settings());
        for _ in 0..3 {
            cascade.dispatch(&request()).await;
        }
        assert!(cascade.reset_circuit("primary"));
        assert!(!cascade.reset_circuit("missing"));
        assert_eq!(cascade.snapshot().backends[0].state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn recent_outcomes_ring_is_bounded() {
        let cascade = cascade(vec![Arc::new(ScriptedBackend::healthy("a", "ok"))], settings());
        for _ in 0..(RECENT_OUTCOMES + 5) {
            cascade.dispatch(&request()).await;
        }
        assert_eq!(cascade.snapshot().recent.len(), RECENT_OUTCOMES);
    }
}
