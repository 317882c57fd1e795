//! Aggregates memory, integrity and handoff signals into one status.
//!
//! Scans only read the memory store (cleanup's archival is the exception and
//! goes through the store's per-persona lock), so they can run on a timer
//! alongside live traffic.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use persona_config::AppConfig;
use persona_llm::{CascadeSnapshot, ProviderCascade};
use persona_memory::{ArchiveReport, DocumentState, MemoryStore};

use crate::status::HealthStatus;

const INTEGRITY_PENALTY_PER_KIND: f64 = 0.1;
const INTEGRITY_PENALTY_DUPLICATES: f64 = 0.05;
const MISSING_STORAGE_SCORE: f64 = 0.5;
const INTEGRITY_GREEN: f64 = 0.95;
/// Below this handoff success rate the context pipeline counts as failing.
const HANDOFF_RED: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct HealthThresholds {
    pub max_memory_file_size: u64,
    pub memory_count_warning: usize,
    pub context_quality_threshold: f64,
    pub ema_alpha: f64,
    pub max_session_age: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

impl HealthThresholds {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            max_memory_file_size: config.memory.max_memory_file_size,
            memory_count_warning: config.health.memory_count_warning,
            context_quality_threshold: config.health.context_quality_threshold,
            ema_alpha: config.health.ema_alpha,
            max_session_age: config.session.session_ttl(),
        }
    }
}

/// Process-lifetime counters.  Reset only on restart.
#[derive(Debug, Clone, Serialize)]
pub struct HealthMetrics {
    pub memory_file_size: u64,
    pub total_memories: usize,
    pub handoff_success_rate: f64,
    pub total_handoffs: u64,
    pub compression_ratio: f64,
    pub integrity_score: f64,
    pub last_cleanup: Option<DateTime<Utc>>,
}

impl Default for HealthMetrics {
    fn default() -> Self {
        Self {
            memory_file_size: 0,
            total_memories: 0,
            handoff_success_rate: 1.0,
            total_handoffs: 0,
            compression_ratio: 1.0,
            integrity_score: 1.0,
            last_cleanup: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryHealth {
    /// Largest persona document, the unit the size ceiling applies to.
    pub memory_file_size: u64,
    pub total_bytes: u64,
    pub total_memories: usize,
    pub memory_file_health: HealthStatus,
    pub memory_count_health: HealthStatus,
    pub error: Option<String>,
}

impl MemoryHealth {
    pub fn status(&self) -> HealthStatus {
        HealthStatus::worst([self.memory_file_health, self.memory_count_health])
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextQuality {
    pub handoff_success_rate: f64,
    pub total_handoffs: u64,
    pub compression_ratio: f64,
    pub status: HealthStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct PersonaIntegrity {
    pub persona_id: String,
    pub score: f64,
    pub status: HealthStatus,
    pub corruption_kinds: Vec<String>,
    pub duplicate_entries: usize,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub score: f64,
    pub status: HealthStatus,
    pub personas: Vec<PersonaIntegrity>,
}

/// Last activity of a live session, as seen by the cleanup sweep.
#[derive(Debug, Clone)]
pub struct SessionActivity {
    pub key: String,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub archived: Vec<ArchiveReport>,
    /// Sessions idle past `max_session_age`.  Eviction is the caller's job.
    pub stale_sessions: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub overall_status: HealthStatus,
    pub generated_at: DateTime<Utc>,
    pub memory: MemoryHealth,
    pub integrity: IntegrityReport,
    pub context: ContextQuality,
    pub cascade: Option<CascadeSnapshot>,
    pub metrics: HealthMetrics,
}

pub struct HealthMonitor {
    store: Arc<MemoryStore>,
    cascade: Option<Arc<ProviderCascade>>,
    thresholds: HealthThresholds,
    metrics: Mutex<HealthMetrics>,
}

impl HealthMonitor {
    pub fn new(store: Arc<MemoryStore>, thresholds: HealthThresholds) -> Self {
        Self {
            store,
            cascade: None,
            thresholds,
            metrics: Mutex::new(HealthMetrics::default()),
        }
    }

    pub fn with_cascade(mut self, cascade: Arc<ProviderCascade>) -> Self {
        self.cascade = Some(cascade);
        self
    }

    pub fn metrics(&self) -> HealthMetrics {
        self.metrics.lock().clone()
    }

    pub async fn get_memory_health_stats(&self) -> MemoryHealth {
        match self.store.stats().await {
            Ok(stats) => {
                let health = MemoryHealth {
                    memory_file_size: stats.largest_document_bytes,
                    total_bytes: stats.total_bytes,
                    total_memories: stats.total_entries,
                    memory_file_health: if stats.largest_document_bytes < self.thresholds.max_memory_file_size {
                        HealthStatus::Green
                    } else {
                        HealthStatus::Red
                    },
                    memory_count_health: if stats.total_entries >= self.thresholds.memory_count_warning {
                        HealthStatus::Yellow
                    } else {
                        HealthStatus::Green
                    },
                    error: None,
                };
                let mut metrics = self.metrics.lock();
                metrics.memory_file_size = health.memory_file_size;
                metrics.total_memories = health.total_memories;
                health
            }
            Err(err) => {
                warn!(error = %err, "memory stats unavailable");
                MemoryHealth {
                    memory_file_size: 0,
                    total_bytes: 0,
                    total_memories: 0,
                    memory_file_health: HealthStatus::Red,
                    memory_count_health: HealthStatus::Yellow,
                    error: Some(err.to_string()),
                }
            }
        }
    }

    /// Fold one handoff outcome into the success-rate EMA and return the new rate.
    pub fn monitor_context_quality(&self, handoff_success: bool, compression_ratio: f64) -> f64 {
        let outcome = if handoff_success { 1.0 } else { 0.0 };
        let alpha = self.thresholds.ema_alpha;
        let mut metrics = self.metrics.lock();
        metrics.handoff_success_rate = alpha * outcome + (1.0 - alpha) * metrics.handoff_success_rate;
        metrics.total_handoffs += 1;
        metrics.compression_ratio = compression_ratio.clamp(0.0, 1.0);
        let rate = metrics.handoff_success_rate;
        drop(metrics);

        if rate < self.thresholds.context_quality_threshold {
            warn!(
                rate,
                threshold = self.thresholds.context_quality_threshold,
                "context handoff success rate below threshold"
            );
        }
        rate
    }

    fn context_quality(&self) -> ContextQuality {
        let metrics = self.metrics.lock();
        let rate = metrics.handoff_success_rate;
        let status = if rate >= self.thresholds.context_quality_threshold {
            HealthStatus::Green
        } else if rate >= HANDOFF_RED {
            HealthStatus::Yellow
        } else {
            HealthStatus::Red
        };
        ContextQuality {
            handoff_success_rate: rate,
            total_handoffs: metrics.total_handoffs,
            compression_ratio: metrics.compression_ratio,
            status,
        }
    }

    /// Archive oversized personas and list sessions idle past the maximum age.
    pub async fn run_cleanup_protocols(&self, sessions: &[SessionActivity], now: DateTime<Utc>) -> CleanupReport {
        let mut report = CleanupReport::default();

        match self.store.personas().await {
            Ok(personas) => {
                for persona_id in personas {
                    let oversized = match self.store.size_bytes(&persona_id).await {
                        Ok(bytes) => bytes > self.thresholds.max_memory_file_size,
                        Err(err) => {
                            report.errors.push(format!("{persona_id}: {err}"));
                            continue;
                        }
                    };
                    if !oversized {
                        continue;
                    }
                    match self.store.archive(&persona_id).await {
                        Ok(archive) => report.archived.push(archive),
                        Err(err) => report.errors.push(format!("{persona_id}: {err}")),
                    }
                }
            }
            Err(err) => report.errors.push(err.to_string()),
        }

        let max_age = chrono::Duration::from_std(self.thresholds.max_session_age)
            .unwrap_or_else(|_| chrono::Duration::minutes(30));
        report.stale_sessions = sessions
            .iter()
            .filter(|session| now - session.last_activity > max_age)
            .map(|session| session.key.clone())
            .collect();

        self.metrics.lock().last_cleanup = Some(now);
        info!(
            archived = report.archived.len(),
            stale_sessions = report.stale_sessions.len(),
            errors = report.errors.len(),
            "cleanup protocols complete"
        );
        report
    }

    pub async fn check_neural_integrity(&self) -> IntegrityReport {
        let personas = match self.store.personas().await {
            Ok(personas) => personas,
            Err(err) => {
                warn!(error = %err, "memory storage unreadable during integrity check");
                return self.record_integrity(IntegrityReport {
                    score: 0.0,
                    status: HealthStatus::Red,
                    personas: Vec::new(),
                });
            }
        };
        if personas.is_empty() {
            return self.record_integrity(IntegrityReport {
                score: MISSING_STORAGE_SCORE,
                status: HealthStatus::Yellow,
                personas: Vec::new(),
            });
        }

        let mut results = Vec::with_capacity(personas.len());
        for persona_id in personas {
            let inspection = self.store.inspect(&persona_id).await;
            let (score, detail) = match &inspection.state {
                DocumentState::Missing => (MISSING_STORAGE_SCORE, Some("document missing".to_string())),
                DocumentState::Unreadable(reason) => (0.0, Some(reason.clone())),
                DocumentState::Loaded => {
                    let mut score = 1.0 - INTEGRITY_PENALTY_PER_KIND * inspection.malformed_kinds.len() as f64;
                    if inspection.duplicate_entries > 0 {
                        score -= INTEGRITY_PENALTY_DUPLICATES;
                    }
                    (score.clamp(0.0, 1.0), None)
                }
            };
            let status = match &inspection.state {
                DocumentState::Missing => HealthStatus::Yellow,
                DocumentState::Unreadable(_) => HealthStatus::Red,
                DocumentState::Loaded => integrity_status(score),
            };
            results.push(PersonaIntegrity {
                persona_id,
                score,
                status,
                corruption_kinds: inspection
                    .malformed_kinds
                    .iter()
                    .map(|kind| kind.label().to_string())
                    .collect(),
                duplicate_entries: inspection.duplicate_entries,
                detail,
            });
        }

        let score = results.iter().map(|p| p.score).fold(1.0, f64::min);
        let status = HealthStatus::worst(results.iter().map(|p| p.status));
        if status != HealthStatus::Green {
            for persona in results.iter().filter(|p| p.status != HealthStatus::Green) {
                warn!(
                    persona_id = %persona.persona_id,
                    score = persona.score,
                    kinds = ?persona.corruption_kinds,
                    duplicates = persona.duplicate_entries,
                    "memory integrity degraded"
                );
            }
        }
        self.record_integrity(IntegrityReport {
            score,
            status,
            personas: results,
        })
    }

    fn record_integrity(&self, report: IntegrityReport) -> IntegrityReport {
        self.metrics.lock().integrity_score = report.score;
        report
    }

    pub async fn get_comprehensive_health_report(&self) -> HealthReport {
        let memory = self.get_memory_health_stats().await;
        let integrity = self.check_neural_integrity().await;
        let context = self.context_quality();
        let overall_status = HealthStatus::worst([memory.status(), integrity.status, context.status]);

        HealthReport {
            overall_status,
            generated_at: Utc::now(),
            memory,
            integrity,
            context,
            cascade: self.cascade.as_ref().map(|cascade| cascade.snapshot()),
            metrics: self.metrics(),
        }
    }
}

fn integrity_status(score: f64) -> HealthStatus {
    if score >= INTEGRITY_GREEN {
        HealthStatus::Green
    } else if score >= MISSING_STORAGE_SCORE {
        HealthStatus::Yellow
    } else {
        HealthStatus::Red
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use persona_memory::{InMemoryBackend, MemoryPolicy, MemoryWrite};
    use uuid::Uuid;

    fn monitor() -> (Arc<InMemoryBackend>, Arc<MemoryStore>, HealthMonitor) {
        let backend = Arc::new(InMemoryBackend::new());
        let store = Arc::new(MemoryStore::new(backend.clone(), MemoryPolicy::default()));
        let monitor = HealthMonitor::new(store.clone(), HealthThresholds::default());
        (backend, store, monitor)
    }

    fn note(content: &str) -> MemoryWrite {
        MemoryWrite::Working {
            client_id: None,
            content: content.into(),
            importance: 0.5,
        }
    }

    #[test]
    fn handoff_rate_follows_ema_exactly() {
        let (_, _, monitor) = monitor();
        let rates = [true, true, false, true]
            .into_iter()
            .map(|outcome| monitor.monitor_context_quality(outcome, 1.0))
            .collect::<Vec<_>>();
        let expected = [1.0, 1.0, 0.9, 0.91];
        for (rate, want) in rates.iter().zip(expected) {
            assert!((rate - want).abs() < 1e-3, "{rate} != {want}");
        }
        assert_eq!(monitor.metrics().total_handoffs, 4);
    }

    #[tokio::test]
    async fn memory_stats_classify_size_and_count() {
        let backend = Arc::new(InMemoryBackend::new());
        let store = Arc::new(MemoryStore::new(backend, MemoryPolicy::default()));
        let thresholds = HealthThresholds {
            memory_count_warning: 2,
            ..Default::default()
        };
        let monitor = HealthMonitor::new(store.clone(), thresholds);
        store.write("jane", note("one")).await.unwrap();
        let health = monitor.get_memory_health_stats().await;
        assert_eq!(health.memory_file_health, HealthStatus::Green);
        assert_eq!(health.memory_count_health, HealthStatus::Green);

        store.write("jane", note("two")).await.unwrap();
        let health = monitor.get_memory_health_stats().await;
        assert_eq!(health.memory_count_health, HealthStatus::Yellow);
        assert_eq!(health.total_memories, 2);
    }

    #[tokio::test]
    async fn integrity_of_empty_storage_is_yellow() {
        let (_, _, monitor) = monitor();
        let report = monitor.check_neural_integrity().await;
        assert_eq!(report.score, 0.5);
        assert_eq!(report.status, HealthStatus::Yellow);
    }

    #[tokio::test]
    async fn integrity_of_unreadable_storage_is_red() {
        let (backend, store, monitor) = monitor();
        store.write("jane", note("x")).await.unwrap();
        backend.set_available(false);
        let report = monitor.check_neural_integrity().await;
        assert_eq!(report.score, 0.0);
        assert_eq!(report.status, HealthStatus::Red);
    }

    #[tokio::test]
    async fn corrupt_document_is_red() {
        let (backend, _, monitor) = monitor();
        backend.put_raw("jane", "not json at all");
        let report = monitor.check_neural_integrity().await;
        assert_eq!(report.score, 0.0);
        assert_eq!(report.status, HealthStatus::Red);
    }

    #[tokio::test]
    async fn integrity_deducts_per_kind_and_duplicates() {
        let (backend, _, monitor) = monitor();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        backend.put_raw(
            "jane",
            format!(
                r#"{{"persona_id":"jane","canon":[
                    {{"id":"{a}","content":"same"}},
                    {{"id":"{b}","content":"same"}},
                    {{"content":"no id"}},
                    {{"id":"{a}"}}
                ]}}"#
            ),
        );
        let report = monitor.check_neural_integrity().await;
        // missing-id and missing-content: -0.2, duplicates: -0.05
        assert!((report.score - 0.75).abs() < 1e-9);
        assert_eq!(report.status, HealthStatus::Yellow);
        assert_eq!(report.personas[0].corruption_kinds.len(), 2);
        assert!((monitor.metrics().integrity_score - 0.75).abs() < 1e-9);
    }

    #[tokio::test]
    async fn cleanup_flags_stale_sessions_only() {
        let (_, _, monitor) = monitor();
        let now = Utc::now();
        let sessions = vec![
            SessionActivity {
                key: "jane:old".into(),
                last_activity: now - chrono::Duration::minutes(31),
            },
            SessionActivity {
                key: "jane:fresh".into(),
                last_activity: now - chrono::Duration::minutes(5),
            },
        ];
        let report = monitor.run_cleanup_protocols(&sessions, now).await;
        assert_eq!(report.stale_sessions, vec!["jane:old".to_string()]);
        assert!(report.archived.is_empty());
        assert_eq!(monitor.metrics().last_cleanup, Some(now));
    }

    #[tokio::test]
    async fn cleanup_archives_oversized_personas() {
        let backend = Arc::new(InMemoryBackend::new());
        let policy = MemoryPolicy {
            // Writes never trip the store's own threshold here.
            archive_threshold: u64::MAX,
            max_file_size: u64::MAX,
            archive_keep_recent: 2,
            ..Default::default()
        };
        let store = Arc::new(MemoryStore::new(backend, policy));
        for i in 0..6 {
            store.write("jane", note(&format!("note {i}"))).await.unwrap();
        }
        let thresholds = HealthThresholds {
            max_memory_file_size: 100,
            ..Default::default()
        };
        let monitor = HealthMonitor::new(store.clone(), thresholds);
        let report = monitor.run_cleanup_protocols(&[], Utc::now()).await;
        assert_eq!(report.archived.len(), 1);
        assert_eq!(report.archived[0].archived, 4);
        assert_eq!(report.archived[0].kept_working, 2);
    }

    #[tokio::test]
    async fn comprehensive_report_is_green_when_everything_is_healthy() {
        let (_, store, monitor) = monitor();
        store.write("jane", note("hello")).await.unwrap();
        let report = monitor.get_comprehensive_health_report().await;
        assert_eq!(report.overall_status, HealthStatus::Green);
        assert!(report.cascade.is_none());

        for _ in 0..10 {
            monitor.monitor_context_quality(false, 0.5);
        }
        let report = monitor.get_comprehensive_health_report().await;
        assert_eq!(report.context.status, HealthStatus::Red);
        assert_eq!(report.overall_status, HealthStatus::Red);
    }
}
