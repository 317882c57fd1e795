//! Periodic maintenance, independent of request traffic.
//!
//! One pass decays working memory, runs the health cleanup protocols,
//! evicts idle sessions and checks integrity, deduplicating any persona the
//! integrity scan flags.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use persona_health::HealthStatus;

use crate::orchestrator::SessionOrchestrator;

#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceSummary {
    pub decayed: usize,
    pub archived: usize,
    pub sessions_expired: usize,
    pub deduplicated: usize,
    pub integrity_score: f64,
    pub integrity_status: Option<HealthStatus>,
}

impl SessionOrchestrator {
    pub async fn run_maintenance_pass(&self, now: DateTime<Utc>) -> Result<MaintenanceSummary> {
        let mut summary = MaintenanceSummary::default();

        for persona_id in self.store().personas().await? {
            match self.store().decay(&persona_id, now).await {
                Ok(report) => summary.decayed += report.pruned(),
                Err(err) => warn!(persona_id = %persona_id, error = %err, "decay pass failed"),
            }
        }

        let cleanup = self
            .health()
            .run_cleanup_protocols(&self.sessions().activity(), now)
            .await;
        summary.archived = cleanup.archived.iter().map(|a| a.archived).sum();
        if !cleanup.stale_sessions.is_empty() {
            summary.sessions_expired = self.expire_sessions(now);
        }

        let integrity = self.health().check_neural_integrity().await;
        for persona in integrity.personas.iter().filter(|p| p.duplicate_entries > 0) {
            match self.store().deduplicate(&persona.persona_id).await {
                Ok(report) => summary.deduplicated += report.canon_merged + report.working_removed,
                Err(err) => warn!(persona_id = %persona.persona_id, error = %err, "deduplication failed"),
            }
        }
        summary.integrity_score = integrity.score;
        summary.integrity_status = Some(integrity.status);

        info!(
            decayed = summary.decayed,
            archived = summary.archived,
            sessions_expired = summary.sessions_expired,
            deduplicated = summary.deduplicated,
            integrity = summary.integrity_score,
            "maintenance pass complete"
        );
        Ok(summary)
    }

    /// Run [`run_maintenance_pass`](Self::run_maintenance_pass) every
    /// `cleanup_interval` until `shutdown` flips to `true`.
    pub fn spawn_maintenance(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let period = self.config().snapshot().health.cleanup_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately; skip it so startup is quiet.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = self.run_maintenance_pass(Utc::now()).await {
                            warn!(error = %err, "maintenance pass failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("maintenance task stopping");
                            break;
                        }
                    }
                }
            }
        })
    }
}
