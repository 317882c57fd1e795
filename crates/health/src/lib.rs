pub mod monitor;
pub mod status;

pub use monitor::{
    CleanupReport, ContextQuality, HealthMetrics, HealthMonitor, HealthReport, HealthThresholds,
    IntegrityReport, MemoryHealth, PersonaIntegrity, SessionActivity,
};
pub use status::HealthStatus;
