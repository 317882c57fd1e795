//! Post-hoc reflections over plan outcomes.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// What happened to a plan.  `status` is free text; the recognised values are
/// `completed`, `partially_completed` and `failed`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanOutcome {
    pub status: String,
    #[serde(default)]
    pub summary: String,
}

impl PlanOutcome {
    pub fn new(status: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            summary: summary.into(),
        }
    }

    pub fn success_score(&self) -> f64 {
        match self.status.trim().to_ascii_lowercase().as_str() {
            "completed" => 0.9,
            "partially_completed" => 0.6,
            "failed" => 0.2,
            _ => 0.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Register {
    /// Strong outcome and strong alignment.
    HighHigh,
    Moderate,
    Low,
    /// Outcome and alignment disagree.
    Mixed,
}

impl Register {
    pub fn classify(success: f64, ego: f64) -> Self {
        if success >= 0.7 && ego >= 0.7 {
            Self::HighHigh
        } else if success < 0.4 && ego < 0.4 {
            Self::Low
        } else if success >= 0.4 && ego >= 0.4 {
            Self::Moderate
        } else {
            Self::Mixed
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Reflection {
    pub session_id: String,
    pub register: Register,
    pub success_score: f64,
    pub ego_score: f64,
    pub text: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Reflector;

impl Reflector {
    pub fn reflect_on_plan_result(
        &self,
        plan: &str,
        outcome: &PlanOutcome,
        ego_state: f64,
        session_id: &str,
    ) -> Reflection {
        let success = outcome.success_score();
        let ego = ego_state.clamp(0.0, 1.0);
        let register = Register::classify(success, ego);
        let plan = plan.trim();

        let mut text = match register {
            Register::HighHigh => format!(
                "That went well: \"{plan}\" landed, and I stayed true to myself throughout. I'll keep this approach."
            ),
            Register::Moderate => format!(
                "\"{plan}\" went reasonably. Some parts worked and my voice held mostly steady, so there is room to refine."
            ),
            Register::Low => format!(
                "\"{plan}\" did not go the way I hoped and I drifted from who I am. I need to slow down and re-center."
            ),
            Register::Mixed => format!(
                "\"{plan}\" had mixed results: the outcome and how aligned I felt did not match. Worth a closer look next time."
            ),
        };
        if !outcome.summary.trim().is_empty() {
            text.push_str(&format!(" ({})", outcome.summary.trim()));
        }

        debug!(session_id, ?register, success, ego, "reflection generated");
        Reflection {
            session_id: session_id.to_string(),
            register,
            success_score: success,
            ego_score: ego,
            text,
        }
    }

    /// Replan only when things are clearly off.  Continuation is preferred.
    pub fn suggest_replan(&self, ego_score: f64, outcome_quality: f64) -> bool {
        (ego_score < 0.3 && outcome_quality < 0.4) || outcome_quality < 0.2
    }
}
