pub mod alignment;
pub mod model;
pub mod reflector;

pub use alignment::{NEUTRAL_SCORE, evaluate_alignment, keyword_matches};
pub use model::{SelfModel, SelfStateBlob, alignment_band};
pub use reflector::{PlanOutcome, Reflection, Reflector, Register};
