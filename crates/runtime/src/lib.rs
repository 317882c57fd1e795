pub mod facts;
pub mod maintenance;
pub mod orchestrator;
pub mod prompt;
pub mod session;

pub use facts::{ClientFact, extract_explicit_facts, extract_marked_facts, extract_phrase_facts};
pub use maintenance::MaintenanceSummary;
pub use orchestrator::{SessionOrchestrator, TurnOutcome};
pub use prompt::{PromptInputs, build_turn_prompt};
pub use session::{Session, SessionHandle, SessionKey, SessionRegistry};
