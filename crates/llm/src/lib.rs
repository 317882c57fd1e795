pub mod backend;
pub mod cascade;
pub mod circuit;
pub mod compress;
pub mod providers;
pub mod scripted;

pub use backend::{BackendReply, EchoBackend, GenerationBackend, TemplateFallback};
pub use cascade::{
    Attempt, AttemptOutcome, CascadeSettings, CascadeSnapshot, DispatchRecord, DispatchRequest,
    DispatchResult, ProviderCascade,
};
pub use circuit::{Admission, CircuitBreaker, CircuitSnapshot, CircuitState};
pub use compress::{CompressedContext, compress, estimate_tokens};
pub use providers::{OllamaBackend, OpenRouterBackend, build_backend, build_backends};
