pub mod backend;
pub mod decay;
pub mod document;
pub mod error;
pub mod file_backend;
pub mod maintenance;
pub mod markers;
pub mod schema;
pub mod store;

pub use backend::{InMemoryBackend, MemoryBackend, RawDocument};
pub use document::{CorruptionKind, DecodedDocument, MalformedEntry, decode_document};
pub use error::{MemoryError, MemoryResult};
pub use file_backend::FileBackend;
pub use maintenance::{DecayReport, DedupReport};
pub use markers::{RoutedMessage, route_marker, route_message};
pub use schema::{
    CanonEntry, ClientProfile, MemoryLayer, PersonaMemory, SelfProfile, TurnRecord, WorkingEntry,
    content_hash, truncate_str,
};
pub use store::{
    ArchiveReason, ArchiveReport, DocumentInspection, DocumentState, MemoryPayload, MemoryPolicy,
    MemoryStats, MemoryStore, MemoryWrite, WriteReceipt,
};
