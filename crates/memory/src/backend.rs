//! Storage medium behind [`crate::MemoryStore`].
//!
//! Backends move opaque JSON documents; decoding and policy live in the
//! store.  This keeps the physical format (files, a database, memory) an
//! implementation choice.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{MemoryError, MemoryResult};
use crate::schema::WorkingEntry;

/// A persisted persona document as read from the medium.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawDocument {
    Missing,
    Present(String),
}

#[async_trait]
pub trait MemoryBackend: Send + Sync {
    async fn load_raw(&self, persona_id: &str) -> MemoryResult<RawDocument>;

    /// Replace the persona document.  Returns the bytes written.
    async fn save_raw(&self, persona_id: &str, document: &str) -> MemoryResult<u64>;

    /// Append archived working entries to the persona's archive.
    async fn append_archive(&self, persona_id: &str, entries: &[WorkingEntry]) -> MemoryResult<()>;

    /// Preserve raw fragments that could not be decoded.
    async fn quarantine(&self, persona_id: &str, fragments: &[String]) -> MemoryResult<()>;

    async fn personas(&self) -> MemoryResult<Vec<String>>;

    /// Serialized size of the persona document (0 when missing).
    async fn size_bytes(&self, persona_id: &str) -> MemoryResult<u64>;
}

/// Process-local backend used in tests and ephemeral deployments.
#[derive(Debug)]
pub struct InMemoryBackend {
    documents: Mutex<HashMap<String, String>>,
    archives: Mutex<HashMap<String, Vec<WorkingEntry>>>,
    quarantined: Mutex<HashMap<String, Vec<String>>>,
    available: AtomicBool,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self {
            documents: Mutex::new(HashMap::new()),
            archives: Mutex::new(HashMap::new()),
            quarantined: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the medium going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Write a raw document, bypassing the store.  Used to seed corruption.
    pub fn put_raw(&self, persona_id: &str, document: impl Into<String>) {
        self.documents
            .lock()
            .insert(persona_id.to_string(), document.into());
    }

    pub fn archived(&self, persona_id: &str) -> Vec<WorkingEntry> {
        self.archives
            .lock()
            .get(persona_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn quarantined(&self, persona_id: &str) -> Vec<String> {
        self.quarantined
            .lock()
            .get(persona_id)
            .cloned()
            .unwrap_or_default()
    }

    fn ensure_available(&self) -> MemoryResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MemoryError::StorageUnavailable(
                "in-memory backend marked unavailable".to_string(),
            ))
        }
    }
}

#[async_trait]
impl MemoryBackend for InMemoryBackend {
    async fn load_raw(&self, persona_id: &str) -> MemoryResult<RawDocument> {
        self.ensure_available()?;
        Ok(match self.documents.lock().get(persona_id) {
            Some(document) => RawDocument::Present(document.clone()),
            None => RawDocument::Missing,
        })
    }

    async fn save_raw(&self, persona_id: &str, document: &str) -> MemoryResult<u64> {
        self.ensure_available()?;
        self.documents
            .lock()
            .insert(persona_id.to_string(), document.to_string());
        Ok(document.len() as u64)
    }

    async fn append_archive(&self, persona_id: &str, entries: &[WorkingEntry]) -> MemoryResult<()> {
        self.ensure_available()?;
        self.archives
            .lock()
            .entry(persona_id.to_string())
            .or_default()
            .extend_from_slice(entries);
        Ok(())
    }

    async fn quarantine(&self, persona_id: &str, fragments: &[String]) -> MemoryResult<()> {
        self.ensure_available()?;
        self.quarantined
            .lock()
            .entry(persona_id.to_string())
            .or_default()
            .extend_from_slice(fragments);
        Ok(())
    }

    async fn personas(&self) -> MemoryResult<Vec<String>> {
        self.ensure_available()?;
        let mut ids = self.documents.lock().keys().cloned().collect::<Vec<_>>();
        ids.sort();
        Ok(ids)
    }

    async fn size_bytes(&self, persona_id: &str) -> MemoryResult<u64> {
        self.ensure_available()?;
        Ok(self
            .documents
            .lock()
            .get(persona_id)
            .map(|document| document.len() as u64)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unavailable_backend_reports_storage_unavailable() {
        let backend = InMemoryBackend::new();
        backend.set_available(false);
        assert!(matches!(
            backend.load_raw("jane").await,
            Err(MemoryError::StorageUnavailable(_))
        ));
        backend.set_available(true);
        assert_eq!(backend.load_raw("jane").await.unwrap(), RawDocument::Missing);
    }

    #[tokio::test]
    async fn save_then_load_and_size() {
        let backend = InMemoryBackend::new();
        let written = backend.save_raw("jane", "{}").await.unwrap();
        assert_eq!(written, 2);
        assert_eq!(backend.size_bytes("jane").await.unwrap(), 2);
        assert_eq!(
            backend.load_raw("jane").await.unwrap(),
            RawDocument::Present("{}".to_string())
        );
        assert_eq!(backend.personas().await.unwrap(), vec!["jane".to_string()]);
    }
}
