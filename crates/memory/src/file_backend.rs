//! One JSON document per persona on the local filesystem.
//!
//! Layout under the data directory:
//!
//! | File                        | Contents                                   |
//! |-----------------------------|--------------------------------------------|
//! | `<persona>.json`            | The live [`crate::PersonaMemory`] document |
//! | `<persona>.archive.jsonl`   | Archived working entries, one per line     |
//! | `<persona>.json.corrupt`    | Raw fragments that failed to decode        |

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::backend::{MemoryBackend, RawDocument};
use crate::error::{MemoryError, MemoryResult};
use crate::schema::WorkingEntry;

#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn document_path(&self, persona_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(persona_id)))
    }

    pub fn archive_path(&self, persona_id: &str) -> PathBuf {
        self.dir.join(format!("{}.archive.jsonl", file_stem(persona_id)))
    }

    fn corrupt_path(&self, persona_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json.corrupt", file_stem(persona_id)))
    }

    async fn ensure_dir(&self) -> MemoryResult<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|err| unavailable(&self.dir, err))
    }

    async fn append_lines(&self, path: &Path, lines: &[String]) -> MemoryResult<()> {
        self.ensure_dir().await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|err| unavailable(path, err))?;
        for line in lines {
            file.write_all(line.as_bytes()).await?;
            file.write_all(b"\n").await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
}

/// Bytes kept verbatim in file names.  Everything else, `%` and `.`
/// included, is percent-encoded.
const STEM_SET: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_');
const EMPTY_STEM: &str = "%";

/// Persona ids become file names.  The encoding is reversible, so distinct
/// ids never share a document and no id can escape the data directory.
fn file_stem(persona_id: &str) -> String {
    if persona_id.is_empty() {
        return EMPTY_STEM.to_string();
    }
    utf8_percent_encode(persona_id, STEM_SET).to_string()
}

fn persona_id_from_stem(stem: &str) -> Option<String> {
    if stem == EMPTY_STEM {
        return Some(String::new());
    }
    percent_decode_str(stem)
        .decode_utf8()
        .ok()
        .map(|id| id.into_owned())
}

fn unavailable(path: &Path, err: std::io::Error) -> MemoryError {
    MemoryError::StorageUnavailable(format!("{}: {err}", path.display()))
}

#[async_trait]
impl MemoryBackend for FileBackend {
    async fn load_raw(&self, persona_id: &str) -> MemoryResult<RawDocument> {
        let path = self.document_path(persona_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => Ok(RawDocument::Present(raw)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RawDocument::Missing),
            Err(err) if err.kind() == ErrorKind::InvalidData => {
                // Not UTF-8: hand the decoder something it will reject as corrupt.
                warn!(path = %path.display(), "memory document is not valid UTF-8");
                Ok(RawDocument::Present(String::new()))
            }
            Err(err) => Err(unavailable(&path, err)),
        }
    }

    /// Crash-safety: the document is written to a `.tmp` sibling, fsync'd,
    /// then renamed over the original.  A crash before the rename leaves the
    /// previous document untouched.
    async fn save_raw(&self, persona_id: &str, document: &str) -> MemoryResult<u64> {
        self.ensure_dir().await?;
        let path = self.document_path(persona_id);
        let tmp_path = path.with_extension("json.tmp");

        let write_result: MemoryResult<()> = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)
                .await?;
            file.write_all(document.as_bytes()).await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok(())
        }
        .await;

        if let Err(err) = write_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        if let Err(err) = tokio::fs::rename(&tmp_path, &path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }

        debug!(persona_id, bytes = document.len(), "memory document saved");
        Ok(document.len() as u64)
    }

    async fn append_archive(&self, persona_id: &str, entries: &[WorkingEntry]) -> MemoryResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let lines = entries
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;
        self.append_lines(&self.archive_path(persona_id), &lines).await
    }

    async fn quarantine(&self, persona_id: &str, fragments: &[String]) -> MemoryResult<()> {
        if fragments.is_empty() {
            return Ok(());
        }
        warn!(
            persona_id,
            fragments = fragments.len(),
            "quarantining undecodable memory fragments, see .corrupt sidecar"
        );
        self.append_lines(&self.corrupt_path(persona_id), fragments).await
    }

    async fn personas(&self) -> MemoryResult<Vec<String>> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(unavailable(&self.dir, err)),
        };

        let mut ids = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(stem) = name.strip_suffix(".json") else {
                continue;
            };
            match persona_id_from_stem(stem) {
                Some(id) => ids.push(id),
                None => warn!(file = %name, "skipping memory document with undecodable name"),
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn size_bytes(&self, persona_id: &str) -> MemoryResult<u64> {
        let path = self.document_path(persona_id);
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.len()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(0),
            Err(err) => Err(unavailable(&path, err)),
        }
    }
}
