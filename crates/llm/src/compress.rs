//! Token-bounded context summaries for cascade handoff.

use serde::Serialize;

const SEPARATOR: &str = "\n";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompressedContext {
    pub summary: String,
    /// Number of memories kept in the summary.
    pub compressed_count: usize,
    /// Number of memories offered.
    pub memory_count: usize,
    /// `true` iff some memories were dropped.
    pub context_compressed: bool,
}

impl CompressedContext {
    /// Share of memories that survived compression; 1.0 for empty input.
    pub fn ratio(&self) -> f64 {
        if self.memory_count == 0 {
            1.0
        } else {
            self.compressed_count as f64 / self.memory_count as f64
        }
    }
}

/// Naive token estimate: four characters per token.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

/// Keep the most recent memories whose joined text stays within `max_tokens`.
///
/// `memories` is ordered oldest first.  Selection walks backwards and stops
/// at the first memory that would overflow the budget, so the summary is
/// always a contiguous recent suffix rendered in chronological order.
pub fn compress(memories: &[String], max_tokens: usize) -> CompressedContext {
    let mut kept_chars = 0usize;
    let mut kept = 0usize;

    for memory in memories.iter().rev() {
        let separator = if kept == 0 { 0 } else { SEPARATOR.len() };
        let next = kept_chars + separator + memory.chars().count();
        if next / 4 > max_tokens {
            break;
        }
        kept_chars = next;
        kept += 1;
    }

    let start = memories.len() - kept;
    CompressedContext {
        summary: memories[start..].join(SEPARATOR),
        compressed_count: kept,
        memory_count: memories.len(),
        context_compressed: kept < memories.len(),
    }
}
