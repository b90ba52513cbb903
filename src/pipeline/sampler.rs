//! Thoroughness sampling
//!
//! Picks which chunks a run analyzes. Selection takes the midpoint of each of
//! `budget` equal strata over the chunk list, so picks are deterministic for a
//! given chunk count and spread across the whole document.

use crate::config::SamplingSettings;
use crate::types::{TextChunk, Thoroughness};

/// Indices of the chunks to analyze, ascending
///
/// `budget: None` or a budget at least as large as `chunk_count` selects
/// every chunk.
pub fn select_indices(chunk_count: usize, budget: Option<usize>) -> Vec<usize> {
    match budget {
        Some(budget) if budget < chunk_count => {
            if budget == 0 {
                return Vec::new();
            }
            // Midpoint of stratum i: floor((2i + 1) * n / 2b); distinct because n > b
            (0..budget)
                .map(|i| (2 * i + 1) * chunk_count / (2 * budget))
                .collect()
        }
        _ => (0..chunk_count).collect(),
    }
}

/// Sample chunks for a thoroughness level
pub fn sample_chunks(
    chunks: &[TextChunk],
    thoroughness: Thoroughness,
    settings: &SamplingSettings,
) -> Vec<TextChunk> {
    select_indices(chunks.len(), settings.budget(thoroughness))
        .into_iter()
        .map(|i| chunks[i].clone())
        .collect()
}
