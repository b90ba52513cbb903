//! Position resolution
//!
//! Maps a candidate's quoted text back onto absolute document offsets. A quote
//! is located verbatim first, then with whitespace runs collapsed on both
//! sides. Anything still not found is a hallucinated quote and is dropped;
//! nothing unlocatable ever reaches verification.

use crate::types::{CandidateAnnotation, MatchKind, ResolvedCandidate, RunDiagnostics, TextChunk};
use tracing::debug;

/// Resolve one candidate against the chunk it was generated from
pub fn resolve_candidate(
    candidate: &CandidateAnnotation,
    chunk: &TextChunk,
) -> Option<ResolvedCandidate> {
    let (local_start, local_end, match_kind) = locate(&candidate.quoted_text, &chunk.text)?;

    let highlighted_text: String = chunk
        .text
        .chars()
        .skip(local_start)
        .take(local_end - local_start)
        .collect();

    Some(ResolvedCandidate {
        candidate: candidate.clone(),
        start_offset: chunk.start_offset + local_start,
        end_offset: chunk.start_offset + local_end,
        highlighted_text,
        match_kind,
    })
}

/// Resolve a chunk's candidates, counting discards and fuzzy matches
pub fn resolve_candidates(
    candidates: &[CandidateAnnotation],
    chunk: &TextChunk,
    diagnostics: &mut RunDiagnostics,
) -> Vec<ResolvedCandidate> {
    let mut resolved = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        match resolve_candidate(candidate, chunk) {
            Some(r) => {
                if r.match_kind == MatchKind::Normalized {
                    diagnostics.fuzzy_matches += 1;
                }
                resolved.push(r);
            }
            None => {
                diagnostics.hallucinated_discards += 1;
                debug!(
                    "Discarding unlocatable quote in {}: {:?}",
                    chunk.id, candidate.quoted_text
                );
            }
        }
    }
    resolved
}

/// Local char range of `quote` inside `text`
fn locate(quote: &str, text: &str) -> Option<(usize, usize, MatchKind)> {
    let trimmed = quote.trim();
    if trimmed.is_empty() {
        return None;
    }

    if trimmed.len() == quote.len() {
        if let Some(byte_idx) = text.find(quote) {
            let start = text[..byte_idx].chars().count();
            return Some((start, start + quote.chars().count(), MatchKind::Exact));
        }
    }

    locate_normalized(trimmed, text).map(|(s, e)| (s, e, MatchKind::Normalized))
}

/// Whitespace-insensitive search; `quote` must be trimmed and non-empty
fn locate_normalized(quote: &str, text: &str) -> Option<(usize, usize)> {
    let needle = quote.split_whitespace().collect::<Vec<_>>().join(" ");

    // Collapsed haystack plus, per collapsed char, its char index in `text`
    let mut haystack = String::with_capacity(text.len());
    let mut origin = Vec::with_capacity(text.len());
    let mut in_space = false;
    for (idx, c) in text.chars().enumerate() {
        if c.is_whitespace() {
            if !in_space {
                haystack.push(' ');
                origin.push(idx);
            }
            in_space = true;
        } else {
            haystack.push(c);
            origin.push(idx);
            in_space = false;
        }
    }

    let byte_idx = haystack.find(&needle)?;
    let first = haystack[..byte_idx].chars().count();
    let last = first + needle.chars().count() - 1;
    Some((origin[first], origin[last] + 1))
}
