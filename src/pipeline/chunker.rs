//! Document chunking
//!
//! Splits a document into overlapping windows with absolute char offsets.
//! Each window ends at the last sentence boundary inside a small lookback
//! region before the target size, or at the target size when there is none.
//! The next window starts `overlap` characters before the previous cut, so
//! consecutive chunks always share exactly `overlap` characters and the
//! chunks cover the whole document with no gaps.

use crate::config::ChunkingSettings;
use crate::types::{SourceDocument, TextChunk};
use once_cell::sync::Lazy;
use regex::Regex;
use ropey::Rope;
use tracing::debug;

static MARKDOWN_HEADING: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s{0,3}#{1,6}\s+(\S.*?)\s*#*\s*$").unwrap());

/// Split a document into overlapping chunks
pub fn chunk_document(doc: &SourceDocument, settings: &ChunkingSettings) -> Vec<TextChunk> {
    let rope = doc.rope();
    let len = rope.len_chars();
    if len == 0 {
        return Vec::new();
    }

    let window = settings.window_size.max(1);
    let headings = find_headings(rope);
    let mut chunks = Vec::new();
    let mut start = 0usize;

    loop {
        let end = if len - start <= window {
            len
        } else {
            find_cut(rope, start, settings)
        };

        let index = chunks.len();
        chunks.push(TextChunk {
            id: format!("chunk-{:04}", index),
            index,
            document_id: doc.id().to_string(),
            text: rope.slice(start..end).to_string(),
            start_offset: start,
            end_offset: end,
            section_title: section_for(&headings, start),
        });

        if end == len {
            break;
        }
        start = end.saturating_sub(settings.overlap).max(start + 1);
    }

    debug!(
        "Chunked document {} ({} chars) into {} chunks",
        doc.id(),
        len,
        chunks.len()
    );
    chunks
}

/// Cut point for the window starting at `start`; requires `start + window < len`
fn find_cut(rope: &Rope, start: usize, settings: &ChunkingSettings) -> usize {
    let hard = start + settings.window_size.max(1);
    // Keep the next start strictly after this one
    let floor = hard
        .saturating_sub(settings.lookback)
        .max(start + settings.overlap + 1);

    if floor <= hard {
        for cut in (floor..=hard).rev() {
            if is_sentence_end(rope.char(cut - 1)) && is_break(rope.char(cut)) {
                return cut;
            }
        }
    }
    hard
}

fn is_sentence_end(c: char) -> bool {
    matches!(c, '.' | '?' | '!')
}

fn is_break(c: char) -> bool {
    matches!(c, ' ' | '\n' | '\r')
}

/// Heading lines as (char offset, title), in document order
fn find_headings(rope: &Rope) -> Vec<(usize, String)> {
    let mut headings = Vec::new();
    let mut offset = 0usize;

    for line in rope.lines() {
        let line_len = line.len_chars();
        let text = line.to_string();
        if let Some(title) = heading_title(&text) {
            headings.push((offset, title));
        }
        offset += line_len;
    }
    headings
}

fn heading_title(line: &str) -> Option<String> {
    if let Some(caps) = MARKDOWN_HEADING.captures(line) {
        return caps.get(1).map(|m| m.as_str().to_string());
    }

    let trimmed = line.trim();
    let letters = trimmed.chars().filter(|c| c.is_alphabetic()).count();
    let short = (3..=80).contains(&trimmed.chars().count());
    if short && letters >= 3 && !trimmed.chars().any(char::is_lowercase) {
        return Some(trimmed.to_string());
    }
    None
}

fn section_for(headings: &[(usize, String)], start: usize) -> Option<String> {
    let idx = headings.partition_point(|(offset, _)| *offset <= start);
    idx.checked_sub(1).map(|i| headings[i].1.clone())
}
