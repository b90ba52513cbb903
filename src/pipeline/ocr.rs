//! OCR artifact detection
//!
//! Flags text-quality problems typical of scanned sources so callers can warn
//! before quoting a highlight verbatim.

use crate::types::OcrArtifact;
use once_cell::sync::Lazy;
use regex::Regex;

static HYPHENATED_BREAK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[a-zA-Z]{1,2}-\s+[a-zA-Z]{2,}\b").unwrap());

static SPACED_UPPERCASE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Z](?:\s+[A-Z]){5,}\b").unwrap());

static NON_ASCII: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^\x09\x0A\x0D\x20-\x7E]").unwrap());

/// Artifacts present in `text`, in a fixed order
pub fn detect_ocr_artifacts(text: &str) -> Vec<OcrArtifact> {
    let mut found = Vec::new();
    if text.is_empty() {
        return found;
    }

    if text.contains('\u{FFFD}') {
        found.push(OcrArtifact::ReplacementCharacter);
    }
    if HYPHENATED_BREAK.is_match(text) {
        found.push(OcrArtifact::LineBreakHyphenation);
    }
    if SPACED_UPPERCASE.is_match(text) {
        found.push(OcrArtifact::SpacedUppercaseRun);
    }
    if NON_ASCII.is_match(text) {
        found.push(OcrArtifact::NonAsciiGlyphs);
    }
    found
}
