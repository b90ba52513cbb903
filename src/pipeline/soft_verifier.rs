//! Soft verification and boundary refinement
//!
//! Scores accepted candidates against the intent and turns them into final
//! annotations. When the model flags a quote as cut mid-sentence, the span may
//! be widened to the nearest sentence boundaries. A widened span must still
//! contain the original quote and lie inside the document, and its text is
//! re-read from the document; otherwise the original span is kept.
//!
//! If the scoring call fails, or a score is missing or garbled, confidence
//! falls back to keyword overlap between intent and passage.

use super::ocr::detect_ocr_artifacts;
use super::prompts::{soft_verification_request, ReviewItem};
use super::PassContext;
use crate::config::VerificationSettings;
use crate::error::{AnnotextError, Result};
use crate::services::complete_with_retry;
use crate::types::{
    AnalysisRun, AnnotationId, FinalAnnotation, RunDiagnostics, SourceDocument, VerifiedCandidate,
};
use chrono::Utc;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Heuristic confidences live in this range
const FALLBACK_FLOOR: f32 = 0.1;
const FALLBACK_CEILING: f32 = 0.6;

/// Model judgement for one candidate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SoftScore {
    pub confidence: Option<f32>,
    pub truncated: bool,
}

/// Score accepted candidates and produce final annotations
///
/// Rejected candidates in `verified` are ignored. Only cancellation surfaces
/// as an error; any other scoring failure degrades to heuristic confidence.
pub async fn finalize_candidates(
    ctx: PassContext<'_>,
    doc: &SourceDocument,
    run: &AnalysisRun,
    verified: Vec<VerifiedCandidate>,
    settings: &VerificationSettings,
    diagnostics: &mut RunDiagnostics,
) -> Result<Vec<FinalAnnotation>> {
    let accepted: Vec<VerifiedCandidate> =
        verified.into_iter().filter(|v| v.is_accepted()).collect();
    if accepted.is_empty() {
        return Ok(Vec::new());
    }

    let items: Vec<ReviewItem<'_>> = accepted
        .iter()
        .map(|v| ReviewItem {
            category: v.effective_category(),
            quote: &v.resolved.highlighted_text,
            note: &v.resolved.candidate.note,
            context: String::new(),
        })
        .collect();
    let request = soft_verification_request(ctx.intent, &items);

    let scores = match complete_with_retry(ctx.gateway, &request, ctx.policy, ctx.cancel).await {
        Ok(value) => parse_scores(&value),
        Err(AnnotextError::Cancelled) => return Err(AnnotextError::Cancelled),
        Err(e) => {
            warn!("Soft verification failed, using heuristic confidence: {}", e);
            HashMap::new()
        }
    };

    let mut finals = Vec::with_capacity(accepted.len());
    for (i, candidate) in accepted.into_iter().enumerate() {
        let score = scores.get(&i).copied().unwrap_or(SoftScore {
            confidence: None,
            truncated: false,
        });
        if let Some(annotation) = finalize_one(doc, run, candidate, score, settings, diagnostics) {
            finals.push(annotation);
        }
    }
    Ok(finals)
}

fn finalize_one(
    doc: &SourceDocument,
    run: &AnalysisRun,
    verified: VerifiedCandidate,
    score: SoftScore,
    settings: &VerificationSettings,
    diagnostics: &mut RunDiagnostics,
) -> Option<FinalAnnotation> {
    let resolved = &verified.resolved;
    let (mut start, mut end) = (resolved.start_offset, resolved.end_offset);

    if score.truncated && settings.refine_boundaries {
        match refine_span(doc, start, end, &resolved.highlighted_text, settings.max_snap_chars) {
            Some((s, e)) => {
                diagnostics.refinements_applied += 1;
                start = s;
                end = e;
            }
            None => diagnostics.refinements_refused += 1,
        }
    }

    // Highlight text always comes from the document itself
    let Some(highlighted_text) = doc.slice(start, end) else {
        warn!(
            "Dropping annotation with out-of-range span [{}, {}) in {}",
            start,
            end,
            doc.id()
        );
        return None;
    };

    let confidence_score = match score.confidence {
        Some(c) => c,
        None => {
            diagnostics.soft_fallbacks += 1;
            let text = format!("{} {}", highlighted_text, resolved.candidate.note);
            heuristic_confidence(&run.intent, &text)
        }
    };

    Some(FinalAnnotation {
        id: AnnotationId::new(),
        document_id: doc.id().to_string(),
        analysis_run_id: run.id,
        chunk_id: resolved.candidate.chunk_id.clone(),
        ocr_artifacts: detect_ocr_artifacts(&highlighted_text),
        highlighted_text,
        category: verified.effective_category(),
        note: resolved.candidate.note.clone(),
        confidence_score,
        final_start: start,
        final_end: end,
        prompt_index: resolved.candidate.prompt_index,
        prompt_color: resolved.candidate.prompt_color.clone(),
        match_kind: resolved.match_kind,
        created_at: Utc::now(),
    })
}

/// Parse `{"scores": [{"index", "confidence", "truncated"}]}` keyed by index
///
/// Confidences are clamped to [0, 1]; non-numeric or non-finite values parse
/// as missing.
pub fn parse_scores(value: &Value) -> HashMap<usize, SoftScore> {
    let entries = match value {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => match map.get("scores") {
            Some(Value::Array(items)) => items.as_slice(),
            _ => &[],
        },
        _ => &[],
    };

    let mut scores = HashMap::new();
    for entry in entries {
        let Some(index) = entry.get("index").and_then(Value::as_u64) else {
            continue;
        };
        let confidence = entry
            .get("confidence")
            .and_then(|c| match c {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            })
            .filter(|c| c.is_finite())
            .map(|c| c.clamp(0.0, 1.0) as f32);
        let truncated = entry
            .get("truncated")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        scores.insert(
            index as usize,
            SoftScore {
                confidence,
                truncated,
            },
        );
    }
    scores
}

fn tokenize(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| t.len() >= 3)
        .map(str::to_string)
        .collect()
}

/// Share of intent keywords present in `text`
pub fn keyword_overlap(intent: &str, text: &str) -> f32 {
    let wanted = tokenize(intent);
    let present = tokenize(text);
    if wanted.is_empty() || present.is_empty() {
        return 0.0;
    }
    wanted.intersection(&present).count() as f32 / wanted.len() as f32
}

/// Keyword overlap scaled into the heuristic confidence range
pub fn heuristic_confidence(intent: &str, text: &str) -> f32 {
    FALLBACK_FLOOR + (FALLBACK_CEILING - FALLBACK_FLOOR) * keyword_overlap(intent, text)
}

fn is_terminator(c: char) -> bool {
    matches!(c, '.' | '?' | '!')
}

/// Widen `[start, end)` to sentence boundaries within `max_snap` chars
///
/// Returns `None` when neither boundary can move or the widened span fails
/// the containment check.
pub fn refine_span(
    doc: &SourceDocument,
    start: usize,
    end: usize,
    original: &str,
    max_snap: usize,
) -> Option<(usize, usize)> {
    let len = doc.len();
    if start >= end || end > len {
        return None;
    }

    let new_start = snap_start(doc, start, max_snap);
    let new_end = snap_end(doc, end, max_snap);
    if (new_start, new_end) == (start, end) {
        debug!("No sentence boundary within {} chars of [{}, {})", max_snap, start, end);
        return None;
    }

    // Re-check before accepting: inside the document, still containing the quote
    if new_start > start || new_end < end || new_start >= new_end || new_end > len {
        return None;
    }
    let widened = doc.slice(new_start, new_end)?;
    if !widened.contains(original) {
        return None;
    }
    Some((new_start, new_end))
}

fn snap_start(doc: &SourceDocument, start: usize, max_snap: usize) -> usize {
    let floor = start.saturating_sub(max_snap);
    let mut i = start;
    while i > floor {
        let prev = doc.rope().char(i - 1);
        if prev == '\n' {
            return i;
        }
        if prev.is_whitespace() && i >= 2 && is_terminator(doc.rope().char(i - 2)) {
            return skip_whitespace(doc, i, start);
        }
        i -= 1;
    }
    if i == 0 {
        0
    } else {
        start
    }
}

fn skip_whitespace(doc: &SourceDocument, mut i: usize, limit: usize) -> usize {
    while i < limit && doc.rope().char(i).is_whitespace() {
        i += 1;
    }
    i
}

fn snap_end(doc: &SourceDocument, end: usize, max_snap: usize) -> usize {
    if end > 0 && is_terminator(doc.rope().char(end - 1)) {
        return end;
    }
    let len = doc.len();
    let ceiling = (end + max_snap).min(len);
    for j in end..ceiling {
        let c = doc.rope().char(j);
        if is_terminator(c) {
            return j + 1;
        }
        if c == '\n' {
            return j;
        }
    }
    if ceiling == len {
        len
    } else {
        end
    }
}
