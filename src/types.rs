//! Core data types for the annotext pipeline
//!
//! This module defines the data model every pipeline stage passes along:
//! source documents, offset-tracked chunks, the candidate → resolved →
//! verified → final annotation progression, and the analysis run record that
//! groups final annotations for persistence.
//!
//! All offsets are character offsets (Unicode scalar values), never byte
//! offsets, so they stay meaningful to callers in other languages.

use chrono::{DateTime, Utc};
use ropey::Rope;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for an analysis run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Create a new random run ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a run ID from a string
    pub fn from_string(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a final annotation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AnnotationId(pub Uuid);

impl AnnotationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for AnnotationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AnnotationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable full text of a document, owned by the storage collaborator
///
/// The text is held in a rope so char-indexed slicing stays O(log n) on long
/// documents. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    id: String,
    rope: Rope,
}

impl SourceDocument {
    pub fn new(id: impl Into<String>, text: &str) -> Self {
        Self {
            id: id.into(),
            rope: Rope::from_str(text),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Length in characters
    pub fn len(&self) -> usize {
        self.rope.len_chars()
    }

    pub fn is_empty(&self) -> bool {
        self.rope.len_chars() == 0
    }

    /// True when the document has no non-whitespace content
    pub fn is_blank(&self) -> bool {
        self.rope.chars().all(char::is_whitespace)
    }

    pub fn rope(&self) -> &Rope {
        &self.rope
    }

    /// Full text as an owned string
    pub fn text(&self) -> String {
        self.rope.to_string()
    }

    /// Characters `[start, end)`, or `None` if the range is empty or out of bounds
    pub fn slice(&self, start: usize, end: usize) -> Option<String> {
        if start >= end || end > self.len() {
            return None;
        }
        Some(self.rope.slice(start..end).to_string())
    }

    pub fn char_at(&self, idx: usize) -> Option<char> {
        if idx < self.len() {
            Some(self.rope.char(idx))
        } else {
            None
        }
    }
}

/// Contiguous, offset-tracked window of document text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChunk {
    /// Stable identifier within a run (`chunk-0003`)
    pub id: String,

    /// Position in chunk order
    pub index: usize,

    pub document_id: String,

    pub text: String,

    /// Absolute char offset of the first character
    pub start_offset: usize,

    /// Absolute char offset one past the last character
    pub end_offset: usize,

    /// Nearest heading at or before the chunk start
    pub section_title: Option<String>,
}

impl TextChunk {
    /// Length in characters (always `end_offset - start_offset`)
    pub fn len_chars(&self) -> usize {
        self.end_offset - self.start_offset
    }
}

/// Annotation category
///
/// `UserNote` exists for annotations created by people; the generator can
/// never produce it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationCategory {
    /// A passage central to the stated intent
    KeyPassage,

    /// A claim or line of reasoning
    Argument,

    /// Data, examples or citations supporting a claim
    Evidence,

    /// How the work was done
    Methodology,

    /// Free-form note written by a user
    UserNote,
}

impl AnnotationCategory {
    /// Categories the generator is allowed to emit
    pub const GENERATED: [AnnotationCategory; 4] = [
        AnnotationCategory::KeyPassage,
        AnnotationCategory::Argument,
        AnnotationCategory::Evidence,
        AnnotationCategory::Methodology,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AnnotationCategory::KeyPassage => "key_passage",
            AnnotationCategory::Argument => "argument",
            AnnotationCategory::Evidence => "evidence",
            AnnotationCategory::Methodology => "methodology",
            AnnotationCategory::UserNote => "user_note",
        }
    }

    pub fn is_generator_producible(&self) -> bool {
        !matches!(self, AnnotationCategory::UserNote)
    }

    /// Lenient parse of model output, rejecting anything the generator may not produce
    pub fn parse_generated(raw: &str) -> Option<Self> {
        raw.parse::<Self>()
            .ok()
            .filter(AnnotationCategory::is_generator_producible)
    }
}

impl fmt::Display for AnnotationCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnnotationCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .map(|c| match c {
                ' ' | '-' => '_',
                c => c.to_ascii_lowercase(),
            })
            .collect();
        match normalized.as_str() {
            "key_passage" | "keypassage" => Ok(AnnotationCategory::KeyPassage),
            "argument" => Ok(AnnotationCategory::Argument),
            "evidence" => Ok(AnnotationCategory::Evidence),
            "methodology" => Ok(AnnotationCategory::Methodology),
            "user_note" | "usernote" | "note" => Ok(AnnotationCategory::UserNote),
            _ => Err(format!("unknown annotation category: {}", s.trim())),
        }
    }
}

/// Provenance tag for multi-prompt runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTag {
    pub index: usize,
    pub color: String,
}

/// Unverified, unpositioned highlight proposed by the generator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateAnnotation {
    pub chunk_id: String,
    pub quoted_text: String,
    pub category: AnnotationCategory,
    pub note: String,
    pub prompt_index: Option<usize>,
    pub prompt_color: Option<String>,
}

/// How a candidate's quote was located in its chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    /// Verbatim substring
    Exact,
    /// Matched after collapsing whitespace runs
    Normalized,
}

/// Candidate mapped onto absolute document offsets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedCandidate {
    pub candidate: CandidateAnnotation,
    pub start_offset: usize,
    pub end_offset: usize,
    /// Exact source text at `[start_offset, end_offset)`
    pub highlighted_text: String,
    pub match_kind: MatchKind,
}

/// Hard verifier outcome for one candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerifierDecision {
    Approved,
    Rejected,
    Reclassified,
}

/// Resolved candidate after the hard verifier pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiedCandidate {
    pub resolved: ResolvedCandidate,
    pub decision: VerifierDecision,
    pub revised_category: Option<AnnotationCategory>,
    pub reason: Option<String>,
}

impl VerifiedCandidate {
    /// Approved and reclassified candidates continue to the soft pass
    pub fn is_accepted(&self) -> bool {
        !matches!(self.decision, VerifierDecision::Rejected)
    }

    /// Category after any reclassification
    pub fn effective_category(&self) -> AnnotationCategory {
        self.revised_category
            .unwrap_or(self.resolved.candidate.category)
    }
}

/// Text quality issues typical of OCR-extracted sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OcrArtifact {
    ReplacementCharacter,
    LineBreakHyphenation,
    SpacedUppercaseRun,
    NonAsciiGlyphs,
}

/// Terminal pipeline output handed to storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalAnnotation {
    pub id: AnnotationId,
    pub document_id: String,
    pub analysis_run_id: RunId,
    pub chunk_id: String,
    /// Exact document text at `[final_start, final_end)`
    pub highlighted_text: String,
    pub category: AnnotationCategory,
    pub note: String,
    /// Heuristic confidence in [0, 1]
    pub confidence_score: f32,
    pub final_start: usize,
    pub final_end: usize,
    pub prompt_index: Option<usize>,
    pub prompt_color: Option<String>,
    pub match_kind: MatchKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ocr_artifacts: Vec<OcrArtifact>,
    pub created_at: DateTime<Utc>,
}

/// How many chunks a run samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Thoroughness {
    Quick,
    #[default]
    Standard,
    Thorough,
    Exhaustive,
}

impl Thoroughness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Thoroughness::Quick => "quick",
            Thoroughness::Standard => "standard",
            Thoroughness::Thorough => "thorough",
            Thoroughness::Exhaustive => "exhaustive",
        }
    }
}

impl fmt::Display for Thoroughness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Thoroughness {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "quick" => Ok(Thoroughness::Quick),
            "standard" => Ok(Thoroughness::Standard),
            "thorough" => Ok(Thoroughness::Thorough),
            "exhaustive" => Ok(Thoroughness::Exhaustive),
            other => Err(format!(
                "unknown thoroughness '{}' (expected quick, standard, thorough or exhaustive)",
                other
            )),
        }
    }
}

/// One generator → hard verifier → soft verifier pass over a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRun {
    pub id: RunId,
    pub document_id: String,
    /// Research intent the run extracts against
    pub intent: String,
    /// Explicit prompt in multi-prompt mode
    pub prompt_text: Option<String>,
    pub prompt_index: Option<usize>,
    pub prompt_color: Option<String>,
    pub thoroughness: Thoroughness,
    pub created_at: DateTime<Utc>,
}

impl AnalysisRun {
    pub fn new(document_id: impl Into<String>, intent: impl Into<String>, thoroughness: Thoroughness) -> Self {
        Self {
            id: RunId::new(),
            document_id: document_id.into(),
            intent: intent.into(),
            prompt_text: None,
            prompt_index: None,
            prompt_color: None,
            thoroughness,
            created_at: Utc::now(),
        }
    }

    /// Attach multi-prompt provenance
    pub fn with_prompt(mut self, tag: &PromptTag) -> Self {
        self.prompt_text = Some(self.intent.clone());
        self.prompt_index = Some(tag.index);
        self.prompt_color = Some(tag.color.clone());
        self
    }

    pub fn prompt_tag(&self) -> Option<PromptTag> {
        match (self.prompt_index, &self.prompt_color) {
            (Some(index), Some(color)) => Some(PromptTag {
                index,
                color: color.clone(),
            }),
            _ => None,
        }
    }
}

/// Pipeline stage of a run (and of each chunk inside it)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStage {
    Sampling,
    Generating,
    Resolving,
    HardVerifying,
    SoftVerifying,
    Complete,
    Failed,
    Cancelled,
}

impl RunStage {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStage::Complete | RunStage::Failed | RunStage::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStage::Sampling => "sampling",
            RunStage::Generating => "generating",
            RunStage::Resolving => "resolving",
            RunStage::HardVerifying => "hard-verifying",
            RunStage::SoftVerifying => "soft-verifying",
            RunStage::Complete => "complete",
            RunStage::Failed => "failed",
            RunStage::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A chunk whose gateway call exhausted its retries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFailure {
    pub chunk_id: String,
    pub stage: RunStage,
    pub reason: String,
}

/// Counters for everything the pipeline absorbs without failing the run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunDiagnostics {
    pub total_chunks: usize,
    pub sampled_chunks: usize,
    pub completed_chunks: usize,
    pub failed_chunks: usize,
    pub cancelled_chunks: usize,
    pub candidates_generated: usize,
    pub malformed_candidates: usize,
    pub hallucinated_discards: usize,
    pub fuzzy_matches: usize,
    pub approved: usize,
    pub rejected: usize,
    pub reclassified: usize,
    pub unreviewed: usize,
    pub soft_fallbacks: usize,
    pub refinements_applied: usize,
    pub refinements_refused: usize,
    pub failures: Vec<ChunkFailure>,
}

impl RunDiagnostics {
    /// Fold per-chunk counters into the run totals
    pub fn absorb(&mut self, other: &RunDiagnostics) {
        self.candidates_generated += other.candidates_generated;
        self.malformed_candidates += other.malformed_candidates;
        self.hallucinated_discards += other.hallucinated_discards;
        self.fuzzy_matches += other.fuzzy_matches;
        self.approved += other.approved;
        self.rejected += other.rejected;
        self.reclassified += other.reclassified;
        self.unreviewed += other.unreviewed;
        self.soft_fallbacks += other.soft_fallbacks;
        self.refinements_applied += other.refinements_applied;
        self.refinements_refused += other.refinements_refused;
        self.failures.extend(other.failures.iter().cloned());
    }
}

/// Outcome of one analysis run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run: AnalysisRun,
    /// Terminal stage: complete or cancelled
    pub status: RunStage,
    pub annotations: Vec<FinalAnnotation>,
    pub diagnostics: RunDiagnostics,
}

impl RunReport {
    /// True when some sampled chunks failed but the run still completed
    pub fn is_partial(&self) -> bool {
        self.diagnostics.failed_chunks > 0 || self.status == RunStage::Cancelled
    }
}
