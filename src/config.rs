//! Pipeline configuration
//!
//! TOML format in `.annotext/config.toml`:
//!
//! ```toml
//! [chunking]
//! window_size = 500
//! overlap = 50
//! lookback = 100
//!
//! [sampling]
//! quick = 10
//! standard = 30
//! thorough = 100
//!
//! [concurrency]
//! chunk_workers = 4
//! prompt_workers = 8
//! document_workers = 2
//!
//! [retry]
//! max_retries = 3
//! base_delay_ms = 1000
//! timeout_secs = 60
//!
//! [[providers]]
//! kind = "anthropic"
//! model = "claude-3-5-haiku-20241022"
//! api_key_env = "ANTHROPIC_API_KEY"
//! ```
//!
//! Every section is optional; missing values fall back to defaults.

use crate::error::{AnnotextError, Result};
use crate::pipeline::multi_prompt::MAX_PROMPTS;
use crate::types::Thoroughness;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub chunking: ChunkingSettings,

    #[serde(default)]
    pub sampling: SamplingSettings,

    #[serde(default)]
    pub generation: GenerationSettings,

    #[serde(default)]
    pub concurrency: ConcurrencySettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub verification: VerificationSettings,

    /// Completion providers in fallback order
    #[serde(default = "default_providers")]
    pub providers: Vec<ProviderSettings>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunking: ChunkingSettings::default(),
            sampling: SamplingSettings::default(),
            generation: GenerationSettings::default(),
            concurrency: ConcurrencySettings::default(),
            retry: RetrySettings::default(),
            verification: VerificationSettings::default(),
            providers: default_providers(),
        }
    }
}

/// Chunker window settings (all in characters)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkingSettings {
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    #[serde(default = "default_overlap")]
    pub overlap: usize,

    /// How far back from the window end to look for a sentence boundary
    #[serde(default = "default_lookback")]
    pub lookback: usize,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            overlap: default_overlap(),
            lookback: default_lookback(),
        }
    }
}

/// Approximate chunk budgets per thoroughness level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SamplingSettings {
    #[serde(default = "default_quick")]
    pub quick: usize,

    #[serde(default = "default_standard")]
    pub standard: usize,

    #[serde(default = "default_thorough")]
    pub thorough: usize,
}

impl Default for SamplingSettings {
    fn default() -> Self {
        Self {
            quick: default_quick(),
            standard: default_standard(),
            thorough: default_thorough(),
        }
    }
}

impl SamplingSettings {
    /// Chunk budget for a level; `None` means every chunk
    pub fn budget(&self, thoroughness: Thoroughness) -> Option<usize> {
        match thoroughness {
            Thoroughness::Quick => Some(self.quick),
            Thoroughness::Standard => Some(self.standard),
            Thoroughness::Thorough => Some(self.thorough),
            Thoroughness::Exhaustive => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct GenerationSettings {
    /// Upper bound on candidates kept per chunk (at most 5)
    #[serde(default = "default_max_candidates")]
    pub max_candidates_per_chunk: usize,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            max_candidates_per_chunk: default_max_candidates(),
        }
    }
}

/// Worker pool sizes; these track provider rate limits, not core counts
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConcurrencySettings {
    /// Concurrent chunk pipelines per run
    #[serde(default = "default_chunk_workers")]
    pub chunk_workers: usize,

    /// Concurrent runs per multi-prompt analysis; below the prompt count,
    /// later prompts wait for a free slot
    #[serde(default = "default_prompt_workers")]
    pub prompt_workers: usize,

    /// Concurrent documents per batch
    #[serde(default = "default_document_workers")]
    pub document_workers: usize,
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        Self {
            chunk_workers: default_chunk_workers(),
            prompt_workers: default_prompt_workers(),
            document_workers: default_document_workers(),
        }
    }
}

/// Per-call timeout and backoff
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetrySettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl RetrySettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Delay before retry number `attempt` (0-based), capped at `max_delay_ms`
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2_u64.saturating_pow(attempt);
        Duration::from_millis(
            self.base_delay_ms
                .saturating_mul(factor)
                .min(self.max_delay_ms),
        )
    }
}

/// Hard and soft verifier settings
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerificationSettings {
    /// Total chunk-context characters shared by all candidates in one request
    #[serde(default = "default_context_budget")]
    pub context_budget_chars: usize,

    #[serde(default = "default_min_context")]
    pub min_context_chars: usize,

    #[serde(default = "default_max_context")]
    pub max_context_chars: usize,

    /// Allow the soft pass to snap truncated spans to sentence boundaries
    #[serde(default = "default_true")]
    pub refine_boundaries: bool,

    /// Furthest a boundary may move during refinement
    #[serde(default = "default_max_snap")]
    pub max_snap_chars: usize,
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self {
            context_budget_chars: default_context_budget(),
            min_context_chars: default_min_context(),
            max_context_chars: default_max_context(),
            refine_boundaries: true,
            max_snap_chars: default_max_snap(),
        }
    }
}

/// Completion provider kind
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Anthropic,
    OpenAi,
}

/// One completion provider entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderSettings {
    pub kind: ProviderKind,

    pub model: String,

    /// Environment variable holding the API key
    pub api_key_env: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl ProviderSettings {
    pub fn anthropic() -> Self {
        Self {
            kind: ProviderKind::Anthropic,
            model: "claude-3-5-haiku-20241022".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }

    pub fn openai() -> Self {
        Self {
            kind: ProviderKind::OpenAi,
            model: "gpt-4o-mini".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }

    /// Resolve the API key from the configured environment variable
    pub fn api_key(&self) -> Result<String> {
        match std::env::var(&self.api_key_env) {
            Ok(key) if !key.is_empty() => Ok(key),
            _ => Err(AnnotextError::Config(format!(
                "{} not set",
                self.api_key_env
            ))),
        }
    }
}

// Default value helpers
fn default_true() -> bool {
    true
}

fn default_window_size() -> usize {
    500
}

fn default_overlap() -> usize {
    50
}

fn default_lookback() -> usize {
    100
}

fn default_quick() -> usize {
    10
}

fn default_standard() -> usize {
    30
}

fn default_thorough() -> usize {
    100
}

fn default_max_candidates() -> usize {
    5
}

fn default_chunk_workers() -> usize {
    4
}

fn default_prompt_workers() -> usize {
    MAX_PROMPTS
}

fn default_document_workers() -> usize {
    2
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    8000
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_context_budget() -> usize {
    6000
}

fn default_min_context() -> usize {
    200
}

fn default_max_context() -> usize {
    1500
}

fn default_max_snap() -> usize {
    120
}

fn default_max_tokens() -> usize {
    2048
}

fn default_temperature() -> f32 {
    0.2
}

fn default_providers() -> Vec<ProviderSettings> {
    vec![ProviderSettings::anthropic()]
}

/// Hard upper bound on candidates per chunk
pub const MAX_CANDIDATES_PER_CHUNK: usize = 5;

impl PipelineConfig {
    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("Config file not found, using defaults: {:?}", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            AnnotextError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to read config file: {}", e),
            ))
        })?;

        let config: PipelineConfig = toml::from_str(&content)?;
        config.validate()?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| AnnotextError::Config(format!("Failed to serialize config: {}", e)))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                AnnotextError::Io(std::io::Error::new(
                    e.kind(),
                    format!("Failed to create config directory: {}", e),
                ))
            })?;
        }

        std::fs::write(path, content)?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Reject settings the pipeline cannot honor
    pub fn validate(&self) -> Result<()> {
        let c = &self.chunking;
        if c.window_size == 0 {
            return Err(AnnotextError::Config("chunking.window_size must be > 0".into()));
        }
        if c.overlap >= c.window_size {
            return Err(AnnotextError::Config(format!(
                "chunking.overlap ({}) must be smaller than window_size ({})",
                c.overlap, c.window_size
            )));
        }
        if c.lookback >= c.window_size - c.overlap {
            return Err(AnnotextError::Config(format!(
                "chunking.lookback ({}) must be smaller than window_size - overlap ({})",
                c.lookback,
                c.window_size - c.overlap
            )));
        }

        let g = &self.generation;
        if g.max_candidates_per_chunk == 0 || g.max_candidates_per_chunk > MAX_CANDIDATES_PER_CHUNK {
            return Err(AnnotextError::Config(format!(
                "generation.max_candidates_per_chunk must be between 1 and {}",
                MAX_CANDIDATES_PER_CHUNK
            )));
        }

        let w = &self.concurrency;
        if w.chunk_workers == 0 || w.prompt_workers == 0 || w.document_workers == 0 {
            return Err(AnnotextError::Config("worker counts must be >= 1".into()));
        }

        let v = &self.verification;
        if v.min_context_chars > v.max_context_chars {
            return Err(AnnotextError::Config(
                "verification.min_context_chars must not exceed max_context_chars".into(),
            ));
        }

        if self.providers.is_empty() {
            return Err(AnnotextError::Config("at least one provider is required".into()));
        }

        Ok(())
    }

    /// Get default config path for a project
    pub fn default_path() -> PathBuf {
        PathBuf::from(".annotext/config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();

        assert_eq!(config.chunking.window_size, 500);
        assert_eq!(config.chunking.overlap, 50);
        assert_eq!(config.sampling.budget(Thoroughness::Quick), Some(10));
        assert_eq!(config.sampling.budget(Thoroughness::Standard), Some(30));
        assert_eq!(config.sampling.budget(Thoroughness::Thorough), Some(100));
        assert_eq!(config.sampling.budget(Thoroughness::Exhaustive), None);
        assert_eq!(config.generation.max_candidates_per_chunk, 5);
        assert_eq!(config.concurrency.prompt_workers, MAX_PROMPTS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut config = PipelineConfig::default();
        config.chunking.window_size = 800;
        config.providers.push(ProviderSettings::openai());
        config.save(&config_path).unwrap();

        assert!(config_path.exists());

        let loaded = PipelineConfig::load(&config_path).unwrap();
        assert_eq!(loaded.chunking.window_size, 800);
        assert_eq!(loaded.providers.len(), 2);
        assert_eq!(loaded.providers[1].kind, ProviderKind::OpenAi);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        std::fs::write(&config_path, "[chunking]\noverlap = 20\n").unwrap();

        let loaded = PipelineConfig::load(&config_path).unwrap();
        assert_eq!(loaded.chunking.overlap, 20);
        assert_eq!(loaded.chunking.window_size, 500);
        assert_eq!(loaded.retry.max_retries, 3);
        assert_eq!(loaded.providers[0].kind, ProviderKind::Anthropic);
    }

    #[test]
    fn test_load_nonexistent_returns_default() {
        let config = PipelineConfig::load(Path::new("/nonexistent/config.toml")).unwrap();
        assert_eq!(config.chunking.window_size, 500);
    }

    #[test]
    fn test_validation_rejects_bad_overlap() {
        let mut config = PipelineConfig::default();
        config.chunking.overlap = 500;
        assert!(matches!(config.validate(), Err(AnnotextError::Config(_))));

        let mut config = PipelineConfig::default();
        config.chunking.lookback = 450;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.generation.max_candidates_per_chunk = 6;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let retry = RetrySettings::default();
        assert_eq!(retry.backoff(0), Duration::from_millis(1000));
        assert_eq!(retry.backoff(1), Duration::from_millis(2000));
        assert_eq!(retry.backoff(2), Duration::from_millis(4000));
        assert_eq!(retry.backoff(5), Duration::from_millis(8000));
        assert_eq!(retry.backoff(80), Duration::from_millis(8000));
    }
}
