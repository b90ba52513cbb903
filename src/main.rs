//! Annotext - annotation extraction for long documents
//!
//! Command-line front end over a directory of plain-text documents. Runs are
//! written as JSON next to the documents (or to `--out`).

use annotext_core::pipeline::chunk_document;
use annotext_core::{
    AnnotationCategory, AnnotationService, BatchConstraints, BatchMode, BatchStatus,
    FinalAnnotation, FsStore, PipelineConfig, PromptSet, PromptSpec, RunEvent, RunReport,
    SourceDocument, Thoroughness,
};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::{self, EnvFilter};

#[derive(Parser)]
#[command(name = "annotext")]
#[command(about = "Extract classified, offset-exact highlights from long documents", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Set log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Config file (defaults to .annotext/config.toml)
    #[arg(long, env = "ANNOTEXT_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show how a file would be chunked
    Chunk {
        #[arg(long)]
        file: PathBuf,

        #[arg(long)]
        window: Option<usize>,

        #[arg(long)]
        overlap: Option<usize>,
    },

    /// Analyze one document against a research intent
    Analyze {
        /// Directory of <id>.txt documents
        #[arg(long)]
        docs: PathBuf,

        #[arg(long)]
        document: String,

        #[arg(long)]
        intent: String,

        #[arg(long, default_value = "standard")]
        thoroughness: Thoroughness,

        /// Output directory for run files (defaults to <docs>/annotations)
        #[arg(long)]
        out: Option<PathBuf>,

        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Analyze one document with several prompts at once
    Multi {
        #[arg(long)]
        docs: PathBuf,

        #[arg(long)]
        document: String,

        /// Prompt text, optionally suffixed with @#rrggbb (repeatable)
        #[arg(long = "prompt")]
        prompts: Vec<PromptSpec>,

        /// Generate the standard prompt set for a topic instead
        #[arg(long, conflicts_with = "prompts")]
        topic: Option<String>,

        #[arg(long, default_value = "")]
        thesis: String,

        #[arg(long, default_value = "")]
        goal: String,

        #[arg(long, default_value = "standard")]
        thoroughness: Thoroughness,

        #[arg(long)]
        out: Option<PathBuf>,

        #[arg(long)]
        json: bool,
    },

    /// Analyze many documents with shared constraints
    Batch {
        #[arg(long)]
        docs: PathBuf,

        /// Document IDs (repeatable)
        #[arg(long = "document", required = true)]
        documents: Vec<String>,

        #[arg(long)]
        intent: String,

        /// Allowed categories (repeatable; default all)
        #[arg(long = "category")]
        categories: Vec<AnnotationCategory>,

        #[arg(long)]
        max_per_document: Option<usize>,

        #[arg(long)]
        min_confidence: Option<f32>,

        #[arg(long, default_value = "standard")]
        thoroughness: Thoroughness,

        #[arg(long)]
        out: Option<PathBuf>,

        #[arg(long)]
        json: bool,
    },

    /// List runs previously saved for a document
    Runs {
        #[arg(long)]
        docs: PathBuf,

        #[arg(long)]
        document: String,

        #[arg(long)]
        out: Option<PathBuf>,

        /// Print every annotation, not just the run summary
        #[arg(long)]
        annotations: bool,

        #[arg(long)]
        json: bool,
    },

    /// Configuration file management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a config file with default settings
    Init {
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration
    Show { path: Option<PathBuf> },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = match cli.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Use the requested level for annotext, but WARN for HTTP internals
    let filter = EnvFilter::new(format!(
        "annotext={0},annotext_core={0},reqwest=warn,hyper=warn",
        level.as_str().to_lowercase()
    ));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr) // Keep stdout for results
        .init();

    debug!("Annotext v{} starting...", env!("CARGO_PKG_VERSION"));

    let config_path = cli.config.clone().unwrap_or_else(PipelineConfig::default_path);

    match cli.command {
        Commands::Chunk {
            file,
            window,
            overlap,
        } => {
            let mut config = PipelineConfig::load(&config_path)?;
            if let Some(window) = window {
                config.chunking.window_size = window;
            }
            if let Some(overlap) = overlap {
                config.chunking.overlap = overlap;
            }
            config.chunking.lookback = config
                .chunking
                .lookback
                .min(config.chunking.window_size.saturating_sub(config.chunking.overlap + 1));
            config.validate()?;

            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let id = file
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "document".to_string());
            let doc = SourceDocument::new(id, &text);
            let chunks = chunk_document(&doc, &config.chunking);

            println!("{} chars, {} chunks", doc.len(), chunks.len());
            for chunk in &chunks {
                println!(
                    "  {}  [{:>7}, {:>7})  {:>4} chars  {}",
                    chunk.id,
                    chunk.start_offset,
                    chunk.end_offset,
                    chunk.len_chars(),
                    chunk.section_title.as_deref().unwrap_or("-")
                );
            }
            Ok(())
        }

        Commands::Analyze {
            docs,
            document,
            intent,
            thoroughness,
            out,
            json,
        } => {
            let service = build_service(&config_path, &docs, out)?;
            let handle = service
                .start_analysis(&document, &intent, thoroughness)
                .await?;
            cancel_on_ctrl_c(handle.cancellation_token());

            let mut events = handle.subscribe();
            tokio::spawn(async move {
                while let Ok(event) = events.recv().await {
                    log_event(&event);
                    if event.is_terminal() {
                        break;
                    }
                }
            });

            let report = service.finish(handle).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
            Ok(())
        }

        Commands::Multi {
            docs,
            document,
            prompts,
            topic,
            thesis,
            goal,
            thoroughness,
            out,
            json,
        } => {
            let prompt_set = match topic {
                Some(topic) => PromptSet::from_topic(&topic, &thesis, &goal)?,
                None if prompts.is_empty() => bail!("pass --prompt at least once, or --topic"),
                None => PromptSet::new(prompts)?,
            };

            let service = build_service(&config_path, &docs, out)?;
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());

            let report = service
                .analyze_prompt_set(&document, &prompt_set, thoroughness, &cancel)
                .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(());
            }
            for (tag, text) in prompt_set.iter() {
                let count = report.for_prompt(tag.index).count();
                println!("Prompt {} {}  {} annotations  {}", tag.index, tag.color, count, text);
            }
            for failure in &report.failures {
                println!(
                    "Prompt {} {}  FAILED: {}",
                    failure.prompt_index, failure.prompt_color, failure.error
                );
            }
            println!();
            let mut annotations = report.annotations.clone();
            annotations.sort_by_key(|a| (a.final_start, a.prompt_index));
            for annotation in &annotations {
                print_annotation(annotation);
            }
            Ok(())
        }

        Commands::Batch {
            docs,
            documents,
            intent,
            categories,
            max_per_document,
            min_confidence,
            thoroughness,
            out,
            json,
        } => {
            if let Some(min) = min_confidence {
                if !(0.0..=1.0).contains(&min) {
                    bail!("--min-confidence must be between 0 and 1");
                }
            }
            let constraints = BatchConstraints {
                categories,
                max_per_document,
                min_confidence,
            };

            let service = build_service(&config_path, &docs, out)?;
            let cancel = CancellationToken::new();
            cancel_on_ctrl_c(cancel.clone());

            let results = service
                .batch_analyze(
                    &documents,
                    &BatchMode::Intent(intent),
                    &constraints,
                    thoroughness,
                    &cancel,
                )
                .await;

            if json {
                println!("{}", serde_json::to_string_pretty(&results)?);
                return Ok(());
            }
            for (document_id, result) in &results {
                let status = match result.status {
                    BatchStatus::Succeeded => "✓ succeeded",
                    BatchStatus::PartiallyFailed => "⚠ partially failed",
                    BatchStatus::Failed => "✗ failed",
                };
                println!(
                    "{:<24} {:<20} {:>4} retained  {}/{} chunks failed{}",
                    document_id,
                    status,
                    result.retained,
                    result.failed_chunks,
                    result.sampled_chunks,
                    result
                        .error
                        .as_deref()
                        .map(|e| format!("  ({})", e))
                        .unwrap_or_default()
                );
            }
            Ok(())
        }

        Commands::Runs {
            docs,
            document,
            out,
            annotations,
            json,
        } => {
            let out = out.unwrap_or_else(|| docs.join("annotations"));
            let store = FsStore::new(&docs, &out);
            let runs = store.load_runs(&document).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&runs)?);
                return Ok(());
            }
            if runs.is_empty() {
                println!("No saved runs for {} in {}", document, out.display());
                return Ok(());
            }

            println!("{} runs for {}", runs.len(), document);
            for stored in &runs {
                let run = &stored.run;
                println!(
                    "  {}  {}  {:<10} {:>4} annotations  {}",
                    run.id,
                    run.created_at.format("%Y-%m-%d %H:%M"),
                    run.thoroughness.to_string(),
                    stored.annotations.len(),
                    run.prompt_text.as_deref().unwrap_or(&run.intent)
                );
                if annotations {
                    let mut sorted = stored.annotations.clone();
                    sorted.sort_by_key(|a| a.final_start);
                    for annotation in &sorted {
                        print_annotation(annotation);
                    }
                    println!();
                }
            }
            Ok(())
        }

        Commands::Config { action } => match action {
            ConfigAction::Init { path, force } => {
                let path = path.unwrap_or(config_path);
                if path.exists() && !force {
                    bail!("{} already exists (use --force to overwrite)", path.display());
                }
                PipelineConfig::default().save(&path)?;
                println!("✓ Wrote default configuration to {}", path.display());
                Ok(())
            }
            ConfigAction::Show { path } => {
                let path = path.unwrap_or(config_path);
                let config = PipelineConfig::load(&path)?;
                println!("# {}", path.display());
                println!("{}", toml::to_string_pretty(&config)?);
                Ok(())
            }
        },
    }
}

fn build_service(config_path: &Path, docs: &Path, out: Option<PathBuf>) -> Result<AnnotationService> {
    let config = PipelineConfig::load(config_path)?;
    let out = out.unwrap_or_else(|| docs.join("annotations"));
    let store = Arc::new(FsStore::new(docs, out));
    Ok(AnnotationService::from_config(store, config)?)
}

/// Cancel cooperatively on the first Ctrl-C
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight work and saving partial results");
            token.cancel();
        }
    });
}

fn log_event(event: &RunEvent) {
    match event {
        RunEvent::StageChanged { to, .. } => info!("Stage: {}", to),
        RunEvent::ChunkCompleted {
            chunk_id,
            annotations,
            ..
        } => debug!("{} done ({} annotations)", chunk_id, annotations),
        RunEvent::ChunkFailed {
            chunk_id, reason, ..
        } => warn!("{} failed: {}", chunk_id, reason),
        _ => {}
    }
}

fn print_report(report: &RunReport) {
    let d = &report.diagnostics;
    println!(
        "Run {} ({}): {} annotations from {}/{} chunks",
        report.run.id,
        report.status,
        report.annotations.len(),
        d.completed_chunks,
        d.sampled_chunks
    );
    println!(
        "  candidates {}  malformed {}  hallucinated {}  approved {}  reclassified {}  rejected {}",
        d.candidates_generated,
        d.malformed_candidates,
        d.hallucinated_discards,
        d.approved,
        d.reclassified,
        d.rejected
    );
    if d.failed_chunks > 0 {
        println!("  {} chunks failed", d.failed_chunks);
    }
    println!();

    let mut annotations = report.annotations.clone();
    annotations.sort_by_key(|a| a.final_start);
    for annotation in &annotations {
        print_annotation(annotation);
    }
}

fn print_annotation(annotation: &FinalAnnotation) {
    let tag = annotation
        .prompt_color
        .as_deref()
        .map(|c| format!(" {}", c))
        .unwrap_or_default();
    println!(
        "[{}..{}] {} {:.2}{}",
        annotation.final_start,
        annotation.final_end,
        annotation.category,
        annotation.confidence_score,
        tag
    );
    println!("  \"{}\"", annotation.highlighted_text.trim());
    if !annotation.note.is_empty() {
        println!("  {}", annotation.note);
    }
    if !annotation.ocr_artifacts.is_empty() {
        println!("  ⚠ possible OCR artifacts: {:?}", annotation.ocr_artifacts);
    }
}
