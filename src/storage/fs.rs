//! Directory-backed document store
//!
//! Documents are read from `<docs>/<id>.txt`. Each persisted run is written to
//! `<out>/<id>/<run-id>.json` holding the run record and its annotations.

use super::{DocumentStore, StoredRun};
use crate::error::{AnnotextError, Result};
use crate::types::{AnalysisRun, FinalAnnotation, SourceDocument};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Plain-text documents in, JSON runs out
#[derive(Debug, Clone)]
pub struct FsStore {
    docs_dir: PathBuf,
    out_dir: PathBuf,
}

impl FsStore {
    pub fn new(docs_dir: impl Into<PathBuf>, out_dir: impl Into<PathBuf>) -> Self {
        Self {
            docs_dir: docs_dir.into(),
            out_dir: out_dir.into(),
        }
    }

    pub fn docs_dir(&self) -> &Path {
        &self.docs_dir
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    fn document_path(&self, document_id: &str) -> Result<PathBuf> {
        check_id(document_id)?;
        Ok(self.docs_dir.join(format!("{}.txt", document_id)))
    }

    fn run_dir(&self, document_id: &str) -> Result<PathBuf> {
        check_id(document_id)?;
        Ok(self.out_dir.join(document_id))
    }

    /// Load every run persisted for a document, oldest first
    pub async fn load_runs(&self, document_id: &str) -> Result<Vec<StoredRun>> {
        let dir = self.run_dir(document_id)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut runs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = tokio::fs::read_to_string(&path).await?;
            runs.push(serde_json::from_str::<StoredRun>(&content)?);
        }
        runs.sort_by_key(|r| r.run.created_at);
        Ok(runs)
    }
}

/// Document IDs become file names; refuse anything that could escape the directory
fn check_id(document_id: &str) -> Result<()> {
    let bad = document_id.is_empty()
        || document_id == "."
        || document_id == ".."
        || document_id.contains(['/', '\\', '\0']);
    if bad {
        return Err(AnnotextError::Storage(format!(
            "invalid document id: {:?}",
            document_id
        )));
    }
    Ok(())
}

#[async_trait]
impl DocumentStore for FsStore {
    async fn get_document_text(&self, document_id: &str) -> Result<SourceDocument> {
        let path = self.document_path(document_id)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => {
                debug!("Loaded {} ({} bytes)", path.display(), text.len());
                Ok(SourceDocument::new(document_id, &text))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(AnnotextError::DocumentNotFound(document_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn persist_annotations(
        &self,
        document_id: &str,
        run: &AnalysisRun,
        annotations: &[FinalAnnotation],
    ) -> Result<()> {
        let dir = self.run_dir(document_id)?;
        tokio::fs::create_dir_all(&dir).await?;

        let record = StoredRun {
            run: run.clone(),
            annotations: annotations.to_vec(),
        };
        let path = dir.join(format!("{}.json", run.id));
        tokio::fs::write(&path, serde_json::to_string_pretty(&record)?).await?;

        info!(
            "Saved {} annotations for run {} to {}",
            annotations.len(),
            run.id,
            path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Thoroughness;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_reads_documents_and_writes_runs() {
        let docs = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        std::fs::write(docs.path().join("report.txt"), "Line one.\nLine two.").unwrap();

        let store = FsStore::new(docs.path(), out.path());
        let doc = store.get_document_text("report").await.unwrap();
        assert_eq!(doc.text(), "Line one.\nLine two.");

        let run = AnalysisRun::new("report", "lines", Thoroughness::Quick);
        store.persist_annotations("report", &run, &[]).await.unwrap();
        assert!(out
            .path()
            .join("report")
            .join(format!("{}.json", run.id))
            .exists());

        let runs = store.load_runs("report").await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].run, run);
    }

    #[tokio::test]
    async fn test_load_runs_oldest_first_skipping_other_files() {
        let out = TempDir::new().unwrap();
        let store = FsStore::new(out.path(), out.path());

        let newer = AnalysisRun::new("report", "second pass", Thoroughness::Standard);
        let mut older = AnalysisRun::new("report", "first pass", Thoroughness::Quick);
        older.created_at = newer.created_at - chrono::Duration::minutes(5);
        store.persist_annotations("report", &newer, &[]).await.unwrap();
        store.persist_annotations("report", &older, &[]).await.unwrap();
        std::fs::write(out.path().join("report").join("notes.txt"), "scratch").unwrap();

        let runs = store.load_runs("report").await.unwrap();
        let intents: Vec<&str> = runs.iter().map(|r| r.run.intent.as_str()).collect();
        assert_eq!(intents, vec!["first pass", "second pass"]);
        assert!(runs.iter().all(|r| r.annotations.is_empty()));
    }

    #[tokio::test]
    async fn test_missing_document() {
        let docs = TempDir::new().unwrap();
        let store = FsStore::new(docs.path(), docs.path());
        let err = store.get_document_text("absent").await.unwrap_err();
        assert!(matches!(err, AnnotextError::DocumentNotFound(_)));
        assert!(store.load_runs("absent").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_path_like_ids() {
        let docs = TempDir::new().unwrap();
        let store = FsStore::new(docs.path(), docs.path());
        for id in ["../etc/passwd", "a/b", "..", ""] {
            let err = store.get_document_text(id).await.unwrap_err();
            assert!(matches!(err, AnnotextError::Storage(_)), "{id}");
        }
    }
}
