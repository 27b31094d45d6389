//! Reader for worker-written progress files.
//!
//! Workers rewrite a small JSON document at their own cadence. A missing,
//! half-written or otherwise unparseable file means "no new information"
//! and is never an error.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::trace;

use super::model::OperationProgress;

/// The progress document written by a worker.
///
/// Workers disagree on field casing, so both spellings are accepted.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ProgressRecord {
    #[serde(alias = "isProcessing")]
    pub is_processing: bool,
    #[serde(alias = "percentComplete")]
    pub percent_complete: f64,
    pub status: Option<String>,
    pub message: Option<String>,
    #[serde(alias = "directoriesProcessed")]
    pub directories_processed: u64,
    #[serde(alias = "totalDirectories")]
    pub total_directories: u64,
    #[serde(alias = "bytesDeleted")]
    pub bytes_deleted: u64,
    #[serde(alias = "filesDeleted")]
    pub files_deleted: u64,
    #[serde(alias = "linesParsed")]
    pub lines_parsed: u64,
    #[serde(alias = "totalLines")]
    pub total_lines: u64,
    #[serde(alias = "entriesSaved")]
    pub entries_saved: u64,
    #[serde(alias = "activePaths")]
    pub active_paths: Vec<String>,
}

impl ProgressRecord {
    /// Parse a document, returning `None` for anything that is not a JSON object
    /// we understand.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        let mut record: Self = serde_json::from_str(trimmed).ok()?;
        if !record.percent_complete.is_finite() {
            record.percent_complete = 0.0;
        }
        record.percent_complete = record.percent_complete.clamp(0.0, 100.0);
        Some(record)
    }

    pub fn to_progress(&self) -> OperationProgress {
        OperationProgress {
            directories_processed: self.directories_processed,
            total_directories: self.total_directories,
            bytes_deleted: self.bytes_deleted,
            files_deleted: self.files_deleted,
            lines_parsed: self.lines_parsed,
            total_lines: self.total_lines,
            entries_saved: self.entries_saved,
            percent_complete: self.percent_complete,
            active_paths: self.active_paths.clone(),
        }
    }
}

/// Reads the progress file of one operation.
#[derive(Debug, Clone)]
pub struct ProgressReader {
    path: PathBuf,
}

impl ProgressReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Latest record, or `None` if there is nothing usable on disk.
    pub async fn read(&self) -> Option<ProgressRecord> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => {
                let record = ProgressRecord::parse(&raw);
                if record.is_none() {
                    trace!(path = %self.path.display(), "Ignoring unparseable progress file");
                }
                record
            }
            Err(e) => {
                trace!(path = %self.path.display(), error = %e, "Progress file not readable");
                None
            }
        }
    }

    /// Remove the transient file; absence is fine.
    pub async fn remove(&self) {
        if let Err(e) = tokio::fs::remove_file(&self.path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::debug!(path = %self.path.display(), error = %e, "Failed to remove progress file");
        }
    }
}
