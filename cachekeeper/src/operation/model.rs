//! Operation records and their status state machine.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Highest percent an operation may report before it has completed.
pub const RUNNING_PERCENT_CAP: f64 = 99.9;

/// Lifecycle status of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Preparing,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Forward-only transitions, plus `Preparing -> Failed` for pre-flight errors.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Preparing, Self::Running)
                | (Self::Preparing, Self::Failed)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Preparing => "preparing",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind of maintenance job an operation runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    CacheClear,
    LogIngest,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CacheClear => "cache_clear",
            Self::LogIngest => "log_ingest",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the cache-clean worker removes files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeleteMode {
    /// Delete files one by one and keep the directory skeleton.
    #[default]
    Preserve,
    /// Remove whole directory trees.
    Full,
    /// Sync against an empty directory with `rsync --delete`.
    Rsync,
}

impl DeleteMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Preserve => "preserve",
            Self::Full => "full",
            Self::Rsync => "rsync",
        }
    }
}

impl std::str::FromStr for DeleteMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "preserve" => Ok(Self::Preserve),
            "full" => Ok(Self::Full),
            "rsync" => Ok(Self::Rsync),
            other => Err(Error::validation(format!("Unknown delete mode: {other}"))),
        }
    }
}

/// Parameters for a job, one variant per worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobSpec {
    CacheClear {
        cache_dir: PathBuf,
        delete_mode: DeleteMode,
        threads: usize,
    },
    LogIngest {
        log_path: PathBuf,
        start_line: u64,
    },
}

impl JobSpec {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::CacheClear { .. } => OperationKind::CacheClear,
            Self::LogIngest { .. } => OperationKind::LogIngest,
        }
    }
}

/// Counters reported by workers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OperationProgress {
    pub directories_processed: u64,
    pub total_directories: u64,
    pub bytes_deleted: u64,
    pub files_deleted: u64,
    pub lines_parsed: u64,
    pub total_lines: u64,
    pub entries_saved: u64,
    pub percent_complete: f64,
    pub active_paths: Vec<String>,
}

/// A tracked unit of background work.
///
/// This is also the persisted snapshot shape: process and cancellation
/// handles live beside it in the registry and never reach the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: String,
    pub kind: OperationKind,
    pub status: OperationStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub progress: OperationProgress,
    /// Started by the live monitor; suppresses per-tick notifications.
    #[serde(default)]
    pub silent: bool,
}

impl Operation {
    pub fn new(kind: OperationKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            status: OperationStatus::Preparing,
            start_time: Utc::now(),
            end_time: None,
            status_message: Some("Preparing".to_string()),
            error: None,
            progress: OperationProgress::default(),
            silent: false,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `next`, stamping `end_time` on terminal statuses.
    pub fn transition(&mut self, next: OperationStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        self.status = next;
        if next.is_terminal() {
            self.end_time = Some(Utc::now());
            if next == OperationStatus::Completed {
                self.progress.percent_complete = 100.0;
            }
            self.progress.active_paths.clear();
        }
        Ok(())
    }

    /// Merge newer worker counters. Ignored unless the operation is running.
    ///
    /// Percent never moves backwards and stays below 100 until completion.
    pub fn apply_progress(&mut self, update: &OperationProgress, message: Option<&str>) -> bool {
        if self.status != OperationStatus::Running {
            return false;
        }

        let p = &mut self.progress;
        let percent = update.percent_complete.clamp(0.0, RUNNING_PERCENT_CAP);
        p.percent_complete = p.percent_complete.max(percent);
        p.directories_processed = update.directories_processed;
        p.total_directories = update.total_directories;
        p.bytes_deleted = update.bytes_deleted;
        p.files_deleted = update.files_deleted;
        p.lines_parsed = update.lines_parsed;
        p.total_lines = update.total_lines;
        p.entries_saved = update.entries_saved;
        p.active_paths = update.active_paths.clone();

        if let Some(msg) = message.filter(|m| !m.is_empty()) {
            self.status_message = Some(msg.to_string());
        }
        true
    }

    /// Duration from start to end (or to now while still active).
    pub fn duration(&self) -> chrono::Duration {
        self.end_time.unwrap_or_else(Utc::now) - self.start_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running() -> Operation {
        let mut op = Operation::new(OperationKind::CacheClear);
        op.transition(OperationStatus::Running).unwrap();
        op
    }

    #[test]
    fn test_forward_only_transitions() {
        use OperationStatus::*;
        assert!(Preparing.can_transition_to(Running));
        assert!(Preparing.can_transition_to(Failed));
        assert!(!Preparing.can_transition_to(Completed));
        assert!(!Preparing.can_transition_to(Cancelled));
        assert!(Running.can_transition_to(Cancelled));
        assert!(!Running.can_transition_to(Preparing));
        for terminal in [Completed, Failed, Cancelled] {
            for next in [Preparing, Running, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_end_time_iff_terminal() {
        let mut op = Operation::new(OperationKind::LogIngest);
        assert!(op.end_time.is_none());
        op.transition(OperationStatus::Running).unwrap();
        assert!(op.end_time.is_none());
        op.transition(OperationStatus::Failed).unwrap();
        assert!(op.end_time.is_some());
        assert!(op.is_terminal());

        let err = op.transition(OperationStatus::Completed).unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
    }

    #[test]
    fn test_percent_monotonic_and_capped() {
        let mut op = running();
        let mut update = OperationProgress {
            percent_complete: 40.0,
            ..Default::default()
        };
        assert!(op.apply_progress(&update, Some("Clearing cache (40/100)")));
        assert_eq!(op.progress.percent_complete, 40.0);

        update.percent_complete = 25.0;
        op.apply_progress(&update, None);
        assert_eq!(op.progress.percent_complete, 40.0);
        assert_eq!(op.status_message.as_deref(), Some("Clearing cache (40/100)"));

        update.percent_complete = 100.0;
        op.apply_progress(&update, None);
        assert!(op.progress.percent_complete < 100.0);

        op.transition(OperationStatus::Completed).unwrap();
        assert_eq!(op.progress.percent_complete, 100.0);
    }

    #[test]
    fn test_no_progress_after_terminal() {
        let mut op = running();
        op.transition(OperationStatus::Cancelled).unwrap();
        let update = OperationProgress {
            files_deleted: 10,
            percent_complete: 50.0,
            ..Default::default()
        };
        assert!(!op.apply_progress(&update, Some("late")));
        assert_eq!(op.progress.files_deleted, 0);
        assert!(op.progress.percent_complete < 100.0);
    }

    #[test]
    fn test_delete_mode_parse() {
        assert_eq!("Full".parse::<DeleteMode>().unwrap(), DeleteMode::Full);
        assert_eq!(" rsync ".parse::<DeleteMode>().unwrap(), DeleteMode::Rsync);
        assert!("shred".parse::<DeleteMode>().is_err());
    }

    #[test]
    fn test_snapshot_roundtrip_uses_camel_case() {
        let op = running();
        let json = serde_json::to_value(&op).unwrap();
        assert!(json.get("startTime").is_some());
        assert_eq!(json["status"], "running");
        let back: Operation = serde_json::from_value(json).unwrap();
        assert_eq!(back, op);
    }
}
