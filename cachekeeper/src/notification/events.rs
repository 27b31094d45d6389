//! Operation events pushed to subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::operation::{Operation, OperationKind, OperationProgress, OperationStatus};

/// Periodic progress push for a running operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationProgressEvent {
    pub operation_id: String,
    pub kind: OperationKind,
    pub status: OperationStatus,
    pub message: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub progress: OperationProgress,
}

impl From<&Operation> for OperationProgressEvent {
    fn from(op: &Operation) -> Self {
        Self {
            operation_id: op.id.clone(),
            kind: op.kind,
            status: op.status,
            message: op.status_message.clone(),
            start_time: op.start_time,
            end_time: op.end_time,
            progress: op.progress.clone(),
        }
    }
}

/// One-shot push emitted when an operation reaches a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationCompleteEvent {
    pub operation_id: String,
    pub kind: OperationKind,
    pub status: OperationStatus,
    pub success: bool,
    pub cancelled: bool,
    pub message: Option<String>,
    pub error: Option<String>,
    pub progress: OperationProgress,
    pub duration_secs: f64,
}

impl From<&Operation> for OperationCompleteEvent {
    fn from(op: &Operation) -> Self {
        Self {
            operation_id: op.id.clone(),
            kind: op.kind,
            status: op.status,
            success: op.status == OperationStatus::Completed,
            cancelled: op.status == OperationStatus::Cancelled,
            message: op.status_message.clone(),
            error: op.error.clone(),
            progress: op.progress.clone(),
            duration_secs: op.duration().num_milliseconds().max(0) as f64 / 1000.0,
        }
    }
}

/// Envelope broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum OperationEvent {
    Progress(OperationProgressEvent),
    Complete(OperationCompleteEvent),
}

impl OperationEvent {
    pub fn operation_id(&self) -> &str {
        match self {
            Self::Progress(e) => &e.operation_id,
            Self::Complete(e) => &e.operation_id,
        }
    }
}
