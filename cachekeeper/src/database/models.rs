//! Row models.

use chrono::Utc;
use sqlx::FromRow;

use crate::operation::Operation;
use crate::Result;

/// A row of the `operation_state` table.
///
/// The full record lives in `snapshot` as JSON; the other columns exist for
/// filtering.
#[derive(Debug, Clone, FromRow)]
pub struct OperationStateDbModel {
    pub id: String,
    pub kind: String,
    pub status: String,
    pub start_time: i64,
    pub end_time: Option<i64>,
    pub snapshot: String,
    pub updated_at: i64,
}

impl OperationStateDbModel {
    pub fn from_operation(op: &Operation) -> Result<Self> {
        Ok(Self {
            id: op.id.clone(),
            kind: op.kind.to_string(),
            status: op.status.to_string(),
            start_time: op.start_time.timestamp_millis(),
            end_time: op.end_time.map(|t| t.timestamp_millis()),
            snapshot: serde_json::to_string(op)?,
            updated_at: Utc::now().timestamp_millis(),
        })
    }

    pub fn into_operation(self) -> Result<Operation> {
        Ok(serde_json::from_str(&self.snapshot)?)
    }
}
