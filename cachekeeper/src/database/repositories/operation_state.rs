//! Durable store for operation snapshots.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use sqlx::SqlitePool;
use tracing::warn;

use crate::database::models::OperationStateDbModel;
use crate::database::retry::BusyRetry;
use crate::operation::Operation;
use crate::Result;

/// Snapshot store contract. Last write wins per id.
#[async_trait]
pub trait OperationStateRepository: Send + Sync {
    /// Snapshots whose operation started within `window` of now.
    async fn load_recent(&self, window: Duration) -> Result<Vec<Operation>>;
    async fn upsert(&self, snapshot: &Operation) -> Result<()>;
    async fn remove(&self, id: &str) -> Result<()>;
    /// Replace the whole store with `snapshots`.
    async fn replace_all(&self, snapshots: &[Operation]) -> Result<()>;
}

fn cutoff_millis(window: Duration) -> i64 {
    let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
    Utc::now()
        .checked_sub_signed(window)
        .map(|t| t.timestamp_millis())
        .unwrap_or(i64::MIN)
}

/// SQLx implementation of OperationStateRepository.
pub struct SqlxOperationStateRepository {
    pool: SqlitePool,
    retry: BusyRetry,
}

impl SqlxOperationStateRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            retry: BusyRetry::default(),
        }
    }
}

const UPSERT_SQL: &str = r#"
    INSERT INTO operation_state (id, kind, status, start_time, end_time, snapshot, updated_at)
    VALUES (?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(id) DO UPDATE SET
        kind = excluded.kind,
        status = excluded.status,
        start_time = excluded.start_time,
        end_time = excluded.end_time,
        snapshot = excluded.snapshot,
        updated_at = excluded.updated_at
"#;

#[async_trait]
impl OperationStateRepository for SqlxOperationStateRepository {
    async fn load_recent(&self, window: Duration) -> Result<Vec<Operation>> {
        let rows = sqlx::query_as::<_, OperationStateDbModel>(
            "SELECT * FROM operation_state WHERE start_time >= ? ORDER BY start_time DESC",
        )
        .bind(cutoff_millis(window))
        .fetch_all(&self.pool)
        .await?;

        let mut operations = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id.clone();
            match row.into_operation() {
                Ok(op) => operations.push(op),
                Err(e) => warn!(operation_id = %id, error = %e, "Skipping unreadable snapshot"),
            }
        }
        Ok(operations)
    }

    async fn upsert(&self, snapshot: &Operation) -> Result<()> {
        let row = OperationStateDbModel::from_operation(snapshot)?;
        self.retry.write("operation_state", &row.id, || async {
            sqlx::query(UPSERT_SQL)
                .bind(&row.id)
                .bind(&row.kind)
                .bind(&row.status)
                .bind(row.start_time)
                .bind(row.end_time)
                .bind(&row.snapshot)
                .bind(row.updated_at)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.retry.write("operation_state", id, || async {
            sqlx::query("DELETE FROM operation_state WHERE id = ?")
                .bind(id)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    async fn replace_all(&self, snapshots: &[Operation]) -> Result<()> {
        let rows = snapshots
            .iter()
            .map(OperationStateDbModel::from_operation)
            .collect::<Result<Vec<_>>>()?;

        // The whole rewrite is retried; a failed attempt rolls back on drop.
        self.retry
            .write("operation_state", "*", || async {
                let mut tx = self.pool.begin().await?;
                sqlx::query("DELETE FROM operation_state")
                    .execute(&mut *tx)
                    .await?;
                for row in &rows {
                    sqlx::query(UPSERT_SQL)
                        .bind(&row.id)
                        .bind(&row.kind)
                        .bind(&row.status)
                        .bind(row.start_time)
                        .bind(row.end_time)
                        .bind(&row.snapshot)
                        .bind(row.updated_at)
                        .execute(&mut *tx)
                        .await?;
                }
                tx.commit().await?;
                Ok(())
            })
            .await
    }
}

/// In-memory store for ephemeral runs and tests.
#[derive(Debug, Default)]
pub struct MemoryOperationStateRepository {
    snapshots: Mutex<HashMap<String, Operation>>,
}

impl MemoryOperationStateRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Operation> {
        self.snapshots.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.lock().is_empty()
    }
}

#[async_trait]
impl OperationStateRepository for MemoryOperationStateRepository {
    async fn load_recent(&self, window: Duration) -> Result<Vec<Operation>> {
        let cutoff = cutoff_millis(window);
        let mut recent: Vec<Operation> = self
            .snapshots
            .lock()
            .values()
            .filter(|op| op.start_time.timestamp_millis() >= cutoff)
            .cloned()
            .collect();
        recent.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(recent)
    }

    async fn upsert(&self, snapshot: &Operation) -> Result<()> {
        self.snapshots
            .lock()
            .insert(snapshot.id.clone(), snapshot.clone());
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        self.snapshots.lock().remove(id);
        Ok(())
    }

    async fn replace_all(&self, snapshots: &[Operation]) -> Result<()> {
        let mut map = self.snapshots.lock();
        map.clear();
        map.extend(snapshots.iter().map(|op| (op.id.clone(), op.clone())));
        Ok(())
    }
}
