//! Lock-contention retry for SQLite writes.
//!
//! Snapshot upserts come from every running job's poll loop while the live
//! monitor stores its log position and shutdown rewrites the whole table, so
//! a write can briefly find the database locked by another connection.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::{Error, Result};

/// SQLite primary result codes for a locked database.
const SQLITE_BUSY: &str = "5";
const SQLITE_LOCKED: &str = "6";

/// Backoff policy applied to a single logical write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusyRetry {
    retries: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for BusyRetry {
    fn default() -> Self {
        Self::new(8, Duration::from_millis(10), Duration::from_secs(2))
    }
}

impl BusyRetry {
    pub const fn new(retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            retries,
            base_delay,
            max_delay,
        }
    }

    /// Wait before retry number `attempt` (zero based): doubling from the
    /// base delay, up to a quarter of jitter on top, never above the cap.
    pub fn delay(&self, attempt: u32) -> Duration {
        let doubled = self
            .base_delay
            .saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
        let backoff = doubled.min(self.max_delay);
        let jitter_ms = rand::random::<u64>() % (backoff.as_millis() as u64 / 4 + 1);
        (backoff + Duration::from_millis(jitter_ms)).min(self.max_delay)
    }

    /// Run `write` until it succeeds, fails for another reason, or the retry
    /// budget is spent. `table` and `key` only label the log lines.
    pub async fn write<T, F, Fut>(&self, table: &'static str, key: &str, mut write: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            let err = match write().await {
                Ok(value) => return Ok(value),
                Err(err) if is_lock_contention(&err) => err,
                Err(err) => return Err(err),
            };

            if attempt >= self.retries {
                warn!(table, key, attempts = attempt + 1, error = %err, "Giving up on locked database");
                return Err(err);
            }

            let delay = self.delay(attempt);
            debug!(table, key, attempt = attempt + 1, ?delay, "Database locked, retrying write");
            sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Whether `err` means another connection holds the write lock.
pub fn is_lock_contention(err: &Error) -> bool {
    let Error::DatabaseSqlx(err) = err else {
        return false;
    };

    let message = match err {
        sqlx::Error::Database(db) => {
            if let Some(code) = db.code()
                && (code == SQLITE_BUSY || code == SQLITE_LOCKED)
            {
                return true;
            }
            db.message().to_ascii_lowercase()
        }
        other => other.to_string().to_ascii_lowercase(),
    };
    message.contains("database is locked") || message.contains("database is busy")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn locked() -> Error {
        Error::DatabaseSqlx(sqlx::Error::Protocol("database is locked".into()))
    }

    fn quick(retries: u32) -> BusyRetry {
        BusyRetry::new(retries, Duration::from_millis(1), Duration::from_millis(5))
    }

    #[test]
    fn test_lock_contention_detection() {
        assert!(is_lock_contention(&locked()));
        assert!(!is_lock_contention(&Error::DatabaseSqlx(sqlx::Error::RowNotFound)));
        assert!(!is_lock_contention(&Error::Other("database is locked".into())));
    }

    #[test]
    fn test_delay_doubles_up_to_cap() {
        let policy = BusyRetry::new(8, Duration::from_millis(100), Duration::from_millis(1000));
        let first = policy.delay(0);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(125));
        let third = policy.delay(2);
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(500));
        assert_eq!(policy.delay(10), Duration::from_millis(1000));
        assert_eq!(policy.delay(40), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_other_errors_fail_immediately() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = quick(3)
            .write("settings", "delete_mode", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::Other("constraint failed".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_locked_write_eventually_succeeds() {
        let calls = AtomicUsize::new(0);
        let attempts = quick(3)
            .write("operation_state", "op-1", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move { if n < 2 { Err(locked()) } else { Ok(n + 1) } }
            })
            .await
            .unwrap();
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> = quick(2)
            .write("operation_state", "op-1", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(locked()) }
            })
            .await;
        assert!(is_lock_contention(&result.unwrap_err()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
