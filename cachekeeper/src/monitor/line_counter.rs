//! Line counting over a file another process may be writing.

use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::config::LiveMonitorConfig;
use crate::{Error, Result};

const READ_CHUNK: usize = 64 * 1024;

/// Counts lines, retrying with exponential backoff on transient errors.
#[derive(Debug, Clone)]
pub struct LineCounter {
    attempts: u32,
    base_delay: Duration,
}

impl LineCounter {
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay,
        }
    }

    pub fn from_config(config: &LiveMonitorConfig) -> Self {
        Self::new(
            config.line_count_attempts,
            Duration::from_millis(config.line_count_base_delay_ms),
        )
    }

    /// Number of lines in `path`. A trailing line without a newline counts.
    pub async fn count(&self, path: &Path) -> Result<u64> {
        let mut attempt = 1;
        loop {
            match count_lines(path).await {
                Ok(lines) => return Ok(lines),
                // Retrying will not make a missing file appear.
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(Error::io_path("counting lines", path, e));
                }
                Err(e) if attempt < self.attempts => {
                    let delay = self.base_delay * 2u32.saturating_pow(attempt - 1);
                    warn!(
                        path = %path.display(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Line count failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(Error::io_path("counting lines", path, e)),
            }
        }
    }
}

async fn count_lines(path: &Path) -> std::io::Result<u64> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; READ_CHUNK];
    let mut lines = 0u64;
    let mut last = None;

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        lines += memchr::memchr_iter(b'\n', &buf[..n]).count() as u64;
        last = Some(buf[n - 1]);
    }

    if last.is_some_and(|b| b != b'\n') {
        lines += 1;
    }
    debug!(path = %path.display(), lines, "Counted lines");
    Ok(lines)
}
