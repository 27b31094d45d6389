//! Application configuration.
//!
//! Values come from `CACHEKEEPER_*` environment variables (a `.env` file is
//! honoured via `dotenvy`) layered over serde defaults.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const ENV_PREFIX: &str = "CACHEKEEPER_";

/// Locations and tuning for the external worker binaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Path to the cache-clean worker.
    #[serde(default = "default_cache_clean_bin")]
    pub cache_clean_bin: PathBuf,
    /// Path to the log-ingest worker.
    #[serde(default = "default_log_ingest_bin")]
    pub log_ingest_bin: PathBuf,
    /// Directory for transient per-operation progress files.
    #[serde(default = "default_progress_dir")]
    pub progress_dir: PathBuf,
    /// Database the log-ingest worker writes parsed entries into.
    #[serde(default = "default_ingest_db_path")]
    pub ingest_db_path: PathBuf,
    /// Thread count handed to the cache-clean worker.
    #[serde(default = "default_clean_threads")]
    pub clean_threads: usize,
}

fn default_cache_clean_bin() -> PathBuf {
    PathBuf::from("bin/cache_cleaner")
}

fn default_log_ingest_bin() -> PathBuf {
    PathBuf::from("bin/log_processor")
}

fn default_progress_dir() -> PathBuf {
    PathBuf::from("data/operations")
}

fn default_ingest_db_path() -> PathBuf {
    PathBuf::from("data/cache.db")
}

fn default_clean_threads() -> usize {
    4
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cache_clean_bin: default_cache_clean_bin(),
            log_ingest_bin: default_log_ingest_bin(),
            progress_dir: default_progress_dir(),
            ingest_db_path: default_ingest_db_path(),
            clean_threads: default_clean_threads(),
        }
    }
}

impl WorkerConfig {
    pub fn with_cache_clean_bin(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_clean_bin = path.into();
        self
    }

    pub fn with_log_ingest_bin(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_ingest_bin = path.into();
        self
    }

    pub fn with_progress_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.progress_dir = path.into();
        self
    }

    pub fn with_ingest_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ingest_db_path = path.into();
        self
    }

    pub fn with_clean_threads(mut self, threads: usize) -> Self {
        self.clean_threads = threads.max(1);
        self
    }
}

/// Poll-loop tuning for the process orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Interval between progress polls in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Persist a snapshot every N progress ticks.
    #[serde(default = "default_snapshot_every")]
    pub snapshot_every: u32,
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_snapshot_every() -> u32 {
    10
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            snapshot_every: default_snapshot_every(),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    pub fn with_snapshot_every(mut self, ticks: u32) -> Self {
        self.snapshot_every = ticks.max(1);
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Startup reconciliation window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Only snapshots started within this many hours are reloaded.
    #[serde(default = "default_window_hours")]
    pub window_hours: u64,
}

fn default_window_hours() -> u64 {
    24
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            window_hours: default_window_hours(),
        }
    }
}

impl RecoveryConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_hours * 3600)
    }
}

/// Configuration for evicting finished operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Interval between sweeps in seconds.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Terminal operations older than this many hours are evicted.
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,
}

fn default_sweep_interval_secs() -> u64 {
    300 // 5 minutes
}

fn default_retention_hours() -> u64 {
    24
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval_secs(),
            retention_hours: default_retention_hours(),
        }
    }
}

impl RetentionConfig {
    pub fn with_sweep_interval_secs(mut self, secs: u64) -> Self {
        self.sweep_interval_secs = secs;
        self
    }

    pub fn with_retention_hours(mut self, hours: u64) -> Self {
        self.retention_hours = hours;
        self
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retention_hours as i64)
    }
}

/// Configuration for the live access-log monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveMonitorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// The continuously growing log file.
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,
    /// Name under which the ingest position is stored.
    #[serde(default = "default_datasource")]
    pub datasource: String,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_startup_delay_secs")]
    pub startup_delay_secs: u64,
    /// Minimum growth in bytes before an ingest pass is considered.
    #[serde(default = "default_min_growth_bytes")]
    pub min_growth_bytes: u64,
    #[serde(default = "default_min_trigger_interval_ms")]
    pub min_trigger_interval_ms: u64,
    /// Attempts made to count lines while the file is locked.
    #[serde(default = "default_line_count_attempts")]
    pub line_count_attempts: u32,
    #[serde(default = "default_line_count_base_delay_ms")]
    pub line_count_base_delay_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_log_path() -> PathBuf {
    PathBuf::from("/logs/access.log")
}

fn default_datasource() -> String {
    "default".to_string()
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_startup_delay_secs() -> u64 {
    5
}

fn default_min_growth_bytes() -> u64 {
    10 * 1024
}

fn default_min_trigger_interval_ms() -> u64 {
    1000
}

fn default_line_count_attempts() -> u32 {
    5
}

fn default_line_count_base_delay_ms() -> u64 {
    100
}

impl Default for LiveMonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_path: default_log_path(),
            datasource: default_datasource(),
            tick_interval_ms: default_tick_interval_ms(),
            startup_delay_secs: default_startup_delay_secs(),
            min_growth_bytes: default_min_growth_bytes(),
            min_trigger_interval_ms: default_min_trigger_interval_ms(),
            line_count_attempts: default_line_count_attempts(),
            line_count_base_delay_ms: default_line_count_base_delay_ms(),
        }
    }
}

impl LiveMonitorConfig {
    pub fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = path.into();
        self
    }

    pub fn with_datasource(mut self, name: impl Into<String>) -> Self {
        self.datasource = name.into();
        self
    }

    pub fn with_min_growth_bytes(mut self, bytes: u64) -> Self {
        self.min_growth_bytes = bytes;
        self
    }

    pub fn with_min_trigger_interval_ms(mut self, ms: u64) -> Self {
        self.min_trigger_interval_ms = ms;
        self
    }

    pub fn with_tick_interval_ms(mut self, ms: u64) -> Self {
        self.tick_interval_ms = ms;
        self
    }

    pub fn with_startup_delay_secs(mut self, secs: u64) -> Self {
        self.startup_delay_secs = secs;
        self
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_secs)
    }

    pub fn min_trigger_interval(&self) -> Duration {
        Duration::from_millis(self.min_trigger_interval_ms)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub live_monitor: LiveMonitorConfig,
}

fn default_database_url() -> String {
    "sqlite:cachekeeper.db?mode=rwc".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            log_dir: default_log_dir(),
            workers: WorkerConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            recovery: RecoveryConfig::default(),
            retention: RetentionConfig::default(),
            live_monitor: LiveMonitorConfig::default(),
        }
    }
}

impl AppConfig {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let mut config = Self::default();

        if let Some(v) = get("DATABASE_URL") {
            config.database_url = v;
        }
        if let Some(v) = get("LOG_DIR") {
            config.log_dir = v;
        }

        let w = &mut config.workers;
        if let Some(v) = get("CACHE_CLEAN_BIN") {
            w.cache_clean_bin = v.into();
        }
        if let Some(v) = get("LOG_INGEST_BIN") {
            w.log_ingest_bin = v.into();
        }
        if let Some(v) = get("PROGRESS_DIR") {
            w.progress_dir = v.into();
        }
        if let Some(v) = get("INGEST_DB_PATH") {
            w.ingest_db_path = v.into();
        }
        if let Some(v) = get("CLEAN_THREADS") {
            w.clean_threads = parse_var("CLEAN_THREADS", &v)?;
        }

        let o = &mut config.orchestrator;
        if let Some(v) = get("POLL_INTERVAL_MS") {
            o.poll_interval_ms = parse_var("POLL_INTERVAL_MS", &v)?;
        }
        if let Some(v) = get("SNAPSHOT_EVERY") {
            o.snapshot_every = parse_var::<u32>("SNAPSHOT_EVERY", &v)?.max(1);
        }

        if let Some(v) = get("RECOVERY_WINDOW_HOURS") {
            config.recovery.window_hours = parse_var("RECOVERY_WINDOW_HOURS", &v)?;
        }

        let r = &mut config.retention;
        if let Some(v) = get("RETENTION_HOURS") {
            r.retention_hours = parse_var("RETENTION_HOURS", &v)?;
        }
        if let Some(v) = get("SWEEP_INTERVAL_SECS") {
            r.sweep_interval_secs = parse_var("SWEEP_INTERVAL_SECS", &v)?;
        }

        let m = &mut config.live_monitor;
        if let Some(v) = get("LIVE_MONITOR_ENABLED") {
            m.enabled = parse_var("LIVE_MONITOR_ENABLED", &v)?;
        }
        if let Some(v) = get("LOG_PATH") {
            m.log_path = v.into();
        }
        if let Some(v) = get("DATASOURCE") {
            m.datasource = v;
        }
        if let Some(v) = get("MIN_GROWTH_BYTES") {
            m.min_growth_bytes = parse_var("MIN_GROWTH_BYTES", &v)?;
        }
        if let Some(v) = get("MIN_TRIGGER_INTERVAL_MS") {
            m.min_trigger_interval_ms = parse_var("MIN_TRIGGER_INTERVAL_MS", &v)?;
        }

        Ok(config)
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse::<T>().map_err(|_| {
        Error::config(format!("Invalid value for {ENV_PREFIX}{name}: {value:?}"))
    })
}
