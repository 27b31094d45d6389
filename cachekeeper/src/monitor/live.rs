//! Live log monitor.
//!
//! Watches the proxy access log and runs an incremental ingest pass whenever
//! it has grown enough. Passes go through the regular orchestration path in
//! silent mode.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::line_counter::LineCounter;
use super::pause_gate::PauseGate;
use super::position::LogPositionStore;
use super::probe::{BusyFlag, BusyProbe};
use crate::config::LiveMonitorConfig;
use crate::operation::{JobSpec, LaunchMode, OperationStatus, ProcessOrchestrator};
use crate::{Error, Result};

/// Result of a successful ingest pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    /// Total line count reported by the worker, if it reported one.
    pub total_lines: Option<u64>,
}

/// Runs one ingest pass starting at a given line.
#[async_trait]
pub trait IngestTrigger: Send + Sync {
    async fn ingest(&self, log_path: &Path, start_line: u64) -> Result<IngestOutcome>;
}

/// Ingests through the orchestrator and waits for the pass to finish.
pub struct OrchestratorIngestTrigger {
    orchestrator: Arc<ProcessOrchestrator>,
}

impl OrchestratorIngestTrigger {
    pub fn new(orchestrator: Arc<ProcessOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl IngestTrigger for OrchestratorIngestTrigger {
    async fn ingest(&self, log_path: &Path, start_line: u64) -> Result<IngestOutcome> {
        let spec = JobSpec::LogIngest {
            log_path: log_path.to_path_buf(),
            start_line,
        };
        let op = self.orchestrator.run(spec, LaunchMode::Silent).await;

        if op.status == OperationStatus::Completed {
            Ok(IngestOutcome {
                total_lines: (op.progress.total_lines > 0).then_some(op.progress.total_lines),
            })
        } else {
            let detail = op
                .error
                .clone()
                .or_else(|| op.status_message.clone())
                .unwrap_or_else(|| "no details".to_string());
            Err(Error::Other(format!(
                "Ingest pass {} ended {}: {detail}",
                op.id, op.status
            )))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Triggering,
}

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Paused,
    FileMissing,
    /// First observation; nothing to compare against yet.
    Baseline { size: u64 },
    BelowThreshold { growth: u64 },
    RateLimited,
    /// The monitor's own busy flag is held by another pass.
    AlreadyRunning { detail: String },
    SiblingBusy { probe: String, detail: String },
    Triggered { start_line: u64, position: u64 },
    TriggerFailed { error: String },
}

/// Polls the log file and triggers ingest passes.
pub struct LiveFileMonitor {
    config: LiveMonitorConfig,
    pause_gate: Arc<PauseGate>,
    positions: LogPositionStore,
    trigger: Arc<dyn IngestTrigger>,
    probes: Vec<Arc<dyn BusyProbe>>,
    line_counter: LineCounter,
    busy: BusyFlag,
    state: MonitorState,
    last_size: Option<u64>,
    last_trigger: Option<Instant>,
    file_missing: bool,
}

impl LiveFileMonitor {
    pub fn new(
        config: LiveMonitorConfig,
        pause_gate: Arc<PauseGate>,
        positions: LogPositionStore,
        trigger: Arc<dyn IngestTrigger>,
    ) -> Self {
        let line_counter = LineCounter::from_config(&config);
        Self {
            config,
            pause_gate,
            positions,
            trigger,
            probes: Vec::new(),
            line_counter,
            busy: BusyFlag::new("live-monitor"),
            state: MonitorState::Idle,
            last_size: None,
            last_trigger: None,
            file_missing: false,
        }
    }

    /// Skip triggering while `probe` reports busy.
    pub fn with_probe(mut self, probe: Arc<dyn BusyProbe>) -> Self {
        self.probes.push(probe);
        self
    }

    /// Probe other services can use to see a pass in flight.
    pub fn busy_flag(&self) -> BusyFlag {
        self.busy.clone()
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn log_path(&self) -> &Path {
        &self.config.log_path
    }

    pub async fn tick(&mut self, now: Instant) -> TickOutcome {
        if self.pause_gate.is_paused().await {
            return TickOutcome::Paused;
        }

        let size = match tokio::fs::metadata(&self.config.log_path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                if !self.file_missing {
                    info!(
                        path = %self.config.log_path.display(),
                        error = %e,
                        "Monitored log not available, waiting for it to appear"
                    );
                }
                self.file_missing = true;
                return TickOutcome::FileMissing;
            }
        };

        if self.file_missing {
            // Rotated: everything in the new file is unseen.
            info!(path = %self.config.log_path.display(), size, "Monitored log reappeared");
            self.file_missing = false;
            self.last_size = Some(0);
        }

        let Some(last_size) = self.last_size else {
            self.last_size = Some(size);
            debug!(size, "Live monitor baseline recorded");
            return TickOutcome::Baseline { size };
        };

        let last_size = if size < last_size {
            info!(previous = last_size, size, "Monitored log shrank, resetting tracking");
            self.last_size = Some(0);
            0
        } else {
            last_size
        };

        let growth = size - last_size;
        if growth < self.config.min_growth_bytes {
            return TickOutcome::BelowThreshold { growth };
        }

        if let Some(last) = self.last_trigger
            && now.saturating_duration_since(last) < self.config.min_trigger_interval()
        {
            return TickOutcome::RateLimited;
        }

        for probe in &self.probes {
            if let Some(detail) = probe.busy_with() {
                debug!(probe = probe.name(), %detail, "Sibling job busy, skipping ingest");
                return TickOutcome::SiblingBusy {
                    probe: probe.name().to_string(),
                    detail,
                };
            }
        }

        let Some(_guard) = self.busy.try_acquire("incremental log ingest") else {
            let detail = self.busy.busy_with().unwrap_or_default();
            debug!(%detail, "Incremental ingest already in progress");
            return TickOutcome::AlreadyRunning { detail };
        };
        self.state = MonitorState::Triggering;
        self.last_trigger = Some(now);
        let outcome = self.trigger_pass(size, growth).await;
        self.state = MonitorState::Idle;
        outcome
    }

    async fn trigger_pass(&mut self, size: u64, growth: u64) -> TickOutcome {
        match self.ingest_from_position(size, growth).await {
            Ok((start_line, position)) => TickOutcome::Triggered {
                start_line,
                position,
            },
            Err(e) => {
                warn!(error = %e, "Incremental log ingest failed, will retry");
                TickOutcome::TriggerFailed {
                    error: e.to_string(),
                }
            }
        }
    }

    async fn ingest_from_position(&mut self, size: u64, growth: u64) -> Result<(u64, u64)> {
        let path = self.config.log_path.clone();
        let recorded = self.positions.get().await?;
        let line_count = self.line_counter.count(&path).await?;
        // Truncation can leave the recorded position past the end.
        let start_line = recorded.min(line_count);

        debug!(growth, recorded, line_count, start_line, "Triggering incremental log ingest");
        let outcome = self.trigger.ingest(&path, start_line).await?;

        let position = outcome.total_lines.unwrap_or(line_count);
        self.positions.set(position).await?;
        self.last_size = Some(size);

        info!(start_line, position, growth, "Incremental log ingest finished");
        Ok((start_line, position))
    }

    /// Run until `token` is cancelled.
    pub async fn run(mut self, token: CancellationToken) {
        info!(
            path = %self.config.log_path.display(),
            datasource = %self.config.datasource,
            "Live log monitor starting"
        );

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(self.config.startup_delay()) => {}
        }

        let mut ticker = interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Live log monitor shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let outcome = self.tick(Instant::now()).await;
                    trace!(?outcome, "Live monitor tick");
                }
            }
        }
    }

    pub fn start_background_task(self, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(token))
    }
}
