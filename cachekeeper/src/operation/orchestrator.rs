//! Launches external workers and drives their operations to a terminal state.
//!
//! Each job runs two cooperating tasks: the exit-wait path owns the child
//! process, the poll loop reads the progress file and watches for cancel
//! requests. Finalisation waits for both. All writes to the operation go
//! through its [`TrackedOperation`] lock.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::model::{JobSpec, Operation, OperationKind, OperationStatus};
use super::progress::ProgressReader;
use super::registry::{OperationRegistry, Termination, TrackedOperation, WorkerHandle};
use crate::config::{OrchestratorConfig, WorkerConfig};
use crate::database::repositories::OperationStateRepository;
use crate::notification::Notifier;
use crate::{Error, Result};

/// Keep at most this much of a worker's stdout/stderr.
const MAX_CAPTURED_OUTPUT: usize = 64 * 1024;

/// Whether per-tick progress is pushed to the notifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    Notify,
    /// Internal passes: completion is still announced, ticks are not.
    Silent,
}

impl LaunchMode {
    fn notifies(self) -> bool {
        self == Self::Notify
    }
}

/// A fully resolved worker command line.
#[derive(Debug, Clone)]
pub struct WorkerInvocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub progress_path: PathBuf,
}

/// How the worker process ended.
#[derive(Debug)]
struct WorkerExit {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

/// Spawns workers, polls their progress and finalises their operations.
pub struct ProcessOrchestrator {
    config: OrchestratorConfig,
    workers: WorkerConfig,
    registry: Arc<OperationRegistry>,
    store: Arc<dyn OperationStateRepository>,
    notifier: Arc<dyn Notifier>,
}

impl ProcessOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        workers: WorkerConfig,
        registry: Arc<OperationRegistry>,
        store: Arc<dyn OperationStateRepository>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            workers,
            registry,
            store,
            notifier,
        }
    }

    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }

    pub fn workers(&self) -> &WorkerConfig {
        &self.workers
    }

    /// Validate and launch a job, returning its id immediately.
    ///
    /// Precondition failures produce a terminal `Failed` operation and no
    /// worker is spawned. Progress is observed through the registry or the
    /// notifier, not through the return value.
    pub async fn start(self: &Arc<Self>, spec: JobSpec, mode: LaunchMode) -> String {
        let (tracked, invocation) = self.prepare(spec, mode).await;
        let id = tracked.id().to_string();

        if let Some(invocation) = invocation {
            let this = self.clone();
            tokio::spawn(async move {
                this.execute(tracked, invocation, mode).await;
            });
        }

        id
    }

    /// Validate and run a job to completion, returning its final record.
    pub async fn run(self: &Arc<Self>, spec: JobSpec, mode: LaunchMode) -> Operation {
        let (tracked, invocation) = self.prepare(spec, mode).await;
        if let Some(invocation) = invocation {
            self.execute(tracked.clone(), invocation, mode).await;
        }
        tracked.snapshot()
    }

    /// Register the operation and run the pre-flight checks.
    async fn prepare(
        &self,
        spec: JobSpec,
        mode: LaunchMode,
    ) -> (Arc<TrackedOperation>, Option<WorkerInvocation>) {
        let kind = spec.kind();
        let tracked = self.registry.create(kind, mode == LaunchMode::Silent);
        let id = tracked.id().to_string();

        match self.validate(&id, &spec) {
            Ok(invocation) => {
                debug!(operation_id = %id, %kind, program = %invocation.program.display(), "Operation prepared");
                self.persist(&tracked.snapshot()).await;
                (tracked, Some(invocation))
            }
            Err(e) => {
                warn!(operation_id = %id, %kind, error = %e, "Operation rejected by pre-flight check");
                self.conclude(&tracked, Termination::failed(e.to_string()))
                    .await;
                (tracked, None)
            }
        }
    }

    /// Synchronous pre-flight checks; builds the worker command line.
    pub fn validate(&self, operation_id: &str, spec: &JobSpec) -> Result<WorkerInvocation> {
        let progress_path = self
            .workers
            .progress_dir
            .join(format!("{}_{}.json", spec.kind(), operation_id));

        match spec {
            JobSpec::CacheClear {
                cache_dir,
                delete_mode,
                threads,
            } => {
                check_cache_dir(cache_dir)?;
                if *delete_mode == super::DeleteMode::Rsync && !rsync_available() {
                    return Err(Error::precondition(
                        "Delete mode 'rsync' requires rsync, which is not installed on this host",
                    ));
                }
                check_worker(&self.workers.cache_clean_bin, "Cache clean")?;

                Ok(WorkerInvocation {
                    program: self.workers.cache_clean_bin.clone(),
                    args: vec![
                        cache_dir.clone().into_os_string(),
                        progress_path.clone().into_os_string(),
                        (*threads).max(1).to_string().into(),
                        delete_mode.as_str().into(),
                    ],
                    progress_path,
                })
            }
            JobSpec::LogIngest {
                log_path,
                start_line,
            } => {
                if !log_path.is_file() {
                    return Err(Error::precondition(format!(
                        "Log file not found: {}",
                        log_path.display()
                    )));
                }
                check_worker(&self.workers.log_ingest_bin, "Log ingest")?;

                Ok(WorkerInvocation {
                    program: self.workers.log_ingest_bin.clone(),
                    args: vec![
                        self.workers.ingest_db_path.clone().into_os_string(),
                        log_path.clone().into_os_string(),
                        progress_path.clone().into_os_string(),
                        start_line.to_string().into(),
                    ],
                    progress_path,
                })
            }
        }
    }

    /// Top level of a job's task. Any error ends the operation as `Failed`.
    async fn execute(
        self: &Arc<Self>,
        tracked: Arc<TrackedOperation>,
        invocation: WorkerInvocation,
        mode: LaunchMode,
    ) {
        let reader = ProgressReader::new(&invocation.progress_path);

        if let Err(e) = self.drive(&tracked, &invocation, &reader, mode).await {
            if e.is_expected() {
                warn!(operation_id = %tracked.id(), error = %e, "Operation failed");
            } else {
                error!(operation_id = %tracked.id(), error = ?e, "Operation failed unexpectedly");
            }

            if let Some(worker) = tracked.clear_worker() {
                worker.kill.cancel();
                if let Err(kill_err) = process_utils::kill_process_tree(worker.pid) {
                    warn!(operation_id = %tracked.id(), error = %kill_err, "Failed to kill worker");
                }
            }
            self.conclude(&tracked, Termination::failed(e.to_string()))
                .await;
        }

        reader.remove().await;
    }

    async fn drive(
        self: &Arc<Self>,
        tracked: &Arc<TrackedOperation>,
        invocation: &WorkerInvocation,
        reader: &ProgressReader,
        mode: LaunchMode,
    ) -> Result<()> {
        if let Some(dir) = invocation.progress_path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| Error::io_path("creating progress directory", dir, e))?;
        }
        // A leftover file from an earlier run would be read as fresh progress.
        reader.remove().await;

        let mut command = process_utils::tokio_group_command(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if tracked.is_cancel_requested() || tracked.is_terminal() {
            info!(operation_id = %tracked.id(), "Operation stopped before its worker was spawned");
            self.conclude(tracked, Termination::cancelled("Operation cancelled by user"))
                .await;
            return Ok(());
        }

        let mut child = command
            .spawn()
            .map_err(|e| Error::io_path("spawning worker", &invocation.program, e))?;
        let pid = child
            .id()
            .ok_or_else(|| Error::Other("Worker exited before it could be tracked".to_string()))?;

        let kill = CancellationToken::new();
        let op = tracked.mark_running(
            WorkerHandle {
                pid,
                kill: kill.clone(),
            },
            "Running",
        )?;
        info!(operation_id = %op.id, kind = %op.kind, pid, "Worker started");
        self.persist(&op).await;
        if mode.notifies() {
            self.push_progress(&op).await;
        }

        let stdout = capture(child.stdout.take());
        let stderr = capture(child.stderr.take());

        let exited = CancellationToken::new();
        let poller = {
            let this = self.clone();
            let tracked = tracked.clone();
            let reader = reader.clone();
            let exited = exited.clone();
            tokio::spawn(async move { this.poll_loop(tracked, reader, mode, exited).await })
        };

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = kill.cancelled() => None,
        };
        let status = match waited {
            Some(status) => status,
            None => {
                if let Err(e) = process_utils::kill_process_tree(pid) {
                    warn!(operation_id = %tracked.id(), pid, error = %e, "Failed to kill worker tree");
                }
                child.wait().await
            }
        };

        // Rendezvous: the poll loop consumes its final tick before we finalise.
        exited.cancel();
        if let Err(e) = poller.await {
            error!(operation_id = %tracked.id(), error = %e, "Progress poll loop panicked");
        }

        let status = status.map_err(|e| Error::io_path("waiting for worker", &invocation.program, e))?;
        let exit = WorkerExit {
            exit_code: process_utils::exit_code(&status),
            stdout: join_capture(stdout).await,
            stderr: join_capture(stderr).await,
        };
        tracked.clear_worker();

        self.finalize(tracked, exit, reader).await
    }

    async fn poll_loop(
        &self,
        tracked: Arc<TrackedOperation>,
        reader: ProgressReader,
        mode: LaunchMode,
        exited: CancellationToken,
    ) {
        let interval = self.config.poll_interval();
        let snapshot_every = self.config.snapshot_every.max(1);
        let mut updates: u32 = 0;

        loop {
            let exiting = tokio::select! {
                biased;
                _ = exited.cancelled() => true,
                _ = tokio::time::sleep(interval) => false,
            };

            if tracked.is_cancel_requested() {
                if let Some(worker) = tracked.worker() {
                    worker.kill.cancel();
                }
                if self
                    .conclude(&tracked, Termination::cancelled("Operation cancelled by user"))
                    .await
                    .is_some()
                {
                    info!(operation_id = %tracked.id(), "Operation cancelled");
                }
                break;
            }

            if let Some(record) = reader.read().await
                && let Some(op) =
                    tracked.apply_progress(&record.to_progress(), record.message.as_deref())
            {
                updates += 1;
                if mode.notifies() {
                    self.push_progress(&op).await;
                }
                if updates % snapshot_every == 0 {
                    self.persist(&op).await;
                }
            }

            if exiting || tracked.is_terminal() {
                break;
            }
        }
    }

    /// Interpret the exit code once both tasks are done.
    async fn finalize(
        &self,
        tracked: &Arc<TrackedOperation>,
        exit: WorkerExit,
        reader: &ProgressReader,
    ) -> Result<()> {
        let current = tracked.snapshot();
        if !exit.stdout.is_empty() {
            debug!(operation_id = %current.id, stdout = %exit.stdout.trim_end(), "Worker output");
        }

        if current.status == OperationStatus::Cancelled {
            // SIGKILL after a cancel request is the expected outcome.
            if exit.exit_code != process_utils::SIGKILL_EXIT_CODE {
                debug!(operation_id = %current.id, exit_code = exit.exit_code, "Worker exited after cancellation");
            }
            return Ok(());
        }
        if current.is_terminal() {
            return Ok(());
        }

        if exit.exit_code == 0 {
            let record = reader.read().await;
            let message = record
                .as_ref()
                .and_then(|r| r.message.clone())
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| default_completion_message(&current));
            let mut termination = Termination::completed(message);
            if let Some(record) = record {
                termination = termination.with_progress(record.to_progress());
            }
            if let Some(op) = self.conclude(tracked, termination).await {
                info!(
                    operation_id = %op.id,
                    kind = %op.kind,
                    duration_secs = op.duration().num_seconds(),
                    "Operation completed"
                );
            }
            return Ok(());
        }

        let stderr = exit.stderr.trim();
        Err(Error::Worker {
            exit_code: exit.exit_code,
            stderr: if stderr.is_empty() {
                "(no output)".to_string()
            } else {
                stderr.to_string()
            },
        })
    }

    /// Make a terminal transition and, if this call made it, announce it.
    pub(crate) async fn conclude(
        &self,
        tracked: &TrackedOperation,
        termination: Termination,
    ) -> Option<Operation> {
        let op = tracked.finish(termination)?;
        self.announce_terminal(&op).await;
        Some(op)
    }

    /// One completion push and one snapshot write. Failures are only logged.
    pub(crate) async fn announce_terminal(&self, op: &Operation) {
        if let Err(e) = self.notifier.send_complete(op.into()).await {
            warn!(operation_id = %op.id, error = %e, "Failed to push completion event");
        }
        self.persist(op).await;
    }

    async fn push_progress(&self, op: &Operation) {
        if let Err(e) = self.notifier.send_progress(op.into()).await {
            warn!(operation_id = %op.id, error = %e, "Failed to push progress event");
        }
    }

    pub(crate) async fn persist(&self, op: &Operation) {
        if let Err(e) = self.store.upsert(op).await {
            warn!(operation_id = %op.id, error = %e, "Failed to persist operation snapshot");
        }
    }
}

fn default_completion_message(op: &Operation) -> String {
    match op.kind {
        OperationKind::CacheClear => format!(
            "Cache cleared: {} files ({} bytes) from {} directories",
            op.progress.files_deleted, op.progress.bytes_deleted, op.progress.directories_processed
        ),
        OperationKind::LogIngest => format!(
            "Log ingest finished: {} lines parsed, {} entries saved",
            op.progress.lines_parsed, op.progress.entries_saved
        ),
    }
}

fn is_hex_dir_name(name: &str) -> bool {
    name.len() == 2 && name.chars().all(|c| c.is_ascii_hexdigit())
}

fn check_cache_dir(cache_dir: &Path) -> Result<()> {
    if !cache_dir.is_dir() {
        return Err(Error::precondition(format!(
            "Cache directory does not exist: {}",
            cache_dir.display()
        )));
    }

    tempfile::NamedTempFile::new_in(cache_dir).map_err(|e| {
        Error::precondition(format!(
            "Cache directory is not writable: {} ({e})",
            cache_dir.display()
        ))
    })?;

    let entries = std::fs::read_dir(cache_dir).map_err(|e| {
        Error::precondition(format!(
            "Cache directory is not readable: {} ({e})",
            cache_dir.display()
        ))
    })?;
    let has_cache_dirs = entries.filter_map(|entry| entry.ok()).any(|entry| {
        entry.path().is_dir() && entry.file_name().to_str().is_some_and(is_hex_dir_name)
    });
    if !has_cache_dirs {
        return Err(Error::precondition(format!(
            "No cache directories (00-ff) found in {}",
            cache_dir.display()
        )));
    }

    Ok(())
}

fn check_worker(program: &Path, label: &str) -> Result<()> {
    if program.is_file() {
        Ok(())
    } else {
        Err(Error::precondition(format!(
            "{label} worker not found: {}",
            program.display()
        )))
    }
}

/// Whether `rsync` can be executed on this host.
pub fn rsync_available() -> bool {
    process_utils::std_command("rsync")
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}

fn capture<R>(stream: Option<R>) -> Option<JoinHandle<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let stream = stream?;
    Some(tokio::spawn(async move {
        let tail = read_tail(stream, MAX_CAPTURED_OUTPUT).await;
        String::from_utf8_lossy(&tail).into_owned()
    }))
}

/// Drain `stream` to EOF, keeping only its last `limit` bytes.
async fn read_tail<R>(mut stream: R, limit: usize) -> Vec<u8>
where
    R: AsyncRead + Unpin,
{
    let mut tail = Vec::with_capacity(limit.min(8 * 1024));
    let mut chunk = [0u8; 8 * 1024];
    loop {
        let n = match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        tail.extend_from_slice(&chunk[..n]);
        if tail.len() > limit {
            tail.drain(..tail.len() - limit);
        }
    }
    tail
}

async fn join_capture(handle: Option<JoinHandle<String>>) -> String {
    match handle {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    }
}
