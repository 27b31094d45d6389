#![cfg(unix)]

mod common;

use std::time::Duration;

use cachekeeper::database::repositories::OperationStateRepository;
use cachekeeper::notification::OperationEvent;
use cachekeeper::operation::{
    CancellationController, DeleteMode, JobSpec, LaunchMode, OperationStatus, RUNNING_PERCENT_CAP,
};
use common::{cache_worker, completions, drain_events, harness, ingest_worker};

fn clear(cache_dir: std::path::PathBuf) -> JobSpec {
    JobSpec::CacheClear {
        cache_dir,
        delete_mode: DeleteMode::Preserve,
        threads: 2,
    }
}

#[tokio::test]
async fn missing_cache_subdirs_fail_without_spawning() {
    let h = harness(|dir, w| {
        w.with_cache_clean_bin(cache_worker(dir, r#"touch "$1/spawned""#))
    });
    let cache = h.path("empty-cache");
    std::fs::create_dir_all(cache.join("not-hex")).unwrap();
    let mut rx = h.notifier.subscribe();

    let id = h.orchestrator.start(clear(cache.clone()), LaunchMode::Notify).await;

    let op = h.snapshot(&id);
    assert_eq!(op.status, OperationStatus::Failed);
    assert!(op.end_time.is_some());
    assert!(op.error.unwrap().contains(&cache.display().to_string()));

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!cache.join("spawned").exists());
    assert_eq!(completions(&drain_events(&mut rx, &id)), 1);
    assert_eq!(h.store.get(&id).unwrap().status, OperationStatus::Failed);
}

#[tokio::test]
async fn missing_worker_binary_fails() {
    let h = harness(|_, w| w);
    let cache = h.cache_dir();
    let id = h.orchestrator.start(clear(cache), LaunchMode::Notify).await;

    let op = h.snapshot(&id);
    assert_eq!(op.status, OperationStatus::Failed);
    assert!(op.error.unwrap().contains("missing-cache-worker"));
}

#[tokio::test]
async fn successful_clear_reports_final_counters() {
    let h = harness(|dir, w| {
        w.with_cache_clean_bin(cache_worker(
            dir,
            r#"
progress '{"isProcessing":true,"percentComplete":50,"directoriesProcessed":1,"totalDirectories":2,"filesDeleted":3,"bytesDeleted":300,"message":"Clearing"}'
sleep 0.3
progress '{"isProcessing":false,"percentComplete":100,"directoriesProcessed":2,"totalDirectories":2,"filesDeleted":6,"bytesDeleted":600,"message":"Cleared 6 files"}'
exit 0
"#,
        ))
    });
    let cache = h.cache_dir();
    let mut rx = h.notifier.subscribe();

    let id = h.orchestrator.start(clear(cache), LaunchMode::Notify).await;
    let op = h.wait_terminal(&id).await;

    assert_eq!(op.status, OperationStatus::Completed);
    assert_eq!(op.progress.percent_complete, 100.0);
    assert_eq!(op.progress.files_deleted, 6);
    assert_eq!(op.progress.bytes_deleted, 600);
    assert_eq!(op.progress.directories_processed, 2);
    assert_eq!(op.status_message.as_deref(), Some("Cleared 6 files"));
    assert!(op.error.is_none());
    assert!(!h.registry().get(&id).unwrap().has_worker());

    tokio::time::sleep(Duration::from_millis(200)).await;
    let progress_file = h.path("progress").join(format!("cache_clear_{id}.json"));
    assert!(!progress_file.exists());
    assert_eq!(h.store.get(&id).unwrap().status, OperationStatus::Completed);

    let events = drain_events(&mut rx, &id);
    assert_eq!(completions(&events), 1);
    assert!(events.iter().any(|e| matches!(e, OperationEvent::Progress(_))));
    match events.last().unwrap() {
        OperationEvent::Complete(done) => {
            assert!(done.success);
            assert!(!done.cancelled);
            assert_eq!(done.progress.files_deleted, 6);
        }
        other => panic!("expected completion last, got {other:?}"),
    }
}

#[tokio::test]
async fn percent_is_capped_and_monotonic_while_running() {
    let h = harness(|dir, w| {
        w.with_cache_clean_bin(cache_worker(
            dir,
            r#"
progress '{"percentComplete":100,"filesDeleted":1}'
sleep 0.6
progress '{"percentComplete":40,"filesDeleted":2}'
sleep 0.6
exit 0
"#,
        ))
    });
    let cache = h.cache_dir();

    let id = h.orchestrator.start(clear(cache), LaunchMode::Notify).await;
    let op = h.wait_for(&id, |op| op.progress.files_deleted >= 1).await;
    assert_eq!(op.status, OperationStatus::Running);
    assert_eq!(op.progress.percent_complete, RUNNING_PERCENT_CAP);

    let op = h.wait_for(&id, |op| op.progress.files_deleted >= 2).await;
    if op.status == OperationStatus::Running {
        assert_eq!(op.progress.percent_complete, RUNNING_PERCENT_CAP);
    }

    let op = h.wait_terminal(&id).await;
    assert_eq!(op.status, OperationStatus::Completed);
    assert_eq!(op.progress.percent_complete, 100.0);
}

#[tokio::test]
async fn worker_failure_carries_stderr() {
    let h = harness(|dir, w| {
        w.with_cache_clean_bin(cache_worker(
            dir,
            r#"
echo "permission denied on 3f/ab" >&2
exit 3
"#,
        ))
    });
    let cache = h.cache_dir();
    let mut rx = h.notifier.subscribe();

    let id = h.orchestrator.start(clear(cache), LaunchMode::Notify).await;
    let op = h.wait_terminal(&id).await;

    assert_eq!(op.status, OperationStatus::Failed);
    let error = op.error.unwrap();
    assert!(error.contains("code 3"), "{error}");
    assert!(error.contains("permission denied on 3f/ab"), "{error}");
    assert!(op.progress.percent_complete < 100.0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(completions(&drain_events(&mut rx, &id)), 1);
}

#[tokio::test]
async fn cancel_request_yields_cancelled_not_failed() {
    let h = harness(|dir, w| {
        w.with_cache_clean_bin(cache_worker(
            dir,
            r#"
progress '{"percentComplete":10,"message":"Clearing"}'
sleep 2
touch "$1/survived"
"#,
        ))
    });
    let cache = h.cache_dir();
    let mut rx = h.notifier.subscribe();
    let cancellation = CancellationController::new(h.orchestrator.clone());

    let id = h.orchestrator.start(clear(cache.clone()), LaunchMode::Notify).await;
    h.wait_for(&id, |op| op.status == OperationStatus::Running).await;

    assert!(cancellation.request_cancel(&id));
    let op = h.wait_terminal(&id).await;
    assert_eq!(op.status, OperationStatus::Cancelled);
    assert!(op.error.is_none());
    assert!(op.end_time.is_some());

    // The killed worker's exit must not turn the record into a failure.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    let op = h.snapshot(&id);
    assert_eq!(op.status, OperationStatus::Cancelled);
    assert!(op.error.is_none());
    assert!(!cache.join("survived").exists());
    assert!(!h.registry().get(&id).unwrap().has_worker());
    assert_eq!(h.store.get(&id).unwrap().status, OperationStatus::Cancelled);

    let events = drain_events(&mut rx, &id);
    assert_eq!(completions(&events), 1);
    assert!(events.iter().any(|e| matches!(e, OperationEvent::Complete(c) if c.cancelled)));

    assert!(!cancellation.request_cancel(&id));
}

#[tokio::test]
async fn force_kill_is_synchronous() {
    let h = harness(|dir, w| {
        w.with_cache_clean_bin(cache_worker(
            dir,
            r#"
sleep 2
touch "$1/survived"
"#,
        ))
    });
    let cache = h.cache_dir();
    let mut rx = h.notifier.subscribe();
    let cancellation = CancellationController::new(h.orchestrator.clone());

    let id = h.orchestrator.start(clear(cache.clone()), LaunchMode::Notify).await;
    h.wait_for(&id, |op| op.status == OperationStatus::Running).await;

    assert!(cancellation.force_kill(&id).await);
    let op = h.snapshot(&id);
    assert_eq!(op.status, OperationStatus::Cancelled);
    assert_eq!(op.status_message.as_deref(), Some("Operation force killed"));
    assert!(!h.registry().get(&id).unwrap().has_worker());
    assert_eq!(h.store.get(&id).unwrap().status, OperationStatus::Cancelled);

    assert!(!cancellation.force_kill(&id).await);

    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(!cache.join("survived").exists());
    assert_eq!(h.snapshot(&id).status, OperationStatus::Cancelled);
    assert_eq!(completions(&drain_events(&mut rx, &id)), 1);
}

#[tokio::test]
async fn silent_run_suppresses_progress_events() {
    let h = harness(|dir, w| {
        w.with_log_ingest_bin(ingest_worker(
            dir,
            r#"
echo "$4" > "$(dirname "$2")/start_line"
progress '{"percent_complete":60,"lines_parsed":3,"total_lines":5}'
sleep 0.3
progress '{"percent_complete":100,"lines_parsed":5,"total_lines":5,"entries_saved":5}'
"#,
        ))
    });
    let log = h.path("access.log");
    std::fs::write(&log, "1\n2\n3\n4\n5\n").unwrap();
    let mut rx = h.notifier.subscribe();

    let op = h
        .orchestrator
        .run(
            JobSpec::LogIngest {
                log_path: log,
                start_line: 2,
            },
            LaunchMode::Silent,
        )
        .await;

    assert_eq!(op.status, OperationStatus::Completed);
    assert!(op.silent);
    assert_eq!(op.progress.total_lines, 5);
    assert_eq!(op.progress.entries_saved, 5);
    assert_eq!(
        std::fs::read_to_string(h.path("start_line")).unwrap().trim(),
        "2"
    );

    let events = drain_events(&mut rx, &op.id);
    assert_eq!(events.len(), 1);
    assert_eq!(completions(&events), 1);
}

#[tokio::test]
async fn snapshots_reload_from_store() {
    let h = harness(|dir, w| w.with_cache_clean_bin(cache_worker(dir, "exit 0")));
    let cache = h.cache_dir();
    let id = h.orchestrator.start(clear(cache), LaunchMode::Notify).await;
    h.wait_terminal(&id).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let reloaded = h.store.load_recent(Duration::from_secs(3600)).await.unwrap();
    assert_eq!(reloaded.len(), 1);
    assert_eq!(reloaded[0].id, id);
    assert_eq!(reloaded[0].status, OperationStatus::Completed);
}
