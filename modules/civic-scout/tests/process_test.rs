//! Runs real child processes through `sh`. Unix only.
#![cfg(unix)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use civic_common::{ExecutionStatus, SystemClock};
use civic_scout::runner::{LaunchOutcome, LaunchRequest, Launcher};
use civic_scout::testing::{descriptor, fixture_records};
use civic_scout::{ProcessLauncher, RunOptions, ScraperRunner, WorkerCommand, WorkerRequest};
use civic_store::{
    heartbeat_cutoff, ExecutionLog, MemoryExecutionLog, MemoryRecordStore, RecordStore,
};
use tokio_util::sync::CancellationToken;

/// `sh -c <script> worker --jurisdiction .. --scraper .. --max-records ..`
fn shell(script: &str) -> ProcessLauncher {
    ProcessLauncher::new(WorkerCommand::new("sh", ["-c", script, "worker"]))
}

fn runner(launcher: ProcessLauncher) -> (ScraperRunner, Arc<MemoryExecutionLog>, Arc<MemoryRecordStore>) {
    let log = Arc::new(MemoryExecutionLog::new());
    let store = Arc::new(MemoryRecordStore::new());
    let runner = ScraperRunner::new(
        Arc::new(launcher),
        log.clone(),
        store.clone(),
        Arc::new(SystemClock),
    );
    (runner, log, store)
}

fn request(timeout: Duration) -> LaunchRequest {
    LaunchRequest {
        worker: WorkerRequest {
            jurisdiction_id: "ca_on".into(),
            scraper_id: "ca_on_legislature".into(),
            max_records: 10,
        },
        timeout,
    }
}

#[cfg(target_os = "linux")]
fn alive(pid: u32) -> bool {
    std::path::Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
fn alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

#[tokio::test]
async fn hanging_worker_is_killed_at_the_deadline() {
    let (runner, log, _store) = runner(shell("exec sleep 600"));
    let options = RunOptions::builder()
        .timeout(Duration::from_secs(1))
        .build();
    let started = Instant::now();

    let result = runner
        .run(&descriptor("ca_on", "ca_on_legislature"), &options)
        .await;

    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(result.status, ExecutionStatus::Failed);
    assert_eq!(result.error.as_deref(), Some("Timeout after 1 second"));
    let pid = result.pid.expect("worker was spawned");
    assert!(!alive(pid), "worker {pid} still alive after timeout");

    let row = log.get(result.execution_id.unwrap()).await.unwrap().unwrap();
    assert_eq!(row.status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn records_on_stdout_are_upserted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("records.jsonl");
    let lines: String = fixture_records(3)
        .iter()
        .map(|r| serde_json::to_string(r).unwrap() + "\n")
        .collect();
    std::fs::write(&path, lines + "garbage line\n").unwrap();

    let script = format!("echo 'starting' >&2; cat '{}'", path.display());
    let (runner, _log, store) = runner(shell(&script));

    let result = runner
        .run(&descriptor("ca_on", "ca_on_legislature"), &RunOptions::builder().build())
        .await;

    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.records_collected, 3);
    assert_eq!(result.error.as_deref(), Some("1 malformed record lines"));
    assert_eq!(store.count("ca_on").await.unwrap(), 3);
}

#[tokio::test]
async fn worker_receives_protocol_arguments() {
    let launcher = shell(r#"echo "$@" >&2; exit 3"#);
    let launch = launcher
        .launch(&request(Duration::from_secs(10)), &CancellationToken::new())
        .await;

    match launch.outcome {
        LaunchOutcome::Exited {
            success,
            exit_code,
            stderr,
            ..
        } => {
            assert!(!success);
            assert_eq!(exit_code, Some(3));
            assert_eq!(
                stderr.trim(),
                "--jurisdiction ca_on --scraper ca_on_legislature --max-records 10"
            );
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test]
async fn cancellation_kills_the_worker() {
    let launcher = shell("exec sleep 600");
    let cancel = CancellationToken::new();
    let trip = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trip.cancel();
    });

    let launch = launcher.launch(&request(Duration::from_secs(60)), &cancel).await;

    assert!(matches!(launch.outcome, LaunchOutcome::Cancelled));
    assert!(!alive(launch.pid.unwrap()));
}

#[tokio::test]
async fn missing_program_is_a_spawn_failure() {
    let launcher = ProcessLauncher::new(WorkerCommand::new(
        "/nonexistent/civic-worker",
        ["worker"],
    ));
    let (runner, log, _store) = runner(launcher);

    let result = runner
        .run(&descriptor("ca", "ca_house_of_commons"), &RunOptions::builder().build())
        .await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert!(result
        .error
        .as_deref()
        .unwrap()
        .starts_with("failed to spawn scraper process"));
    assert_eq!(log.rows().len(), 1);
}

#[tokio::test]
async fn output_past_the_capture_cap_is_truncated_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("records.jsonl");
    let padding = serde_json::Value::String("x".repeat(600));
    let lines: String = fixture_records(20_000)
        .into_iter()
        .map(|mut r| {
            r.fields.insert("notes".into(), padding.clone());
            serde_json::to_string(&r).unwrap() + "\n"
        })
        .collect();
    std::fs::write(&path, lines).unwrap();

    let (runner, log, store) = runner(shell(&format!("cat '{}'", path.display())));
    let options = RunOptions::builder()
        .max_records(10)
        .timeout(Duration::from_secs(60))
        .build();

    let result = runner
        .run(&descriptor("ca_on", "ca_on_legislature"), &options)
        .await;

    assert_eq!(result.status, ExecutionStatus::Completed, "{:?}", result.error);
    assert_eq!(result.records_collected, 10);
    assert_eq!(result.error, None);
    assert_eq!(store.count("ca_on").await.unwrap(), 10);
    let row = log.get(result.execution_id.unwrap()).await.unwrap().unwrap();
    assert_eq!(row.status, ExecutionStatus::Completed);
}

#[tokio::test]
async fn restart_reconcile_leaves_a_live_worker_running() {
    let record = serde_json::to_string(&fixture_records(1)[0]).unwrap();
    let (runner, log, store) = runner(shell(&format!("sleep 2; echo '{record}'")));
    let options = RunOptions::builder().timeout(Duration::from_secs(30)).build();

    let restart = async {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let now = Utc::now();
        log.reconcile_orphaned("orchestrator restarted", now, heartbeat_cutoff(now))
            .await
            .unwrap()
    };
    let desc = descriptor("ca_on", "ca_on_legislature");
    let (result, stopped) = tokio::join!(
        runner.run(&desc, &options),
        restart
    );

    assert_eq!(stopped, 0);
    assert_eq!(result.status, ExecutionStatus::Completed);
    assert_eq!(result.records_created, 1);
    assert_eq!(store.count("ca_on").await.unwrap(), 1);
    let row = log.get(result.execution_id.unwrap()).await.unwrap().unwrap();
    assert_eq!(row.status, ExecutionStatus::Completed);
}
