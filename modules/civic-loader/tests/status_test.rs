mod common;

use std::time::Duration;

use futures::StreamExt;

use civic_common::{ExecutionStatus, PhaseState, SessionStatus, Strategy};
use civic_scout::testing::{Script, ScriptedLauncher};

use common::{eventually, harness};

#[tokio::test]
async fn idle_reports_no_session() {
    let h = harness(ScriptedLauncher::new());
    let status = h.app.reporter.status().await;

    assert_eq!(status.status, SessionStatus::NoSession);
    assert_eq!(status.overall_percentage, 0.0);
    assert_eq!(status.current_phase, None);
    assert_eq!(status.phases.len(), 7);
    assert!(status.is_final());
}

#[tokio::test]
async fn progress_is_weighted_by_phase_estimates() {
    let h = harness(ScriptedLauncher::new());
    let controller = &h.app.controller;

    controller.start(Strategy::Balanced, false).await.unwrap();
    controller.execute_current_phase().await.unwrap();
    controller.execute_current_phase().await.unwrap();

    // preparation (5) and federal_core (30) of 480 minutes
    let status = h.app.reporter.status().await;
    assert!((status.overall_percentage - 35.0 / 480.0 * 100.0).abs() < 1e-6);
    assert_eq!(status.current_phase.as_deref(), Some("provincial_tier1"));
    assert_eq!(status.phases[1].state, PhaseState::Completed);
    assert_eq!(status.phases[1].jurisdictions_done, 1);
    assert_eq!(status.phases[2].percentage, 0.0);
    assert_eq!(status.strategy, Some(Strategy::Balanced));
}

#[tokio::test]
async fn running_phase_counts_finished_jurisdictions() {
    let launcher = ScriptedLauncher::new()
        .script("ca_on_legislature", Script::Hang)
        .script("ca_qc_assemblee_nationale", Script::Hang);
    let h = harness(launcher);
    let controller = h.app.controller.clone();

    controller.start(Strategy::Balanced, false).await.unwrap();
    controller.execute_current_phase().await.unwrap();
    controller.execute_current_phase().await.unwrap();

    let running = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.execute_current_phase().await })
    };
    let log = h.log.clone();
    eventually(|| {
        let rows = log.rows();
        rows.iter().filter(|r| r.status == ExecutionStatus::Completed).count() == 3
            && rows.iter().filter(|r| r.status == ExecutionStatus::Running).count() == 2
    })
    .await;

    let status = h.app.reporter.status().await;
    let tier1 = &status.phases[2];
    assert_eq!(tier1.state, PhaseState::Running);
    assert_eq!(tier1.jurisdictions_done, 2);
    assert_eq!(tier1.percentage, 50.0);
    let expected = (35.0 + 60.0 * 0.5) / 480.0 * 100.0;
    assert!((status.overall_percentage - expected).abs() < 1e-6);
    assert!(status.current_operation.contains("Provincial Tier 1"));

    controller.cancel("test over").await.unwrap();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn retried_phase_progress_counts_only_the_new_attempt() {
    let failing = || Script::Fail {
        exit_code: 1,
        stderr: "source unavailable".into(),
    };
    let launcher = ScriptedLauncher::new()
        .script("ca_on_legislature", failing())
        .script("ca_qc_assemblee_nationale", failing());
    let h = harness(launcher);
    let controller = h.app.controller.clone();

    controller.start(Strategy::Balanced, true).await.unwrap();
    controller.drive().await.unwrap();
    assert_eq!(h.app.reporter.status().await.phases[2].state, PhaseState::Failed);

    h.launcher.set("ca_on_legislature", Script::Hang);
    h.launcher.set("ca_qc_assemblee_nationale", Script::Hang);
    controller.retry_current_phase("sources back").await.unwrap();
    let running = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.execute_current_phase().await })
    };
    let log = h.log.clone();
    eventually(|| {
        let rows = log.rows();
        rows.iter().filter(|r| r.status == ExecutionStatus::Completed).count() == 5
            && rows.iter().filter(|r| r.status == ExecutionStatus::Running).count() == 2
    })
    .await;

    let tier1 = h.app.reporter.status().await.phases[2].clone();
    assert_eq!(tier1.state, PhaseState::Running);
    assert_eq!(tier1.jurisdictions_done, 2);
    assert_eq!(tier1.percentage, 50.0);

    controller.cancel("test over").await.unwrap();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn stream_ends_once_the_session_completes() {
    let h = harness(ScriptedLauncher::new());
    let controller = h.app.controller.clone();
    controller.start(Strategy::Aggressive, false).await.unwrap();

    let collected = {
        let stream = h.app.reporter.stream_status(Duration::from_secs(60));
        tokio::spawn(stream.collect::<Vec<_>>())
    };
    controller.drive().await.unwrap();

    let snapshots = tokio::time::timeout(Duration::from_secs(5), collected)
        .await
        .unwrap()
        .unwrap();
    let last = snapshots.last().unwrap();
    assert_eq!(last.status, SessionStatus::Completed);
    assert_eq!(last.overall_percentage, 100.0);
    assert!(snapshots
        .windows(2)
        .all(|w| w[0].overall_percentage <= w[1].overall_percentage));
}

#[tokio::test]
async fn stream_ends_on_cancel() {
    let h = harness(ScriptedLauncher::new());
    let controller = h.app.controller.clone();
    controller.start(Strategy::Balanced, true).await.unwrap();

    let mut stream = Box::pin(h.app.reporter.stream_status(Duration::from_secs(60)));
    let first = stream.next().await.unwrap();
    assert_eq!(first.status, SessionStatus::Running);
    assert_eq!(first.overall_percentage, 0.0);

    controller.cancel("stopping").await.unwrap();
    let last = stream.next().await.unwrap();
    assert_eq!(last.status, SessionStatus::Cancelled);
    assert_eq!(last.current_operation, "Cancelled: stopping");
    assert!(stream.next().await.is_none());
}
