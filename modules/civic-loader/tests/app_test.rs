mod common;

use std::time::Duration;

use chrono::Utc;

use civic_common::{ExecutionStatus, ScraperExecution, Strategy};
use civic_loader::DriveOutcome;
use civic_scout::testing::{descriptor, fixture_records, Script, ScriptedLauncher};
use civic_store::ExecutionLog;

use common::{eventually, harness};

#[tokio::test]
async fn startup_reconcile_spares_another_orchestrators_live_run() {
    let h = harness(ScriptedLauncher::new().script(
        "ca_house_of_commons",
        Script::slow(fixture_records(1), Duration::from_millis(400)),
    ));
    let controller = h.app.controller.clone();

    // Left Running by a process that died an hour ago.
    let orphan = ScraperExecution::scheduled(&descriptor("ca_yt", "ca_yt_legislature"), None, None);
    h.log.record_scheduled(&orphan).await.unwrap();
    h.log
        .mark_running(orphan.id, Utc::now() - chrono::Duration::hours(1))
        .await
        .unwrap();

    controller.start(Strategy::Balanced, false).await.unwrap();
    let driving = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.drive().await })
    };
    let log = h.log.clone();
    eventually(|| {
        log.rows()
            .iter()
            .any(|r| r.scraper_id == "ca_house_of_commons" && r.status == ExecutionStatus::Running)
    })
    .await;

    assert_eq!(h.app.reconcile().await.unwrap(), 1);
    assert_eq!(driving.await.unwrap().unwrap(), DriveOutcome::Completed);

    let rows = h.log.rows();
    let federal = rows
        .iter()
        .find(|r| r.scraper_id == "ca_house_of_commons")
        .unwrap();
    assert_eq!(federal.status, ExecutionStatus::Completed);
    let orphan = h.log.get(orphan.id).await.unwrap().unwrap();
    assert_eq!(orphan.status, ExecutionStatus::Stopped);
    assert_eq!(orphan.last_error.as_deref(), Some("orchestrator restarted"));
}
