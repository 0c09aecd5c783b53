use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use civic_common::{Clock, ExecutionStatus, ScraperDescriptor};

use crate::runner::{RunOptions, RunResult, ScraperRunner};
use crate::scheduling::cadence::is_due;

#[derive(Debug, Clone, TypedBuilder)]
pub struct BatchOptions {
    #[builder(default = 4)]
    pub parallelism: usize,
    #[builder(default = 5_000)]
    pub max_records: usize,
    #[builder(default = Duration::from_secs(300))]
    pub timeout: Duration,
    #[builder(default, setter(strip_option))]
    pub session_id: Option<Uuid>,
    #[builder(default, setter(strip_option, into))]
    pub phase_key: Option<String>,
    #[builder(default)]
    pub cancel: CancellationToken,
}

impl BatchOptions {
    fn run_options(&self) -> RunOptions {
        RunOptions {
            max_records: self.max_records,
            timeout: self.timeout,
            session_id: self.session_id,
            phase_key: self.phase_key.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

/// Outcome of one batch. Every attempted scraper has a result, failed or not.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub results: Vec<RunResult>,
    /// Scrapers skipped because a previous run was still going.
    pub skipped_in_flight: Vec<String>,
}

impl BatchReport {
    pub fn attempted(&self) -> usize {
        self.results.len()
    }

    pub fn succeeded(&self) -> usize {
        self.count(ExecutionStatus::Completed)
    }

    pub fn failed(&self) -> usize {
        self.count(ExecutionStatus::Failed)
    }

    pub fn stopped(&self) -> usize {
        self.count(ExecutionStatus::Stopped)
    }

    pub fn records_collected(&self) -> u64 {
        self.results.iter().map(|r| r.records_collected).sum()
    }

    pub fn succeeded_jurisdictions(&self) -> HashSet<&str> {
        self.results
            .iter()
            .filter(|r| r.succeeded())
            .map(|r| r.jurisdiction_id.as_str())
            .collect()
    }

    pub fn merge(&mut self, other: BatchReport) {
        self.results.extend(other.results);
        self.skipped_in_flight.extend(other.skipped_in_flight);
    }

    fn count(&self, status: ExecutionStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\n=== Scraper Batch Complete ===")?;
        writeln!(f, "Scrapers run:      {}", self.attempted())?;
        writeln!(f, "  Completed:       {}", self.succeeded())?;
        writeln!(f, "  Failed:          {}", self.failed())?;
        writeln!(f, "  Stopped:         {}", self.stopped())?;
        writeln!(f, "Skipped (running): {}", self.skipped_in_flight.len())?;
        writeln!(f, "Records collected: {}", self.records_collected())?;
        writeln!(
            f,
            "  Created:         {}",
            self.results.iter().map(|r| r.records_created).sum::<u64>()
        )?;
        writeln!(
            f,
            "  Updated:         {}",
            self.results.iter().map(|r| r.records_updated).sum::<u64>()
        )?;
        let failures: Vec<_> = self.results.iter().filter(|r| !r.succeeded()).collect();
        if !failures.is_empty() {
            writeln!(f, "\nFailures:")?;
            for r in failures {
                writeln!(
                    f,
                    "  {} ({}): {}",
                    r.scraper_id,
                    r.status,
                    r.error.as_deref().unwrap_or("unknown")
                )?;
            }
        }
        Ok(())
    }
}

enum BatchItem {
    Ran(RunResult),
    InFlight(String),
}

/// Removes a scraper from the in-flight set when its run ends.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    scraper_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.scraper_id);
    }
}

/// Decides which scrapers are due and runs batches of them with bounded parallelism.
pub struct JurisdictionScheduler {
    descriptors: Vec<ScraperDescriptor>,
    runner: Arc<ScraperRunner>,
    clock: Arc<dyn Clock>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl JurisdictionScheduler {
    pub fn new(
        descriptors: Vec<ScraperDescriptor>,
        runner: Arc<ScraperRunner>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            descriptors,
            runner,
            clock,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn descriptors(&self) -> &[ScraperDescriptor] {
        &self.descriptors
    }

    pub fn descriptor_for(&self, jurisdiction_id: &str) -> Option<&ScraperDescriptor> {
        self.descriptors
            .iter()
            .find(|d| d.jurisdiction_id == jurisdiction_id)
    }

    pub fn is_in_flight(&self, scraper_id: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(scraper_id)
    }

    /// Scrapers whose cadence window has elapsed since their last success.
    pub async fn due(&self, now: DateTime<Utc>) -> Result<Vec<ScraperDescriptor>> {
        let mut due = Vec::new();
        for descriptor in &self.descriptors {
            if self.is_in_flight(&descriptor.scraper_identifier) {
                continue;
            }
            let last = self
                .runner
                .log()
                .last_success(&descriptor.scraper_identifier)
                .await?;
            if is_due(descriptor.cadence, last, now) {
                due.push(descriptor.clone());
            }
        }
        Ok(due)
    }

    /// Run every due scraper once.
    pub async fn run_due(&self, options: &BatchOptions) -> Result<BatchReport> {
        let due = self.due(self.clock.now()).await?;
        if due.is_empty() {
            return Ok(BatchReport::default());
        }
        info!(count = due.len(), "Running due scrapers");
        Ok(self.run_batch(due, options).await)
    }

    /// Run the given scrapers, at most `parallelism` at a time.
    ///
    /// One scraper's failure never affects its siblings. Completion order is unspecified.
    pub async fn run_batch(
        &self,
        descriptors: Vec<ScraperDescriptor>,
        options: &BatchOptions,
    ) -> BatchReport {
        let run_options = options.run_options();
        let items: Vec<BatchItem> = stream::iter(descriptors.into_iter().map(|descriptor| {
            let run_options = &run_options;
            async move {
                let Some(_guard) = self.claim(&descriptor.scraper_identifier) else {
                    warn!(scraper = %descriptor.scraper_identifier, "Already running, skipped");
                    return BatchItem::InFlight(descriptor.scraper_identifier);
                };
                BatchItem::Ran(self.runner.run(&descriptor, run_options).await)
            }
        }))
        .buffer_unordered(options.parallelism.max(1))
        .collect()
        .await;

        let mut report = BatchReport::default();
        for item in items {
            match item {
                BatchItem::Ran(result) => report.results.push(result),
                BatchItem::InFlight(id) => report.skipped_in_flight.push(id),
            }
        }
        report
    }

    /// Poll on `interval`, running due scrapers until cancelled.
    pub async fn run_forever(&self, interval: Duration, options: BatchOptions) -> BatchReport {
        let mut total = BatchReport::default();
        info!(interval_secs = interval.as_secs(), scrapers = self.descriptors.len(), "Scheduler started");

        loop {
            match self.run_due(&options).await {
                Ok(report) => {
                    if report.attempted() > 0 {
                        info!(
                            completed = report.succeeded(),
                            failed = report.failed(),
                            records = report.records_collected(),
                            "Scheduler tick finished"
                        );
                    }
                    total.merge(report);
                }
                Err(e) => warn!(error = %e, "Failed to evaluate due scrapers, will retry"),
            }

            tokio::select! {
                _ = options.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        info!("Scheduler stopped");
        total
    }

    fn claim(&self, scraper_id: &str) -> Option<InFlightGuard> {
        let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(scraper_id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            set: self.in_flight.clone(),
            scraper_id: scraper_id.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use civic_common::{Cadence, FixedClock, SystemClock};

    use crate::testing::{descriptor, fixture_records, runner_with_shared, Script, ScriptedLauncher};

    fn monthly(jurisdiction: &str, scraper: &str) -> ScraperDescriptor {
        ScraperDescriptor {
            cadence: Cadence::Monthly,
            ..descriptor(jurisdiction, scraper)
        }
    }

    fn scheduler(
        launcher: Arc<ScriptedLauncher>,
        descriptors: Vec<ScraperDescriptor>,
        clock: Arc<dyn Clock>,
    ) -> JurisdictionScheduler {
        let (runner, _log, _store) = runner_with_shared(launcher);
        JurisdictionScheduler::new(descriptors, Arc::new(runner), clock)
    }

    #[tokio::test]
    async fn monthly_scraper_due_only_on_the_first() {
        let mid_month = Utc.with_ymd_and_hms(2026, 9, 15, 9, 0, 0).unwrap();
        let first = Utc.with_ymd_and_hms(2026, 10, 1, 9, 0, 0).unwrap();
        let s = scheduler(
            Arc::new(ScriptedLauncher::new()),
            vec![monthly("ca_on_guelph", "ca_on_guelph_council")],
            Arc::new(FixedClock::new(mid_month)),
        );

        assert!(s.due(mid_month).await.unwrap().is_empty());
        let due = s.due(first).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].scraper_identifier, "ca_on_guelph_council");
    }

    #[tokio::test]
    async fn failures_do_not_affect_siblings() {
        let launcher = Arc::new(
            ScriptedLauncher::new()
                .script("a", Script::records(fixture_records(2)))
                .script(
                    "b",
                    Script::Fail {
                        exit_code: 1,
                        stderr: "boom".into(),
                    },
                )
                .script("c", Script::TimeOut)
                .script("d", Script::records(fixture_records(1))),
        );
        let descriptors = vec![
            descriptor("ja", "a"),
            descriptor("jb", "b"),
            descriptor("jc", "c"),
            descriptor("jd", "d"),
        ];
        let (runner, log, _store) = runner_with_shared(launcher);
        let s = JurisdictionScheduler::new(descriptors.clone(), Arc::new(runner), Arc::new(SystemClock));

        let report = s
            .run_batch(descriptors, &BatchOptions::builder().parallelism(4).build())
            .await;

        assert_eq!(report.attempted(), 4);
        assert_eq!(report.succeeded(), 2);
        assert_eq!(report.failed(), 2);
        assert_eq!(
            report.succeeded_jurisdictions(),
            HashSet::from(["ja", "jd"])
        );
        let rows = log.rows();
        assert_eq!(rows.len(), 4);
        assert!(rows.iter().all(|r| r.status.is_terminal()));
    }

    #[tokio::test]
    async fn parallelism_is_bounded() {
        let mut launcher = ScriptedLauncher::new();
        let mut descriptors = Vec::new();
        for i in 0..6 {
            let id = format!("s{i}");
            launcher = launcher.script(
                &id,
                Script::slow(fixture_records(1), Duration::from_millis(30)),
            );
            descriptors.push(descriptor(&format!("j{i}"), &id));
        }
        let launcher = Arc::new(launcher);
        let s = scheduler(launcher.clone(), descriptors.clone(), Arc::new(SystemClock));

        let report = s
            .run_batch(descriptors, &BatchOptions::builder().parallelism(2).build())
            .await;

        assert_eq!(report.succeeded(), 6);
        assert!(launcher.peak_concurrency() <= 2);
        assert!(launcher.peak_concurrency() >= 1);
    }

    #[tokio::test]
    async fn same_scraper_is_not_run_twice_concurrently() {
        let launcher = Arc::new(
            ScriptedLauncher::new()
                .script("a", Script::slow(fixture_records(1), Duration::from_millis(30))),
        );
        let d = descriptor("ja", "a");
        let s = scheduler(launcher.clone(), vec![d.clone()], Arc::new(SystemClock));

        let report = s
            .run_batch(vec![d.clone(), d], &BatchOptions::builder().parallelism(2).build())
            .await;

        assert_eq!(report.attempted(), 1);
        assert_eq!(report.skipped_in_flight, vec!["a".to_string()]);
        assert_eq!(launcher.launches().len(), 1);
        assert!(!s.is_in_flight("a"));
    }

    #[tokio::test]
    async fn run_forever_runs_due_scrapers_until_cancelled() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let daily = ScraperDescriptor {
            cadence: Cadence::Daily,
            ..descriptor("ca", "ca_house_of_commons")
        };
        let s = scheduler(launcher.clone(), vec![daily], Arc::new(SystemClock));
        let cancel = CancellationToken::new();
        let options = BatchOptions::builder().cancel(cancel.clone()).build();

        let stop = async {
            tokio::time::sleep(Duration::from_millis(60)).await;
            cancel.cancel();
        };
        let (total, _) = tokio::join!(s.run_forever(Duration::from_millis(10), options), stop);

        // Daily: the first tick runs it, later ticks find it not due.
        assert_eq!(total.succeeded(), 1);
        assert_eq!(launcher.launches(), vec!["ca_house_of_commons".to_string()]);
    }
}
