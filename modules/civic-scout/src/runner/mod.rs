pub mod process;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use civic_common::{
    Clock, ExecutionOutcome, ExecutionStatus, ScraperDescriptor, ScraperError, ScraperExecution,
    UpsertOutcome,
};
use civic_store::{ExecutionLog, RecordStore, HEARTBEAT_INTERVAL};

use crate::worker::{parse_output, WorkerRequest};

pub use process::{
    Launch, LaunchOutcome, LaunchRequest, Launcher, ProcessLauncher, WorkerCommand,
};

/// Longest stderr excerpt kept in an execution's `last_error`.
const ERROR_EXCERPT_CHARS: usize = 500;

#[derive(Debug, Clone, TypedBuilder)]
pub struct RunOptions {
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

/// Outcome of one run. Failures are data here, never errors.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    /// `None` when the run was abandoned before a row was written.
    pub execution_id: Option<Uuid>,
    pub jurisdiction_id: String,
    pub scraper_id: String,
    pub status: ExecutionStatus,
    pub records_collected: u64,
    pub records_created: u64,
    pub records_updated: u64,
    pub error: Option<String>,
    pub pid: Option<u32>,
}

impl RunResult {
    fn abandoned(descriptor: &ScraperDescriptor, status: ExecutionStatus, error: String) -> Self {
        Self {
            execution_id: None,
            jurisdiction_id: descriptor.jurisdiction_id.clone(),
            scraper_id: descriptor.scraper_identifier.clone(),
            status,
            records_collected: 0,
            records_created: 0,
            records_updated: 0,
            error: Some(error),
            pid: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }
}

/// Runs one scraper in an isolated process, records its execution and upserts its records.
pub struct ScraperRunner {
    launcher: Arc<dyn Launcher>,
    log: Arc<dyn ExecutionLog>,
    records: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    heartbeat: Duration,
}

impl ScraperRunner {
    pub fn new(
        launcher: Arc<dyn Launcher>,
        log: Arc<dyn ExecutionLog>,
        records: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            launcher,
            log,
            records,
            clock,
            heartbeat: HEARTBEAT_INTERVAL,
        }
    }

    /// Override how often a Running row's heartbeat is refreshed.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat = interval.max(Duration::from_millis(1));
        self
    }

    pub fn log(&self) -> &Arc<dyn ExecutionLog> {
        &self.log
    }

    pub async fn run(&self, descriptor: &ScraperDescriptor, options: &RunOptions) -> RunResult {
        if options.cancel.is_cancelled() {
            return RunResult::abandoned(
                descriptor,
                ExecutionStatus::Stopped,
                ScraperError::Cancelled("before start".into()).to_string(),
            );
        }

        let execution = ScraperExecution::scheduled(
            descriptor,
            options.session_id,
            options.phase_key.clone(),
        );
        if let Err(e) = self.log.record_scheduled(&execution).await {
            error!(scraper = %descriptor.scraper_identifier, error = %e, "Failed to record execution");
            return RunResult::abandoned(
                descriptor,
                ExecutionStatus::Failed,
                format!("execution log unavailable: {e}"),
            );
        }
        if let Err(e) = self.log.mark_running(execution.id, self.clock.now()).await {
            error!(execution_id = %execution.id, error = %e, "Failed to mark execution running");
            return RunResult::abandoned(
                descriptor,
                ExecutionStatus::Failed,
                format!("execution log unavailable: {e}"),
            );
        }

        info!(
            scraper = %descriptor.scraper_identifier,
            jurisdiction = %descriptor.jurisdiction_id,
            execution_id = %execution.id,
            "Scraper started"
        );

        let request = LaunchRequest {
            worker: WorkerRequest {
                jurisdiction_id: descriptor.jurisdiction_id.clone(),
                scraper_id: descriptor.scraper_identifier.clone(),
                max_records: options.max_records,
            },
            timeout: options.timeout,
        };
        let launch = self
            .heartbeating(execution.id, self.launcher.launch(&request, &options.cancel))
            .await;
        let outcome = self.settle(descriptor, options, launch.outcome).await;

        let status = match self.log.finish(execution.id, &outcome).await {
            Ok(()) => outcome.status,
            Err(e) => {
                // Cancel or crash recovery already closed the row.
                let stored = self.log.get(execution.id).await.ok().flatten();
                let status = stored.map(|row| row.status).unwrap_or(ExecutionStatus::Stopped);
                debug!(execution_id = %execution.id, error = %e, %status, "Execution already closed");
                status
            }
        };

        match status {
            ExecutionStatus::Completed => info!(
                scraper = %descriptor.scraper_identifier,
                records = outcome.records_collected,
                created = outcome.records_created,
                updated = outcome.records_updated,
                "Scraper completed"
            ),
            _ => warn!(
                scraper = %descriptor.scraper_identifier,
                %status,
                error = outcome.last_error.as_deref().unwrap_or(""),
                "Scraper did not complete"
            ),
        }

        RunResult {
            execution_id: Some(execution.id),
            jurisdiction_id: descriptor.jurisdiction_id.clone(),
            scraper_id: descriptor.scraper_identifier.clone(),
            status,
            records_collected: outcome.records_collected,
            records_created: outcome.records_created,
            records_updated: outcome.records_updated,
            error: outcome.last_error,
            pid: launch.pid,
        }
    }

    /// Await a launch, refreshing the row's heartbeat so crash recovery in
    /// another orchestrator leaves it alone.
    async fn heartbeating(&self, id: Uuid, launch: impl Future<Output = Launch>) -> Launch {
        tokio::pin!(launch);
        let start = tokio::time::Instant::now() + self.heartbeat;
        let mut ticker = tokio::time::interval_at(start, self.heartbeat);
        loop {
            tokio::select! {
                done = &mut launch => return done,
                _ = ticker.tick() => {
                    if let Err(e) = self.log.heartbeat(id, self.clock.now()).await {
                        warn!(execution_id = %id, error = %e, "Failed to refresh heartbeat");
                    }
                }
            }
        }
    }

    /// Turn a process outcome into final accounting, upserting records on success.
    async fn settle(
        &self,
        descriptor: &ScraperDescriptor,
        options: &RunOptions,
        outcome: LaunchOutcome,
    ) -> ExecutionOutcome {
        let failed = |error: ScraperError| ExecutionOutcome {
            status: ExecutionStatus::Failed,
            finished_at: self.clock.now(),
            records_collected: 0,
            records_created: 0,
            records_updated: 0,
            error_count: 1,
            last_error: Some(error.to_string()),
        };

        match outcome {
            LaunchOutcome::Exited {
                success: true,
                stdout,
                stderr,
                ..
            } => {
                if !stderr.trim().is_empty() {
                    debug!(scraper = %descriptor.scraper_identifier, stderr = %excerpt(&stderr), "Worker stderr");
                }
                self.store(descriptor, &stdout, options.max_records).await
            }
            LaunchOutcome::Exited {
                success: false,
                exit_code,
                stderr,
                ..
            } => {
                let code = exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string());
                failed(ScraperError::Runtime(format!(
                    "exit {code}: {}",
                    excerpt(&stderr)
                )))
            }
            LaunchOutcome::TimedOut { .. } => failed(ScraperError::timeout(options.timeout)),
            LaunchOutcome::Cancelled => ExecutionOutcome::stopped(
                self.clock.now(),
                ScraperError::Cancelled("session cancelled".into()).to_string(),
            ),
            LaunchOutcome::Failed(reason) => failed(ScraperError::Spawn(reason)),
        }
    }

    async fn store(
        &self,
        descriptor: &ScraperDescriptor,
        stdout: &str,
        max_records: usize,
    ) -> ExecutionOutcome {
        let parsed = parse_output(stdout, max_records);
        let now = self.clock.now();
        let mut created = 0;
        let mut updated = 0;
        let mut error_count = parsed.malformed as u32;
        let mut last_error = (parsed.malformed > 0)
            .then(|| format!("{} malformed record lines", parsed.malformed));
        let mut status = ExecutionStatus::Completed;

        for record in &parsed.records {
            match self
                .records
                .upsert(&descriptor.jurisdiction_id, record, now)
                .await
            {
                Ok(UpsertOutcome::Created) => created += 1,
                Ok(UpsertOutcome::Updated) => updated += 1,
                Ok(UpsertOutcome::Unchanged) => {}
                Err(e) => {
                    error!(scraper = %descriptor.scraper_identifier, error = %e, "Upsert failed");
                    error_count += 1;
                    last_error = Some(format!("storage error: {e}"));
                    status = ExecutionStatus::Failed;
                    break;
                }
            }
        }

        ExecutionOutcome {
            status,
            finished_at: self.clock.now(),
            records_collected: parsed.records.len() as u64,
            records_created: created,
            records_updated: updated,
            error_count,
            last_error,
        }
    }
}

/// Last non-empty stderr line, bounded.
fn excerpt(stderr: &str) -> String {
    let line = stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("no diagnostics");
    line.chars().take(ERROR_EXCERPT_CHARS).collect()
}
