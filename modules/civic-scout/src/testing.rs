//! Test doubles for scraper runs: a scripted launcher that speaks the worker
//! line protocol without spawning processes, plus fixture builders.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use civic_common::{
    Cadence, EntityType, JurisdictionLevel, RawRecord, ScraperDescriptor, SystemClock,
};
use civic_store::{MemoryExecutionLog, MemoryRecordStore};

use crate::runner::{Launch, LaunchOutcome, LaunchRequest, Launcher, ScraperRunner};

/// What a scripted worker does when launched.
#[derive(Debug, Clone)]
pub enum Script {
    Records {
        records: Vec<RawRecord>,
        delay: Duration,
    },
    Fail {
        exit_code: i32,
        stderr: String,
    },
    /// Report a deadline expiry immediately.
    TimeOut,
    /// Block until cancelled or the request's timeout passes.
    Hang,
}

impl Script {
    pub fn records(records: Vec<RawRecord>) -> Self {
        Self::Records {
            records,
            delay: Duration::ZERO,
        }
    }

    pub fn slow(records: Vec<RawRecord>, delay: Duration) -> Self {
        Self::Records { records, delay }
    }
}

/// Launcher returning canned outcomes keyed by scraper id.
///
/// Unscripted scrapers emit one record. Tracks launches and peak concurrency.
#[derive(Default)]
pub struct ScriptedLauncher {
    scripts: Mutex<HashMap<String, Script>>,
    launches: Mutex<Vec<String>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, scraper_id: &str, script: Script) -> Self {
        self.set(scraper_id, script);
        self
    }

    /// Replace a script after construction, e.g. to let a retried scraper pass.
    pub fn set(&self, scraper_id: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .insert(scraper_id.to_string(), script);
    }

    pub fn launches(&self) -> Vec<String> {
        self.launches.lock().unwrap().clone()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Launcher for ScriptedLauncher {
    async fn launch(&self, request: &LaunchRequest, cancel: &CancellationToken) -> Launch {
        let scraper_id = request.worker.scraper_id.clone();
        self.launches.lock().unwrap().push(scraper_id.clone());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&scraper_id)
            .cloned()
            .unwrap_or_else(|| Script::records(fixture_records(1)));

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let outcome = match script {
            Script::Records { records, delay } => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => LaunchOutcome::Exited {
                        success: true,
                        exit_code: Some(0),
                        stdout: to_lines(&records),
                        stderr: String::new(),
                    },
                    _ = cancel.cancelled() => LaunchOutcome::Cancelled,
                }
            }
            Script::Fail { exit_code, stderr } => LaunchOutcome::Exited {
                success: false,
                exit_code: Some(exit_code),
                stdout: String::new(),
                stderr,
            },
            Script::TimeOut => LaunchOutcome::TimedOut {
                stderr: String::new(),
            },
            Script::Hang => {
                tokio::select! {
                    _ = tokio::time::sleep(request.timeout) => LaunchOutcome::TimedOut { stderr: String::new() },
                    _ = cancel.cancelled() => LaunchOutcome::Cancelled,
                }
            }
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        Launch {
            pid: None,
            outcome,
        }
    }
}

fn to_lines(records: &[RawRecord]) -> String {
    records
        .iter()
        .filter_map(|r| serde_json::to_string(r).ok())
        .map(|line| line + "\n")
        .collect()
}

/// `n` distinct representative records.
pub fn fixture_records(n: usize) -> Vec<RawRecord> {
    (0..n)
        .map(|i| RawRecord {
            entity_type: EntityType::Representative,
            natural_key: format!("ward-{i}-member"),
            fields: json!({ "name": format!("Member {i}"), "district_name": format!("Ward {i}") })
                .as_object()
                .cloned()
                .unwrap_or_default(),
        })
        .collect()
}

/// Write `{dir}/{scraper_id}.json` in the fixture scraper's format.
pub fn write_fixture(dir: &Path, scraper_id: &str, records: &[RawRecord]) {
    let body = serde_json::to_string_pretty(records).unwrap();
    std::fs::write(dir.join(format!("{scraper_id}.json")), body).unwrap();
}

pub fn descriptor(jurisdiction_id: &str, scraper_id: &str) -> ScraperDescriptor {
    ScraperDescriptor {
        jurisdiction_id: jurisdiction_id.to_string(),
        scraper_identifier: scraper_id.to_string(),
        tier: JurisdictionLevel::Municipal,
        cadence: Cadence::Weekly,
    }
}

/// A runner over in-memory stores and the given launcher.
pub fn runner_with(
    launcher: ScriptedLauncher,
) -> (ScraperRunner, Arc<MemoryExecutionLog>, Arc<MemoryRecordStore>) {
    runner_with_shared(Arc::new(launcher))
}

pub fn runner_with_shared(
    launcher: Arc<ScriptedLauncher>,
) -> (ScraperRunner, Arc<MemoryExecutionLog>, Arc<MemoryRecordStore>) {
    let log = Arc::new(MemoryExecutionLog::new());
    let store = Arc::new(MemoryRecordStore::new());
    let runner = ScraperRunner::new(launcher, log.clone(), store.clone(), Arc::new(SystemClock));
    (runner, log, store)
}
