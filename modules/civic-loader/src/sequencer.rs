//! Executes one phase: resolves its jurisdictions, runs their scrapers, and
//! decides pass or fail against the strategy's success threshold.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use civic_common::{
    ExecutionStatus, FileConfig, LoadingPhase, ScraperDescriptor, ScraperExecution, Strategy,
    ValidationLevel,
};
use civic_scout::{BatchOptions, BatchReport, Catalog, JurisdictionScheduler, ScraperRegistry};
use civic_store::ExecutionLog;

use crate::phases::PhasePlan;

/// Execution limits shared by every phase.
#[derive(Debug, Clone)]
pub struct SequencerSettings {
    pub file_config: FileConfig,
    pub max_parallel_scrapers: usize,
    pub max_records: usize,
    pub scraper_timeout: Duration,
}

impl Default for SequencerSettings {
    fn default() -> Self {
        Self {
            file_config: FileConfig::default(),
            max_parallel_scrapers: 4,
            max_records: 5_000,
            scraper_timeout: Duration::from_secs(300),
        }
    }
}

/// Result of one phase execution.
#[derive(Debug, Clone)]
pub struct PhaseOutcome {
    pub phase_key: String,
    /// Jurisdictions in the phase, resolved or not.
    pub total: usize,
    pub succeeded: usize,
    pub unresolved: Vec<String>,
    pub threshold: f64,
    pub validation: ValidationLevel,
    pub passed: bool,
    pub cancelled: bool,
    pub report: BatchReport,
}

impl PhaseOutcome {
    pub fn success_ratio(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.succeeded as f64 / self.total as f64
        }
    }
}

pub struct PhaseSequencer {
    plan: PhasePlan,
    catalog: Catalog,
    registry: ScraperRegistry,
    scheduler: Arc<JurisdictionScheduler>,
    log: Arc<dyn ExecutionLog>,
    settings: SequencerSettings,
}

impl PhaseSequencer {
    pub fn new(
        plan: PhasePlan,
        catalog: Catalog,
        registry: ScraperRegistry,
        scheduler: Arc<JurisdictionScheduler>,
        log: Arc<dyn ExecutionLog>,
        settings: SequencerSettings,
    ) -> Self {
        Self {
            plan,
            catalog,
            registry,
            scheduler,
            log,
            settings,
        }
    }

    pub fn plan(&self) -> &PhasePlan {
        &self.plan
    }

    pub fn log(&self) -> &Arc<dyn ExecutionLog> {
        &self.log
    }

    pub fn threshold(&self, strategy: Strategy) -> f64 {
        self.settings.file_config.success_threshold(strategy)
    }

    /// Resolve a phase's jurisdictions. Unknown or unresolvable ones are returned separately.
    pub fn resolve(&self, phase: &LoadingPhase) -> (Vec<ScraperDescriptor>, Vec<String>) {
        let mut descriptors = Vec::new();
        let mut unresolved = Vec::new();
        for id in &phase.jurisdictions {
            let Some(jurisdiction) = self.catalog.get(id) else {
                warn!(phase = %phase.key, jurisdiction = %id, "Unknown jurisdiction in phase");
                unresolved.push(id.clone());
                continue;
            };
            match self.registry.resolve(jurisdiction) {
                Ok(d) => descriptors.push(d),
                Err(e) => {
                    warn!(phase = %phase.key, jurisdiction = %id, error = %e, "Jurisdiction skipped");
                    unresolved.push(id.clone());
                }
            }
        }
        (descriptors, unresolved)
    }

    /// Run every jurisdiction in the phase and judge the result.
    ///
    /// Never retries. A phase with no jurisdictions passes.
    pub async fn execute(
        &self,
        phase: &LoadingPhase,
        strategy: Strategy,
        session_id: Uuid,
        cancel: CancellationToken,
    ) -> PhaseOutcome {
        let threshold = self.threshold(strategy);
        let validation = strategy.validation_level();
        let (descriptors, unresolved) = self.resolve(phase);
        let total = phase.jurisdictions.len();

        info!(
            phase = %phase.key,
            jurisdictions = total,
            resolved = descriptors.len(),
            %strategy,
            estimated_minutes = strategy.scale_minutes(phase.estimated_minutes),
            "Phase starting"
        );

        let options = BatchOptions::builder()
            .parallelism(
                self.settings
                    .file_config
                    .parallelism(strategy, self.settings.max_parallel_scrapers),
            )
            .max_records(self.settings.max_records)
            .timeout(self.settings.scraper_timeout)
            .session_id(session_id)
            .phase_key(phase.key.clone())
            .cancel(cancel.clone())
            .build();
        let report = self.scheduler.run_batch(descriptors, &options).await;

        let succeeded = match validation {
            ValidationLevel::None => report.succeeded_jurisdictions().len(),
            ValidationLevel::Standard | ValidationLevel::Extended => {
                match self.log.for_session(session_id).await {
                    Ok(rows) => validated_successes(&rows, &phase.key, validation),
                    Err(e) => {
                        error!(phase = %phase.key, error = %e, "Validation pass could not read execution log");
                        0
                    }
                }
            }
        };

        let mut outcome = PhaseOutcome {
            phase_key: phase.key.clone(),
            total,
            succeeded,
            unresolved,
            threshold,
            validation,
            passed: false,
            cancelled: cancel.is_cancelled(),
            report,
        };
        outcome.passed = !outcome.cancelled && outcome.success_ratio() >= threshold;

        if outcome.passed {
            info!(
                phase = %phase.key,
                succeeded = outcome.succeeded,
                total,
                "Phase completed"
            );
        } else if !outcome.cancelled {
            error!(
                phase = %phase.key,
                succeeded = outcome.succeeded,
                total,
                ratio = outcome.success_ratio(),
                threshold,
                "Phase failed success threshold"
            );
        }
        outcome
    }
}

/// Count jurisdictions whose latest execution in this phase succeeded, per the log.
///
/// A non-terminal latest row counts as failed. Extended also rejects empty scrapes.
fn validated_successes(rows: &[ScraperExecution], phase_key: &str, level: ValidationLevel) -> usize {
    let mut latest: HashMap<&str, &ScraperExecution> = HashMap::new();
    for row in rows.iter().filter(|r| r.phase_key.as_deref() == Some(phase_key)) {
        let newer = match latest.get(row.jurisdiction_id.as_str()) {
            Some(prev) => row.start_time >= prev.start_time,
            None => true,
        };
        if newer {
            latest.insert(row.jurisdiction_id.as_str(), row);
        }
    }

    latest
        .values()
        .filter(|row| row.status == ExecutionStatus::Completed)
        .filter(|row| level != ValidationLevel::Extended || row.records_collected > 0)
        .map(|row| row.jurisdiction_id.as_str())
        .collect::<HashSet<_>>()
        .len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};

    fn row(jurisdiction: &str, status: ExecutionStatus, records: u64, offset_secs: i64) -> ScraperExecution {
        ScraperExecution {
            id: Uuid::new_v4(),
            session_id: None,
            phase_key: Some("municipal_major".into()),
            scraper_id: format!("{jurisdiction}_council"),
            jurisdiction_id: jurisdiction.into(),
            status,
            start_time: Some(Utc::now() + ChronoDuration::seconds(offset_secs)),
            end_time: None,
            heartbeat_at: None,
            records_collected: records,
            records_created: 0,
            records_updated: 0,
            error_count: 0,
            last_error: None,
        }
    }

    #[test]
    fn standard_validation_counts_completed_rows() {
        let rows = vec![
            row("a", ExecutionStatus::Completed, 3, 0),
            row("b", ExecutionStatus::Running, 0, 0),
            row("c", ExecutionStatus::Failed, 0, 0),
            row("d", ExecutionStatus::Completed, 0, 0),
        ];
        assert_eq!(validated_successes(&rows, "municipal_major", ValidationLevel::Standard), 2);
    }

    #[test]
    fn extended_validation_rejects_empty_scrapes() {
        let rows = vec![
            row("a", ExecutionStatus::Completed, 3, 0),
            row("d", ExecutionStatus::Completed, 0, 0),
        ];
        assert_eq!(validated_successes(&rows, "municipal_major", ValidationLevel::Extended), 1);
    }

    #[test]
    fn latest_attempt_wins_and_other_phases_are_ignored() {
        let mut other = row("a", ExecutionStatus::Completed, 1, 0);
        other.phase_key = Some("federal_core".into());
        let rows = vec![
            row("a", ExecutionStatus::Completed, 3, 0),
            row("a", ExecutionStatus::Failed, 0, 10),
            other,
        ];
        assert_eq!(validated_successes(&rows, "municipal_major", ValidationLevel::Standard), 0);
    }

    #[test]
    fn empty_phase_ratio_is_one() {
        let outcome = PhaseOutcome {
            phase_key: "preparation".into(),
            total: 0,
            succeeded: 0,
            unresolved: vec![],
            threshold: 0.9,
            validation: ValidationLevel::Extended,
            passed: true,
            cancelled: false,
            report: BatchReport::default(),
        };
        assert_eq!(outcome.success_ratio(), 1.0);
    }
}
