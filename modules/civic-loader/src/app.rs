//! Wiring: config, stores, launcher, scheduler, sequencer and session controller.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use civic_common::{load_config, Clock, Config, ConfigError, FileConfig, SystemClock};
use civic_scout::{
    BatchOptions, Catalog, JurisdictionScheduler, Launcher, ProcessLauncher, ScraperRegistry,
    ScraperRunner, WorkerCommand,
};
use civic_store::{
    ensure_schema, heartbeat_cutoff, ExecutionLog, MemoryExecutionLog, MemoryRecordStore,
    PgExecutionLog, PgRecordStore, RecordStore,
};

use crate::phases::PhasePlan;
use crate::sequencer::{PhaseSequencer, SequencerSettings};
use crate::session::SessionController;
use crate::status::StatusReporter;

pub struct App {
    pub config: Config,
    pub file_config: FileConfig,
    pub log: Arc<dyn ExecutionLog>,
    pub scheduler: Arc<JurisdictionScheduler>,
    pub controller: Arc<SessionController>,
    pub reporter: StatusReporter,
    pub clock: Arc<dyn Clock>,
}

impl App {
    /// Connect storage and build the process launcher from `config`.
    ///
    /// Postgres when `DATABASE_URL` is set, in-memory stores otherwise.
    pub async fn build(config: Config) -> Result<Self> {
        let file_config = read_file_config(&config)?;

        let (log, records): (Arc<dyn ExecutionLog>, Arc<dyn RecordStore>) =
            match &config.database_url {
                Some(url) => {
                    let pool = PgPoolOptions::new()
                        .max_connections(10)
                        .connect(url)
                        .await
                        .context("Failed to connect to Postgres")?;
                    ensure_schema(&pool).await?;
                    info!("Connected to Postgres");
                    (
                        Arc::new(PgExecutionLog::new(pool.clone())),
                        Arc::new(PgRecordStore::new(pool)),
                    )
                }
                None => {
                    warn!("DATABASE_URL not set; execution history will not survive this process");
                    (
                        Arc::new(MemoryExecutionLog::new()),
                        Arc::new(MemoryRecordStore::new()),
                    )
                }
            };

        let launcher = Arc::new(ProcessLauncher::new(WorkerCommand::from_config(&config)?));
        Self::assemble(config, file_config, log, records, launcher, Arc::new(SystemClock))
    }

    /// Build the component graph over caller-supplied collaborators.
    pub fn assemble(
        config: Config,
        file_config: FileConfig,
        log: Arc<dyn ExecutionLog>,
        records: Arc<dyn RecordStore>,
        launcher: Arc<dyn Launcher>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let catalog = Catalog::builtin();
        let plan = phase_plan(&file_config)?;
        validate_cadences(&file_config, &catalog)?;

        let registry = ScraperRegistry::builtin().with_file_config(&file_config);
        let resolution = registry.resolve_all(catalog.all());
        if !resolution.unresolved.is_empty() {
            warn!(
                unresolved = resolution.unresolved.len(),
                "Some jurisdictions have no usable scraper"
            );
        }

        let runner = Arc::new(ScraperRunner::new(
            launcher,
            log.clone(),
            records,
            clock.clone(),
        ));
        let scheduler = Arc::new(JurisdictionScheduler::new(
            resolution.descriptors,
            runner,
            clock.clone(),
        ));

        let settings = SequencerSettings {
            file_config: file_config.clone(),
            max_parallel_scrapers: config.max_parallel_scrapers,
            max_records: config.max_records,
            scraper_timeout: config.scraper_timeout,
        };
        let sequencer = Arc::new(PhaseSequencer::new(
            plan,
            catalog,
            registry,
            scheduler.clone(),
            log.clone(),
            settings,
        ));
        let controller = Arc::new(SessionController::new(
            sequencer,
            clock.clone(),
            Some(config.data_dir.clone()),
        ));
        let reporter = StatusReporter::new(controller.clone(), log.clone(), clock.clone());

        Ok(Self {
            config,
            file_config,
            log,
            scheduler,
            controller,
            reporter,
            clock,
        })
    }

    /// Close out Running rows left behind by a dead orchestrator process.
    ///
    /// Live runners refresh their rows' heartbeat, so a `load` started next to
    /// a running `schedule` daemon leaves the daemon's executions alone.
    pub async fn reconcile(&self) -> Result<u64> {
        let now = self.clock.now();
        let stopped = self
            .log
            .reconcile_orphaned("orchestrator restarted", now, heartbeat_cutoff(now))
            .await?;
        if stopped > 0 {
            warn!(stopped, "Reconciled orphaned executions");
        }
        Ok(stopped)
    }

    /// Batch options for cadence-driven runs outside any session.
    pub fn schedule_options(&self) -> BatchOptions {
        BatchOptions::builder()
            .parallelism(self.config.max_parallel_scrapers)
            .max_records(self.config.max_records)
            .timeout(self.config.scraper_timeout)
            .build()
    }
}

pub fn read_file_config(config: &Config) -> Result<FileConfig> {
    match &config.config_path {
        Some(path) => load_config(path),
        None => Ok(FileConfig::default()),
    }
}

/// The configured phase plan, or the built-in one.
pub fn phase_plan(file_config: &FileConfig) -> Result<PhasePlan, ConfigError> {
    match &file_config.phases {
        Some(phases) => PhasePlan::new(phases.clone()),
        None => Ok(PhasePlan::default()),
    }
}

fn validate_cadences(file_config: &FileConfig, catalog: &Catalog) -> Result<(), ConfigError> {
    match file_config
        .cadences
        .iter()
        .find(|(id, _)| catalog.get(id).is_none())
    {
        Some((id, cadence)) => Err(ConfigError::Cadence {
            jurisdiction: id.clone(),
            value: format!("{cadence:?} set for unknown jurisdiction"),
        }),
        None => Ok(()),
    }
}
