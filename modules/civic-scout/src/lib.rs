//! Scraper orchestration: resolving jurisdictions to compiled scrapers,
//! running each scraper in its own process under a deadline, and deciding
//! which scrapers are due.

pub mod catalog;
pub mod registry;
pub mod runner;
pub mod scheduling;
pub mod scrapers;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
pub mod worker;

pub use catalog::Catalog;
pub use registry::{Resolution, ScraperEntry, ScraperKind, ScraperRegistry};
pub use runner::{
    Launcher, ProcessLauncher, RunOptions, RunResult, ScraperRunner, WorkerCommand,
};
pub use scheduling::{is_due, BatchOptions, BatchReport, JurisdictionScheduler};
pub use worker::{run_worker, WorkerRequest};
