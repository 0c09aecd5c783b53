//! Compiled scraper implementations.
//!
//! A scraper is an opaque producer of records for one jurisdiction. Scrapers run
//! inside the worker process; the orchestrator never calls them directly.

pub mod fixture;
pub mod represent;

use std::path::PathBuf;

use anyhow::{bail, Result};
use async_trait::async_trait;

use civic_common::{Config, Jurisdiction, RawRecord};

use crate::registry::{ScraperEntry, ScraperKind};

pub use fixture::FixtureScraper;
pub use represent::RepresentScraper;

#[async_trait]
pub trait Scraper: Send + Sync {
    /// Produce at most `limit` records for the jurisdiction.
    async fn scrape(&self, jurisdiction: &Jurisdiction, limit: usize) -> Result<Vec<RawRecord>>;
}

/// Build the scraper behind a registry entry.
///
/// A configured fixture directory takes precedence over live sources.
pub fn build(entry: &ScraperEntry, config: &Config) -> Result<Box<dyn Scraper>> {
    if let Some(dir) = &config.fixture_dir {
        return Ok(Box::new(FixtureScraper::new(fixture_path(dir.clone(), entry))));
    }
    match &entry.kind {
        ScraperKind::Represent { set } => Ok(Box::new(RepresentScraper::new(
            config.represent_base_url.clone(),
            set.clone(),
        ))),
        ScraperKind::Fixture => bail!(
            "scraper {} reads fixtures but SCRAPER_FIXTURE_DIR is not set",
            entry.identifier
        ),
    }
}

fn fixture_path(dir: PathBuf, entry: &ScraperEntry) -> PathBuf {
    dir.join(format!("{}.json", entry.identifier))
}

/// Lowercase ascii slug, used to build natural keys.
pub(crate) fn slug(parts: &[&str]) -> String {
    let joined = parts
        .iter()
        .map(|p| crate::registry::normalize_name(p))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    joined.replace(' ', "-")
}
