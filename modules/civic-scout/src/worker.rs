//! Child side of the scraper process protocol.
//!
//! The orchestrator launches `<bin> worker --jurisdiction <id> --scraper <id>
//! --max-records <n>`. The worker writes one JSON [`RawRecord`] per stdout line
//! and exits non-zero on failure. Logs go to stderr. Workers never touch storage.

use std::io::Write;

use anyhow::{anyhow, Context, Result};
use tracing::info;

use civic_common::{Config, RawRecord};

use crate::catalog::Catalog;
use crate::registry::ScraperRegistry;
use crate::scrapers;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRequest {
    pub jurisdiction_id: String,
    pub scraper_id: String,
    pub max_records: usize,
}

impl WorkerRequest {
    /// Arguments appended after the `worker` subcommand.
    pub fn to_args(&self) -> Vec<String> {
        vec![
            "--jurisdiction".into(),
            self.jurisdiction_id.clone(),
            "--scraper".into(),
            self.scraper_id.clone(),
            "--max-records".into(),
            self.max_records.to_string(),
        ]
    }
}

/// Run one scraper and stream its records to `out`. Returns the number written.
pub async fn run_worker<W: Write>(
    request: &WorkerRequest,
    catalog: &Catalog,
    registry: &ScraperRegistry,
    config: &Config,
    out: &mut W,
) -> Result<usize> {
    let jurisdiction = catalog
        .get(&request.jurisdiction_id)
        .ok_or_else(|| anyhow!("unknown jurisdiction {}", request.jurisdiction_id))?;
    let entry = registry
        .entry(&request.scraper_id)
        .ok_or_else(|| anyhow!("unknown scraper {}", request.scraper_id))?;

    let scraper = scrapers::build(entry, config)?;
    let records = scraper
        .scrape(jurisdiction, request.max_records)
        .await
        .with_context(|| format!("{} failed for {}", entry.identifier, jurisdiction.id))?;

    let mut written = 0;
    for record in records.iter().take(request.max_records) {
        serde_json::to_writer(&mut *out, record)?;
        out.write_all(b"\n")?;
        written += 1;
    }
    out.flush()?;

    info!(
        jurisdiction = %jurisdiction.id,
        scraper = %entry.identifier,
        records = written,
        "Worker finished"
    );
    Ok(written)
}

/// Records parsed from a worker's stdout.
#[derive(Debug, Default)]
pub struct ParsedOutput {
    pub records: Vec<RawRecord>,
    /// Non-empty lines that were not valid records.
    pub malformed: usize,
    /// Valid records dropped past the cap.
    pub truncated: usize,
}

/// Parse the line protocol, keeping at most `max_records`.
pub fn parse_output(stdout: &str, max_records: usize) -> ParsedOutput {
    let mut parsed = ParsedOutput::default();
    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match serde_json::from_str::<RawRecord>(line) {
            Ok(record) if parsed.records.len() < max_records => parsed.records.push(record),
            Ok(_) => parsed.truncated += 1,
            Err(_) => parsed.malformed += 1,
        }
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fixture_records, write_fixture};

    #[test]
    fn parse_output_counts_malformed_and_caps() {
        let stdout = concat!(
            r#"{"entity_type":"representative","natural_key":"a","fields":{}}"#,
            "\n",
            "not json\n",
            "\n",
            r#"{"entity_type":"bill","natural_key":"b","fields":{"title":"x"}}"#,
            "\n",
            r#"{"entity_type":"vote","natural_key":"c","fields":{}}"#,
            "\n",
        );
        let parsed = parse_output(stdout, 2);
        assert_eq!(parsed.records.len(), 2);
        assert_eq!(parsed.malformed, 1);
        assert_eq!(parsed.truncated, 1);
    }

    #[test]
    fn request_args_round_trip_through_cli_shape() {
        let request = WorkerRequest {
            jurisdiction_id: "ca_on".into(),
            scraper_id: "ca_on_legislature".into(),
            max_records: 50,
        };
        assert_eq!(
            request.to_args(),
            vec![
                "--jurisdiction",
                "ca_on",
                "--scraper",
                "ca_on_legislature",
                "--max-records",
                "50"
            ]
        );
    }

    #[tokio::test]
    async fn worker_streams_fixture_records_as_lines() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(dir.path(), "ca_on_legislature", &fixture_records(3));
        let config = Config {
            fixture_dir: Some(dir.path().to_path_buf()),
            ..Config::default()
        };
        let request = WorkerRequest {
            jurisdiction_id: "ca_on".into(),
            scraper_id: "ca_on_legislature".into(),
            max_records: 2,
        };

        let mut out = Vec::new();
        let written = run_worker(
            &request,
            &Catalog::builtin(),
            &ScraperRegistry::builtin(),
            &config,
            &mut out,
        )
        .await
        .unwrap();

        assert_eq!(written, 2);
        let parsed = parse_output(&String::from_utf8(out).unwrap(), 10);
        assert_eq!(parsed.records.len(), 2);
        assert_eq!(parsed.malformed, 0);
    }

    #[tokio::test]
    async fn unknown_scraper_fails() {
        let request = WorkerRequest {
            jurisdiction_id: "ca".into(),
            scraper_id: "nope".into(),
            max_records: 1,
        };
        let mut out = Vec::new();
        let result = run_worker(
            &request,
            &Catalog::builtin(),
            &ScraperRegistry::builtin(),
            &Config::default(),
            &mut out,
        )
        .await;
        assert!(result.is_err());
        assert!(out.is_empty());
    }
}
