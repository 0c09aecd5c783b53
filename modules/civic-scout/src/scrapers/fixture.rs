use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;

use civic_common::{Jurisdiction, RawRecord};

use super::Scraper;

/// Reads a JSON array of records from disk. Used for offline runs.
pub struct FixtureScraper {
    path: PathBuf,
}

impl FixtureScraper {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl Scraper for FixtureScraper {
    async fn scrape(&self, _jurisdiction: &Jurisdiction, limit: usize) -> Result<Vec<RawRecord>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read fixture {}", self.path.display()))?;
        let mut records: Vec<RawRecord> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse fixture {}", self.path.display()))?;
        records.truncate(limit);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use civic_common::{EntityType, JurisdictionLevel};

    fn guelph() -> Jurisdiction {
        Jurisdiction {
            id: "ca_on_guelph".into(),
            name: "Guelph".into(),
            level: JurisdictionLevel::Municipal,
            division_code: "ocd-division/country:ca/csd:3523008".into(),
        }
    }

    #[tokio::test]
    async fn reads_and_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guelph.json");
        std::fs::write(
            &path,
            r#"[
                {"entity_type":"representative","natural_key":"a","fields":{}},
                {"entity_type":"representative","natural_key":"b","fields":{}},
                {"entity_type":"bill","natural_key":"c","fields":{"title":"By-law"}}
            ]"#,
        )
        .unwrap();

        let records = FixtureScraper::new(path).scrape(&guelph(), 2).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].entity_type, EntityType::Representative);
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let scraper = FixtureScraper::new(PathBuf::from("/nonexistent/civic.json"));
        assert!(scraper.scrape(&guelph(), 10).await.is_err());
    }
}
