use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use civic_common::{EntityType, Jurisdiction, RawRecord};

use super::{slug, Scraper};

const PAGE_SIZE: usize = 100;

/// Representatives from one Represent API set.
pub struct RepresentScraper {
    client: reqwest::Client,
    base_url: String,
    set: String,
}

#[derive(Debug, Deserialize)]
struct Page {
    objects: Vec<Map<String, Value>>,
    #[serde(default)]
    meta: PageMeta,
}

#[derive(Debug, Default, Deserialize)]
struct PageMeta {
    next: Option<String>,
}

impl RepresentScraper {
    pub fn new(base_url: String, set: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            set,
        }
    }

    async fn fetch(&self, url: &str) -> Result<Page> {
        let resp = self
            .client
            .get(url)
            .header("Accept", "application/json")
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("Represent API error (status {}): {}", status.as_u16(), body);
        }

        resp.json()
            .await
            .with_context(|| format!("Failed to parse Represent page {url}"))
    }
}

#[async_trait]
impl Scraper for RepresentScraper {
    async fn scrape(&self, jurisdiction: &Jurisdiction, limit: usize) -> Result<Vec<RawRecord>> {
        let mut url = format!(
            "{}/representatives/{}/?limit={PAGE_SIZE}",
            self.base_url, self.set
        );
        let mut records = Vec::new();

        loop {
            let page = self.fetch(&url).await?;
            debug!(
                jurisdiction = %jurisdiction.id,
                set = %self.set,
                objects = page.objects.len(),
                "Fetched Represent page"
            );
            for object in page.objects {
                if records.len() >= limit {
                    return Ok(records);
                }
                if let Some(record) = representative(object) {
                    records.push(record);
                }
            }
            match page.meta.next {
                // `next` is a path relative to the API root
                Some(next) if !next.is_empty() => url = format!("{}{}", self.base_url, next),
                _ => break,
            }
        }

        Ok(records)
    }
}

/// Map one Represent object to a record. Objects without a name are dropped.
fn representative(object: Map<String, Value>) -> Option<RawRecord> {
    let name = object.get("name")?.as_str()?.to_string();
    let district = object
        .get("district_name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let natural_key = slug(&[district.as_str(), name.as_str()]);
    if natural_key.is_empty() {
        return None;
    }
    Some(RawRecord {
        entity_type: EntityType::Representative,
        natural_key,
        fields: object,
    })
}
