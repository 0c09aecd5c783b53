use std::collections::{BTreeMap, HashSet};

use tracing::warn;

use civic_common::{
    Cadence, FileConfig, Jurisdiction, JurisdictionLevel, RegistryError, ScraperDescriptor,
};

use crate::catalog;

/// How a scraper produces records once it is running in a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScraperKind {
    /// Paged representatives from a Represent API set.
    Represent { set: String },
    /// Records read from `{fixture_dir}/{identifier}.json`.
    Fixture,
}

/// One compiled scraper implementation and the jurisdictions it can serve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScraperEntry {
    pub identifier: String,
    pub level: JurisdictionLevel,
    /// Fragment of an OCD division code, e.g. `province:on` or `csd:3520005`.
    pub division_code: String,
    /// Name as the source spells it.
    pub name: String,
    pub cadence: Cadence,
    pub kind: ScraperKind,
}

impl ScraperEntry {
    fn matches(&self, jurisdiction: &Jurisdiction) -> bool {
        if self.level != jurisdiction.level {
            return false;
        }
        match self.level {
            JurisdictionLevel::Federal => true,
            JurisdictionLevel::Provincial => jurisdiction.division_code.contains(&self.division_code),
            JurisdictionLevel::Municipal => {
                if !jurisdiction.division_code.contains(&self.division_code) {
                    return false;
                }
                let ours = normalize_name(&self.name);
                let theirs = normalize_name(&jurisdiction.name);
                !ours.is_empty()
                    && !theirs.is_empty()
                    && (ours.contains(&theirs) || theirs.contains(&ours))
            }
        }
    }
}

/// Result of resolving many jurisdictions at once.
#[derive(Debug, Default)]
pub struct Resolution {
    pub descriptors: Vec<ScraperDescriptor>,
    pub unresolved: Vec<(String, RegistryError)>,
}

/// Resolves jurisdictions to compiled scrapers. Built once at startup.
#[derive(Debug, Clone)]
pub struct ScraperRegistry {
    entries: Vec<ScraperEntry>,
    cadence_overrides: BTreeMap<String, Cadence>,
}

impl ScraperRegistry {
    pub fn new(entries: Vec<ScraperEntry>) -> Result<Self, RegistryError> {
        let mut seen = HashSet::new();
        for entry in &entries {
            if entry.identifier.trim().is_empty() {
                return Err(RegistryError::InvalidScraper {
                    scraper: entry.identifier.clone(),
                    reason: "empty identifier".into(),
                });
            }
            if !seen.insert(entry.identifier.as_str()) {
                return Err(RegistryError::InvalidScraper {
                    scraper: entry.identifier.clone(),
                    reason: "duplicate identifier".into(),
                });
            }
            if entry.level != JurisdictionLevel::Federal && entry.division_code.trim().is_empty() {
                return Err(RegistryError::InvalidScraper {
                    scraper: entry.identifier.clone(),
                    reason: format!("{} scraper needs a division code", entry.level),
                });
            }
        }
        Ok(Self {
            entries,
            cadence_overrides: BTreeMap::new(),
        })
    }

    /// Registry over the compiled scraper table.
    pub fn builtin() -> Self {
        Self {
            entries: catalog::builtin_scrapers(),
            cadence_overrides: BTreeMap::new(),
        }
    }

    /// Apply the `[cadences]` table from file config.
    pub fn with_file_config(mut self, config: &FileConfig) -> Self {
        self.cadence_overrides = config.cadences.clone();
        self
    }

    pub fn entries(&self) -> &[ScraperEntry] {
        &self.entries
    }

    pub fn entry(&self, identifier: &str) -> Option<&ScraperEntry> {
        self.entries.iter().find(|e| e.identifier == identifier)
    }

    pub fn candidates(&self, jurisdiction: &Jurisdiction) -> Vec<&ScraperEntry> {
        self.entries
            .iter()
            .filter(|e| e.matches(jurisdiction))
            .collect()
    }

    /// Resolve a jurisdiction to exactly one scraper.
    ///
    /// More than one candidate is an error, never "first match".
    pub fn resolve(&self, jurisdiction: &Jurisdiction) -> Result<ScraperDescriptor, RegistryError> {
        let candidates = self.candidates(jurisdiction);
        match candidates.as_slice() {
            [] => Err(RegistryError::ScraperNotFound {
                jurisdiction: jurisdiction.id.clone(),
            }),
            [entry] => Ok(ScraperDescriptor {
                jurisdiction_id: jurisdiction.id.clone(),
                scraper_identifier: entry.identifier.clone(),
                tier: jurisdiction.level,
                cadence: self
                    .cadence_overrides
                    .get(&jurisdiction.id)
                    .copied()
                    .unwrap_or(entry.cadence),
            }),
            many => {
                let candidates: Vec<String> =
                    many.iter().map(|e| e.identifier.clone()).collect();
                warn!(
                    jurisdiction = %jurisdiction.id,
                    candidates = ?candidates,
                    "Ambiguous scraper match, skipping jurisdiction"
                );
                Err(RegistryError::AmbiguousScraper {
                    jurisdiction: jurisdiction.id.clone(),
                    candidates,
                })
            }
        }
    }

    /// Resolve a batch, separating failures from descriptors.
    pub fn resolve_all<'a>(
        &self,
        jurisdictions: impl IntoIterator<Item = &'a Jurisdiction>,
    ) -> Resolution {
        let mut resolution = Resolution::default();
        for jurisdiction in jurisdictions {
            match self.resolve(jurisdiction) {
                Ok(d) => resolution.descriptors.push(d),
                Err(e) => {
                    warn!(jurisdiction = %jurisdiction.id, error = %e, "Jurisdiction unresolved");
                    resolution.unresolved.push((jurisdiction.id.clone(), e));
                }
            }
        }
        resolution
    }
}

/// Lowercase, strip accents, and collapse punctuation to single spaces.
pub fn normalize_name(name: &str) -> String {
    let folded: String = name
        .chars()
        .flat_map(char::to_lowercase)
        .map(fold_accent)
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn fold_accent(c: char) -> char {
    match c {
        'à' | 'á' | 'â' | 'ä' | 'ã' => 'a',
        'ç' => 'c',
        'è' | 'é' | 'ê' | 'ë' => 'e',
        'ì' | 'í' | 'î' | 'ï' => 'i',
        'ñ' => 'n',
        'ò' | 'ó' | 'ô' | 'ö' => 'o',
        'ù' | 'ú' | 'û' | 'ü' => 'u',
        'ÿ' => 'y',
        other => other,
    }
}
