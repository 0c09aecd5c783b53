//! Compiled tables of jurisdictions and the scrapers that cover them.
//!
//! Built once at startup. There is no runtime code loading: every scraper the
//! orchestrator can run is listed here.

use civic_common::{Cadence, Jurisdiction, JurisdictionLevel};

use crate::registry::{ScraperEntry, ScraperKind};

const DIVISION_PREFIX: &str = "ocd-division/country:ca";

/// (id, name, level, division suffix)
const JURISDICTIONS: &[(&str, &str, JurisdictionLevel, &str)] = &[
    ("ca", "Parliament of Canada", JurisdictionLevel::Federal, ""),
    // Provinces
    ("ca_on", "Ontario", JurisdictionLevel::Provincial, "/province:on"),
    ("ca_qc", "Québec", JurisdictionLevel::Provincial, "/province:qc"),
    ("ca_bc", "British Columbia", JurisdictionLevel::Provincial, "/province:bc"),
    ("ca_ab", "Alberta", JurisdictionLevel::Provincial, "/province:ab"),
    ("ca_mb", "Manitoba", JurisdictionLevel::Provincial, "/province:mb"),
    ("ca_sk", "Saskatchewan", JurisdictionLevel::Provincial, "/province:sk"),
    ("ca_ns", "Nova Scotia", JurisdictionLevel::Provincial, "/province:ns"),
    ("ca_nb", "New Brunswick", JurisdictionLevel::Provincial, "/province:nb"),
    // Major municipalities
    ("ca_on_toronto", "Toronto", JurisdictionLevel::Municipal, "/csd:3520005"),
    ("ca_qc_montreal", "Montréal", JurisdictionLevel::Municipal, "/csd:2466023"),
    ("ca_bc_vancouver", "Vancouver", JurisdictionLevel::Municipal, "/csd:5915022"),
    ("ca_ab_calgary", "Calgary", JurisdictionLevel::Municipal, "/csd:4806016"),
    ("ca_on_ottawa", "Ottawa", JurisdictionLevel::Municipal, "/csd:3506008"),
    // Minor municipalities
    ("ca_on_guelph", "Guelph", JurisdictionLevel::Municipal, "/csd:3523008"),
    ("ca_on_kingston", "Kingston", JurisdictionLevel::Municipal, "/csd:3510010"),
    ("ca_ns_halifax", "Halifax", JurisdictionLevel::Municipal, "/csd:1209034"),
    ("ca_ab_lethbridge", "Lethbridge", JurisdictionLevel::Municipal, "/csd:4802012"),
    ("ca_on_greater_sudbury", "Greater Sudbury", JurisdictionLevel::Municipal, "/csd:3553005"),
    ("ca_sk_saskatoon", "Saskatoon", JurisdictionLevel::Municipal, "/csd:4711066"),
];

/// (identifier, level, division code fragment, source name, default cadence, Represent set)
const SCRAPERS: &[(&str, JurisdictionLevel, &str, &str, Cadence, &str)] = &[
    ("ca_house_of_commons", JurisdictionLevel::Federal, "country:ca", "House of Commons", Cadence::Daily, "house-of-commons"),
    // Legislatures
    ("ca_on_legislature", JurisdictionLevel::Provincial, "province:on", "Legislative Assembly of Ontario", Cadence::Daily, "ontario-legislature"),
    ("ca_qc_assemblee_nationale", JurisdictionLevel::Provincial, "province:qc", "Assemblée nationale", Cadence::Daily, "quebec-assemblee-nationale"),
    ("ca_bc_legislature", JurisdictionLevel::Provincial, "province:bc", "Legislative Assembly of British Columbia", Cadence::Weekly, "bc-legislature"),
    ("ca_ab_legislature", JurisdictionLevel::Provincial, "province:ab", "Legislative Assembly of Alberta", Cadence::Weekly, "alberta-legislature"),
    ("ca_mb_legislature", JurisdictionLevel::Provincial, "province:mb", "Legislative Assembly of Manitoba", Cadence::Weekly, "manitoba-legislature"),
    ("ca_sk_legislature", JurisdictionLevel::Provincial, "province:sk", "Legislative Assembly of Saskatchewan", Cadence::Weekly, "saskatchewan-legislature"),
    ("ca_ns_legislature", JurisdictionLevel::Provincial, "province:ns", "Nova Scotia House of Assembly", Cadence::Weekly, "nova-scotia-legislature"),
    ("ca_nb_legislature", JurisdictionLevel::Provincial, "province:nb", "Legislative Assembly of New Brunswick", Cadence::Weekly, "new-brunswick-legislature"),
    // Councils
    ("ca_on_toronto_council", JurisdictionLevel::Municipal, "csd:3520005", "City of Toronto", Cadence::Weekly, "toronto-city-council"),
    ("ca_qc_montreal_council", JurisdictionLevel::Municipal, "csd:2466023", "Montreal", Cadence::Weekly, "montreal-city-council"),
    ("ca_bc_vancouver_council", JurisdictionLevel::Municipal, "csd:5915022", "City of Vancouver", Cadence::Weekly, "vancouver-city-council"),
    ("ca_ab_calgary_council", JurisdictionLevel::Municipal, "csd:4806016", "Calgary", Cadence::Weekly, "calgary-city-council"),
    ("ca_on_ottawa_council", JurisdictionLevel::Municipal, "csd:3506008", "Ottawa", Cadence::Weekly, "ottawa-city-council"),
    ("ca_on_guelph_council", JurisdictionLevel::Municipal, "csd:3523008", "Guelph", Cadence::Monthly, "guelph-city-council"),
    ("ca_on_kingston_council", JurisdictionLevel::Municipal, "csd:3510010", "Kingston", Cadence::Monthly, "kingston-city-council"),
    ("ca_ns_halifax_council", JurisdictionLevel::Municipal, "csd:1209034", "Halifax Regional Municipality", Cadence::Monthly, "halifax-regional-council"),
    ("ca_ab_lethbridge_council", JurisdictionLevel::Municipal, "csd:4802012", "Lethbridge", Cadence::Monthly, "lethbridge-city-council"),
    ("ca_on_greater_sudbury_council", JurisdictionLevel::Municipal, "csd:3553005", "Greater Sudbury", Cadence::Monthly, "greater-sudbury-city-council"),
    ("ca_sk_saskatoon_council", JurisdictionLevel::Municipal, "csd:4711066", "Saskatoon", Cadence::Monthly, "saskatoon-city-council"),
];

/// Known jurisdictions, looked up by id.
#[derive(Debug, Clone)]
pub struct Catalog {
    jurisdictions: Vec<Jurisdiction>,
}

impl Catalog {
    pub fn new(jurisdictions: Vec<Jurisdiction>) -> Self {
        Self { jurisdictions }
    }

    pub fn builtin() -> Self {
        Self::new(
            JURISDICTIONS
                .iter()
                .map(|(id, name, level, suffix)| Jurisdiction {
                    id: id.to_string(),
                    name: name.to_string(),
                    level: *level,
                    division_code: format!("{DIVISION_PREFIX}{suffix}"),
                })
                .collect(),
        )
    }

    pub fn get(&self, id: &str) -> Option<&Jurisdiction> {
        self.jurisdictions.iter().find(|j| j.id == id)
    }

    pub fn all(&self) -> &[Jurisdiction] {
        &self.jurisdictions
    }

    pub fn by_level(&self, level: JurisdictionLevel) -> impl Iterator<Item = &Jurisdiction> {
        self.jurisdictions.iter().filter(move |j| j.level == level)
    }
}

/// The compiled scraper table.
pub fn builtin_scrapers() -> Vec<ScraperEntry> {
    SCRAPERS
        .iter()
        .map(|(identifier, level, division, name, cadence, set)| ScraperEntry {
            identifier: identifier.to_string(),
            level: *level,
            division_code: division.to_string(),
            name: name.to_string(),
            cadence: *cadence,
            kind: ScraperKind::Represent {
                set: set.to_string(),
            },
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ScraperRegistry;

    #[test]
    fn every_builtin_jurisdiction_resolves_to_exactly_one_scraper() {
        let catalog = Catalog::builtin();
        let registry = ScraperRegistry::builtin();
        for jurisdiction in catalog.all() {
            let descriptor = registry
                .resolve(jurisdiction)
                .unwrap_or_else(|e| panic!("{}: {e}", jurisdiction.id));
            assert_eq!(descriptor.jurisdiction_id, jurisdiction.id);
            assert_eq!(descriptor.tier, jurisdiction.level);
        }
    }

    #[test]
    fn ids_are_unique() {
        let catalog = Catalog::builtin();
        let mut ids: Vec<_> = catalog.all().iter().map(|j| j.id.as_str()).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), catalog.all().len());
    }
}
