use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::phase::LoadingPhase;
use crate::types::{Cadence, Strategy};

/// TOML-backed configuration loaded from disk. Every section is optional;
/// missing sections fall back to the compiled defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    /// Replaces the built-in phase plan when present.
    #[serde(default)]
    pub phases: Option<Vec<LoadingPhase>>,
    /// Jurisdiction id -> cadence class, overriding the registry default.
    #[serde(default)]
    pub cadences: BTreeMap<String, Cadence>,
    /// Per-strategy overrides, keyed by strategy name.
    #[serde(default)]
    pub strategy: BTreeMap<Strategy, StrategyConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StrategyConfig {
    pub success_threshold: Option<f64>,
    pub parallelism: Option<usize>,
}

impl FileConfig {
    pub fn success_threshold(&self, strategy: Strategy) -> f64 {
        self.strategy
            .get(&strategy)
            .and_then(|s| s.success_threshold)
            .map(|t| t.clamp(0.0, 1.0))
            .unwrap_or_else(|| strategy.default_success_threshold())
    }

    /// Bounded parallelism for a strategy, never above `cap`.
    pub fn parallelism(&self, strategy: Strategy, cap: usize) -> usize {
        self.strategy
            .get(&strategy)
            .and_then(|s| s.parallelism)
            .unwrap_or_else(|| strategy.default_parallelism())
            .clamp(1, cap.max(1))
    }
}

/// Load and parse a TOML config file.
pub fn load_config(path: &Path) -> Result<FileConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

pub fn parse_config(content: &str) -> Result<FileConfig> {
    Ok(toml::from_str(content)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_phases_cadences_and_strategy_overrides() {
        let config = parse_config(
            r#"
            [cadences]
            ca = "daily"
            ca_on_guelph = "monthly"

            [strategy.balanced]
            success_threshold = 0.8

            [[phases]]
            key = "preparation"
            name = "Preparation"
            ordinal = 0
            estimated_minutes = 5

            [[phases]]
            key = "federal_core"
            name = "Federal Core"
            ordinal = 1
            jurisdictions = ["ca"]
            estimated_minutes = 30
            dependencies = ["preparation"]
            "#,
        )
        .unwrap();

        assert_eq!(config.cadences["ca_on_guelph"], Cadence::Monthly);
        assert_eq!(config.success_threshold(Strategy::Balanced), 0.8);
        assert_eq!(config.success_threshold(Strategy::Aggressive), 0.5);
        let phases = config.phases.unwrap();
        assert_eq!(phases.len(), 2);
        assert_eq!(phases[1].dependencies, vec!["preparation".to_string()]);
    }

    #[test]
    fn rejects_unknown_sections() {
        assert!(parse_config("[scrapers]\nfoo = 1\n").is_err());
    }

    #[test]
    fn parallelism_is_capped() {
        let config = FileConfig::default();
        assert_eq!(config.parallelism(Strategy::Aggressive, 4), 4);
        assert_eq!(config.parallelism(Strategy::Conservative, 4), 2);
        assert_eq!(config.parallelism(Strategy::Balanced, 0), 1);
    }

    #[test]
    fn loads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("civic.toml");
        std::fs::write(&path, "[cadences]\nca = \"weekly\"\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.cadences["ca"], Cadence::Weekly);
    }
}
