//! The static phase plan: ordered stages, their jurisdictions and dependencies.

use std::collections::HashSet;

use schemars::JsonSchema;
use serde::Serialize;

use civic_common::{ConfigError, ControlError, LoadingPhase, PhaseState, Strategy};

/// (key, name, base minutes, jurisdictions)
const DEFAULT_PHASES: &[(&str, &str, u32, &[&str])] = &[
    ("preparation", "Preparation", 5, &[]),
    ("federal_core", "Federal Core", 30, &["ca"]),
    (
        "provincial_tier1",
        "Provincial Tier 1",
        60,
        &["ca_on", "ca_qc", "ca_bc", "ca_ab"],
    ),
    (
        "provincial_tier2",
        "Provincial Tier 2",
        45,
        &["ca_mb", "ca_sk", "ca_ns", "ca_nb"],
    ),
    (
        "municipal_major",
        "Municipal Major",
        90,
        &[
            "ca_on_toronto",
            "ca_qc_montreal",
            "ca_bc_vancouver",
            "ca_ab_calgary",
            "ca_on_ottawa",
        ],
    ),
    (
        "municipal_minor",
        "Municipal Minor",
        240,
        &[
            "ca_on_guelph",
            "ca_on_kingston",
            "ca_ns_halifax",
            "ca_ab_lethbridge",
            "ca_on_greater_sudbury",
            "ca_sk_saskatoon",
        ],
    ),
    ("finalization", "Finalization", 10, &[]),
];

/// Static metadata for one phase, scaled for a strategy.
#[derive(Debug, Clone, PartialEq, Serialize, JsonSchema)]
pub struct PhasePreview {
    pub key: String,
    pub name: String,
    pub ordinal: u32,
    pub jurisdictions: Vec<String>,
    pub dependencies: Vec<String>,
    pub base_minutes: u32,
    pub estimated_minutes: f64,
    pub strategy: Strategy,
}

/// Validated, ordinal-sorted phases.
#[derive(Debug, Clone)]
pub struct PhasePlan {
    phases: Vec<LoadingPhase>,
}

impl Default for PhasePlan {
    fn default() -> Self {
        let phases = DEFAULT_PHASES
            .iter()
            .enumerate()
            .map(|(i, (key, name, minutes, jurisdictions))| LoadingPhase {
                key: key.to_string(),
                name: name.to_string(),
                ordinal: i as u32,
                jurisdictions: jurisdictions.iter().map(|j| j.to_string()).collect(),
                estimated_minutes: *minutes,
                dependencies: match i {
                    0 => vec![],
                    _ => vec![DEFAULT_PHASES[i - 1].0.to_string()],
                },
            })
            .collect();
        Self { phases }
    }
}

impl PhasePlan {
    /// Validate a configured plan.
    ///
    /// Keys and ordinals must be unique, and every dependency must name a phase
    /// with a lower ordinal.
    pub fn new(mut phases: Vec<LoadingPhase>) -> Result<Self, ConfigError> {
        if phases.is_empty() {
            return Err(ConfigError::PhasePlan("no phases defined".into()));
        }
        phases.sort_by_key(|p| p.ordinal);

        let mut ordinals = HashSet::new();
        let mut seen: HashSet<&str> = HashSet::new();
        for phase in &phases {
            if phase.key.trim().is_empty() {
                return Err(ConfigError::PhasePlan("phase with empty key".into()));
            }
            if !ordinals.insert(phase.ordinal) {
                return Err(ConfigError::PhasePlan(format!(
                    "duplicate ordinal {}",
                    phase.ordinal
                )));
            }
            if seen.contains(phase.key.as_str()) {
                return Err(ConfigError::PhasePlan(format!(
                    "duplicate phase key {}",
                    phase.key
                )));
            }
            if let Some(dep) = phase
                .dependencies
                .iter()
                .find(|dep| !seen.contains(dep.as_str()))
            {
                return Err(ConfigError::PhasePlan(format!(
                    "phase {} depends on {dep}, which is not an earlier phase",
                    phase.key
                )));
            }
            seen.insert(phase.key.as_str());
        }

        Ok(Self { phases })
    }

    pub fn phases(&self) -> &[LoadingPhase] {
        &self.phases
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&LoadingPhase> {
        self.phases.get(index)
    }

    pub fn index_of(&self, key: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.key == key)
    }

    /// Sum of base estimates. Used as the progress denominator.
    pub fn total_weight(&self) -> u32 {
        self.phases.iter().map(|p| p.estimated_minutes).sum()
    }

    /// Every jurisdiction id named by any phase, in plan order.
    pub fn jurisdiction_ids(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.phases
            .iter()
            .flat_map(|p| p.jurisdictions.iter())
            .map(String::as_str)
            .filter(|id| seen.insert(*id))
            .collect()
    }

    /// Pure read; no session required.
    pub fn preview(&self, key: &str, strategy: Strategy) -> Result<PhasePreview, ControlError> {
        let phase = self
            .phases
            .iter()
            .find(|p| p.key == key)
            .ok_or_else(|| ControlError::UnknownPhase(key.to_string()))?;
        Ok(preview(phase, strategy))
    }

    pub fn preview_all(&self, strategy: Strategy) -> Vec<PhasePreview> {
        self.phases.iter().map(|p| preview(p, strategy)).collect()
    }

    /// Dependencies of the phase at `index` not yet Completed or Skipped.
    pub fn unmet_dependencies(&self, index: usize, states: &[PhaseState]) -> Vec<String> {
        let Some(phase) = self.phases.get(index) else {
            return vec![];
        };
        phase
            .dependencies
            .iter()
            .filter(|dep| {
                let satisfied = self
                    .index_of(dep)
                    .and_then(|i| states.get(i))
                    .is_some_and(|s| s.satisfies_dependency());
                !satisfied
            })
            .cloned()
            .collect()
    }
}

fn preview(phase: &LoadingPhase, strategy: Strategy) -> PhasePreview {
    PhasePreview {
        key: phase.key.clone(),
        name: phase.name.clone(),
        ordinal: phase.ordinal,
        jurisdictions: phase.jurisdictions.clone(),
        dependencies: phase.dependencies.clone(),
        base_minutes: phase.estimated_minutes,
        estimated_minutes: strategy.scale_minutes(phase.estimated_minutes),
        strategy,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phase(key: &str, ordinal: u32, deps: &[&str]) -> LoadingPhase {
        LoadingPhase {
            key: key.into(),
            name: key.into(),
            ordinal,
            jurisdictions: vec![],
            estimated_minutes: 10,
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    #[test]
    fn default_plan_is_a_chain() {
        let plan = PhasePlan::default();
        let keys: Vec<_> = plan.phases().iter().map(|p| p.key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "preparation",
                "federal_core",
                "provincial_tier1",
                "provincial_tier2",
                "municipal_major",
                "municipal_minor",
                "finalization"
            ]
        );
        assert_eq!(plan.phases()[3].dependencies, vec!["provincial_tier1"]);
        assert!(PhasePlan::new(plan.phases().to_vec()).is_ok());
    }

    #[test]
    fn preview_scales_by_strategy() {
        let plan = PhasePlan::default();
        let conservative = plan.preview("municipal_minor", Strategy::Conservative).unwrap();
        assert_eq!(conservative.base_minutes, 240);
        assert_eq!(conservative.estimated_minutes, 360.0);
        assert_eq!(conservative.jurisdictions.len(), 6);

        let aggressive = plan.preview("federal_core", Strategy::Aggressive).unwrap();
        assert!((aggressive.estimated_minutes - 21.0).abs() < 1e-9);
        assert_eq!(aggressive.jurisdictions, vec!["ca"]);

        assert!(matches!(
            plan.preview("nope", Strategy::Balanced),
            Err(ControlError::UnknownPhase(_))
        ));
    }

    #[test]
    fn rejects_forward_and_unknown_dependencies() {
        let err = PhasePlan::new(vec![phase("a", 0, &["b"]), phase("b", 1, &[])]).unwrap_err();
        assert!(err.to_string().contains("depends on b"));
        assert!(PhasePlan::new(vec![phase("a", 0, &["zzz"])]).is_err());
    }

    #[test]
    fn rejects_duplicates() {
        assert!(PhasePlan::new(vec![phase("a", 0, &[]), phase("b", 0, &[])]).is_err());
        assert!(PhasePlan::new(vec![phase("a", 0, &[]), phase("a", 1, &[])]).is_err());
        assert!(PhasePlan::new(vec![]).is_err());
    }

    #[test]
    fn sorts_by_ordinal() {
        let plan = PhasePlan::new(vec![phase("b", 5, &["a"]), phase("a", 1, &[])]).unwrap();
        assert_eq!(plan.get(0).unwrap().key, "a");
        assert_eq!(plan.index_of("b"), Some(1));
    }

    #[test]
    fn unmet_dependencies_accepts_completed_or_skipped() {
        let plan = PhasePlan::new(vec![
            phase("a", 0, &[]),
            phase("b", 1, &[]),
            phase("c", 2, &["a", "b"]),
        ])
        .unwrap();
        use PhaseState::*;
        assert!(plan.unmet_dependencies(2, &[Completed, Skipped, NotStarted]).is_empty());
        assert_eq!(
            plan.unmet_dependencies(2, &[Completed, Failed, NotStarted]),
            vec!["b".to_string()]
        );
    }

    #[test]
    fn jurisdiction_ids_cover_the_catalog() {
        let plan = PhasePlan::default();
        let catalog = civic_scout::Catalog::builtin();
        for id in plan.jurisdiction_ids() {
            assert!(catalog.get(id).is_some(), "{id} missing from catalog");
        }
        assert_eq!(plan.total_weight(), 480);
    }
}
