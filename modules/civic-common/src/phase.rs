use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// An ordered stage of the loading workflow covering a fixed jurisdiction set.
/// Static configuration, read-only at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct LoadingPhase {
    pub key: String,
    pub name: String,
    pub ordinal: u32,
    #[serde(default)]
    pub jurisdictions: Vec<String>,
    /// Base estimate before strategy scaling. Also the phase's progress weight.
    pub estimated_minutes: u32,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    NotStarted,
    Running,
    Completed,
    Skipped,
    Failed,
}

impl PhaseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped | Self::Failed)
    }

    /// Completed or Skipped phases unblock their dependents. Failed ones do not.
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

impl fmt::Display for PhaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
