use std::fmt;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::phase::PhaseState;
use crate::types::Strategy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    NoSession,
    Running,
    Paused,
    Cancelled,
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoSession => "no_session",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
        }
    }

    /// Running or Paused: holds the singleton slot.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One end-to-end run of the phased workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LoadingSession {
    pub session_id: Uuid,
    pub strategy: Strategy,
    pub status: SessionStatus,
    /// Index into the phase plan. Equals the phase count once every phase is done.
    pub current_phase_index: usize,
    pub manual_controls_enabled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Parallel to the phase plan.
    pub phase_states: Vec<PhaseState>,
    /// When each phase's latest attempt began. Parallel to the phase plan.
    #[serde(default)]
    pub phase_started_at: Vec<Option<DateTime<Utc>>>,
    pub cancel_reason: Option<String>,
}

impl LoadingSession {
    pub fn new(
        strategy: Strategy,
        manual_controls_enabled: bool,
        phase_count: usize,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            strategy,
            status: SessionStatus::Running,
            current_phase_index: 0,
            manual_controls_enabled,
            started_at,
            finished_at: None,
            phase_states: vec![PhaseState::NotStarted; phase_count],
            phase_started_at: vec![None; phase_count],
            cancel_reason: None,
        }
    }

    pub fn current_state(&self) -> Option<PhaseState> {
        self.phase_states.get(self.current_phase_index).copied()
    }

    pub fn mark_phase_started(&mut self, index: usize, at: DateTime<Utc>) {
        if let Some(state) = self.phase_states.get_mut(index) {
            *state = PhaseState::Running;
        }
        if let Some(started) = self.phase_started_at.get_mut(index) {
            *started = Some(at);
        }
    }

    pub fn all_phases_done(&self) -> bool {
        self.current_phase_index >= self.phase_states.len()
    }
}
