//! Read-side view of the loading session: weighted progress and a status stream.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::Stream;
use schemars::JsonSchema;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use civic_common::{
    Clock, LoadingSession, PhaseState, ScraperExecution, SessionStatus, Strategy,
};
use civic_store::ExecutionLog;

use crate::session::SessionController;

#[derive(Debug, Clone, PartialEq, Serialize, JsonSchema)]
pub struct PhaseProgress {
    pub key: String,
    pub name: String,
    pub state: PhaseState,
    pub jurisdictions_total: usize,
    pub jurisdictions_done: usize,
    /// Base minutes; the phase's share of overall progress.
    pub weight: u32,
    pub estimated_minutes: Option<f64>,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, JsonSchema)]
pub struct ProgressSnapshot {
    pub session_id: Option<Uuid>,
    pub status: SessionStatus,
    pub strategy: Option<Strategy>,
    pub overall_percentage: f64,
    pub current_phase: Option<String>,
    pub current_operation: String,
    pub phases: Vec<PhaseProgress>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressSnapshot {
    /// Nothing further will change for this snapshot's session.
    pub fn is_final(&self) -> bool {
        self.status == SessionStatus::NoSession
            || self.status.is_terminal()
            || self.overall_percentage >= 100.0
    }
}

#[derive(Clone)]
pub struct StatusReporter {
    controller: Arc<SessionController>,
    log: Arc<dyn ExecutionLog>,
    clock: Arc<dyn Clock>,
}

impl StatusReporter {
    pub fn new(
        controller: Arc<SessionController>,
        log: Arc<dyn ExecutionLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            controller,
            log,
            clock,
        }
    }

    pub async fn status(&self) -> ProgressSnapshot {
        let session = self.controller.session().await;
        let rows = match &session {
            Some(s) if s.status != SessionStatus::Completed => {
                match self.log.for_session(s.session_id).await {
                    Ok(rows) => rows,
                    Err(e) => {
                        warn!(session_id = %s.session_id, error = %e, "Progress falling back to phase states");
                        Vec::new()
                    }
                }
            }
            _ => Vec::new(),
        };
        self.snapshot(session.as_ref(), &rows)
    }

    /// Snapshots on every state change, and at least every `interval`.
    ///
    /// The first item is the current status. The stream ends after yielding a
    /// final snapshot.
    pub fn stream_status(&self, interval: Duration) -> impl Stream<Item = ProgressSnapshot> + Send + 'static {
        let reporter = self.clone();
        let mut changes = self.controller.subscribe();
        async_stream::stream! {
            loop {
                changes.borrow_and_update();
                let snapshot = reporter.status().await;
                let done = snapshot.is_final();
                yield snapshot;
                if done {
                    break;
                }
                tokio::select! {
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }
    }

    fn snapshot(&self, session: Option<&LoadingSession>, rows: &[ScraperExecution]) -> ProgressSnapshot {
        let plan = self.controller.plan();
        let timestamp = self.clock.now();

        let Some(session) = session else {
            return ProgressSnapshot {
                session_id: None,
                status: SessionStatus::NoSession,
                strategy: None,
                overall_percentage: 0.0,
                current_phase: None,
                current_operation: "Idle".to_string(),
                phases: plan
                    .phases()
                    .iter()
                    .map(|p| PhaseProgress {
                        key: p.key.clone(),
                        name: p.name.clone(),
                        state: PhaseState::NotStarted,
                        jurisdictions_total: p.jurisdictions.len(),
                        jurisdictions_done: 0,
                        weight: p.estimated_minutes,
                        estimated_minutes: None,
                        percentage: 0.0,
                    })
                    .collect(),
                timestamp,
            };
        };

        let phases: Vec<PhaseProgress> = plan
            .phases()
            .iter()
            .enumerate()
            .map(|(i, phase)| {
                let state = session
                    .phase_states
                    .get(i)
                    .copied()
                    .unwrap_or(PhaseState::NotStarted);
                let total = phase.jurisdictions.len();
                let since = session.phase_started_at.get(i).copied().flatten();
                let done = finished_jurisdictions(rows, &phase.key, since).min(total);
                let fraction = match state {
                    PhaseState::Completed | PhaseState::Skipped => 1.0,
                    PhaseState::NotStarted => 0.0,
                    PhaseState::Running | PhaseState::Failed if total > 0 => {
                        done as f64 / total as f64
                    }
                    PhaseState::Running | PhaseState::Failed => 0.0,
                };
                PhaseProgress {
                    key: phase.key.clone(),
                    name: phase.name.clone(),
                    state,
                    jurisdictions_total: total,
                    jurisdictions_done: done,
                    weight: phase.estimated_minutes,
                    estimated_minutes: Some(session.strategy.scale_minutes(phase.estimated_minutes)),
                    percentage: fraction * 100.0,
                }
            })
            .collect();

        let total_weight = plan.total_weight();
        let overall_percentage = if session.status == SessionStatus::Completed {
            100.0
        } else if total_weight == 0 {
            0.0
        } else {
            let weighted: f64 = phases
                .iter()
                .map(|p| p.weight as f64 * p.percentage / 100.0)
                .sum();
            (weighted / total_weight as f64 * 100.0).clamp(0.0, 100.0)
        };

        let current = plan.get(session.current_phase_index);
        let current_operation = match (session.status, current, session.current_state()) {
            (SessionStatus::Completed, _, _) => "All phases complete".to_string(),
            (SessionStatus::Cancelled, _, _) => format!(
                "Cancelled: {}",
                session.cancel_reason.as_deref().unwrap_or("no reason given")
            ),
            (SessionStatus::Paused, Some(p), _) => format!("Paused before {}", p.name),
            (_, Some(p), Some(PhaseState::Running)) => format!("Running {}", p.name),
            (_, Some(p), Some(PhaseState::Failed)) => {
                format!("{} failed; waiting for skip, retry or cancel", p.name)
            }
            (_, Some(p), _) => format!("Starting {}", p.name),
            (_, None, _) => "Finishing".to_string(),
        };

        ProgressSnapshot {
            session_id: Some(session.session_id),
            status: session.status,
            strategy: Some(session.strategy),
            overall_percentage,
            current_phase: current.map(|p| p.key.clone()),
            current_operation,
            phases,
            timestamp,
        }
    }
}

/// Distinct jurisdictions with a terminal execution row in the phase's latest
/// attempt. Rows from an attempt before a retry do not count.
fn finished_jurisdictions(
    rows: &[ScraperExecution],
    phase_key: &str,
    since: Option<DateTime<Utc>>,
) -> usize {
    let Some(since) = since else {
        return 0;
    };
    rows.iter()
        .filter(|r| r.phase_key.as_deref() == Some(phase_key) && r.status.is_terminal())
        .filter(|r| r.start_time.is_some_and(|t| t >= since))
        .map(|r| r.jurisdiction_id.as_str())
        .collect::<HashSet<_>>()
        .len()
}
