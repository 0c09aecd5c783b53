//! The singleton loading session and its control operations.
//!
//! Every transition goes through one async mutex, so concurrent control calls
//! resolve in a single order. Phase execution itself happens outside the lock;
//! only its start and its result are recorded under it.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use civic_common::{
    Clock, ControlError, LoadingSession, PhaseState, SessionStatus, Strategy,
};
use civic_scout::BatchReport;

use crate::phases::PhasePlan;
use crate::run_log::{EventKind, SessionRunLog};
use crate::sequencer::PhaseSequencer;

/// Structured result of a control operation. Nothing is thrown across this boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ControlResponse {
    pub success: bool,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub session_id: Option<Uuid>,
}

/// Control operations as exposed to an outer API layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlCommand {
    Start {
        strategy: Strategy,
        #[serde(default)]
        manual_controls: bool,
    },
    Pause,
    Resume,
    SkipCurrentPhase {
        reason: String,
    },
    RetryCurrentPhase {
        reason: String,
    },
    Cancel {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriveOutcome {
    Completed,
    Cancelled,
    /// The current phase failed; automatic progression stopped.
    Halted { phase: String },
}

struct Active {
    session: LoadingSession,
    cancel: CancellationToken,
    run_log: SessionRunLog,
    report: BatchReport,
}

#[derive(Default)]
struct Slot {
    active: Option<Active>,
    last: Option<LoadingSession>,
    last_report: BatchReport,
}

impl Slot {
    fn active_mut(&mut self, operation: &'static str) -> Result<&mut Active, ControlError> {
        let from = self.idle_status();
        self.active
            .as_mut()
            .ok_or_else(|| ControlError::InvalidTransition {
                operation,
                from: from.to_string(),
            })
    }

    /// Status reported when nothing is active.
    fn idle_status(&self) -> SessionStatus {
        self.last
            .as_ref()
            .map_or(SessionStatus::NoSession, |s| s.status)
    }
}

enum Step {
    Execute,
    Wait,
    Halt(String),
    Done(DriveOutcome),
}

pub struct SessionController {
    slot: Mutex<Slot>,
    changes: watch::Sender<u64>,
    sequencer: Arc<PhaseSequencer>,
    clock: Arc<dyn Clock>,
    data_dir: Option<PathBuf>,
}

impl SessionController {
    /// `data_dir`, when set, receives a JSON run log per session.
    pub fn new(
        sequencer: Arc<PhaseSequencer>,
        clock: Arc<dyn Clock>,
        data_dir: Option<PathBuf>,
    ) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            slot: Mutex::new(Slot::default()),
            changes,
            sequencer,
            clock,
            data_dir,
        }
    }

    pub fn plan(&self) -> &PhasePlan {
        self.sequencer.plan()
    }

    /// Bumped on every state change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// The active session, or the most recent finished one.
    pub async fn session(&self) -> Option<LoadingSession> {
        let slot = self.slot.lock().await;
        slot.active
            .as_ref()
            .map(|a| a.session.clone())
            .or_else(|| slot.last.clone())
    }

    /// Scraper results accumulated by the active or most recent session.
    pub async fn report(&self) -> BatchReport {
        let slot = self.slot.lock().await;
        match &slot.active {
            Some(active) => active.report.clone(),
            None => slot.last_report.clone(),
        }
    }

    pub async fn start(
        &self,
        strategy: Strategy,
        manual_controls: bool,
    ) -> Result<Uuid, ControlError> {
        let mut slot = self.slot.lock().await;
        if let Some(active) = &slot.active {
            warn!(active = %active.session.session_id, "Start rejected, session already active");
            return Err(ControlError::SessionAlreadyActive {
                session_id: active.session.session_id,
            });
        }

        let now = self.clock.now();
        let session = LoadingSession::new(strategy, manual_controls, self.plan().len(), now);
        let session_id = session.session_id;
        let mut run_log = SessionRunLog::new(session_id, strategy, now);
        run_log.log(
            now,
            EventKind::Started {
                manual_controls,
                phases: self.plan().len(),
            },
        );

        let active = Active {
            session,
            cancel: CancellationToken::new(),
            run_log,
            report: BatchReport::default(),
        };
        self.persist(&active);
        slot.active = Some(active);
        drop(slot);

        info!(%session_id, %strategy, manual_controls, "Loading session started");
        self.notify();
        Ok(session_id)
    }

    /// Stop the next phase from starting. An executing phase runs to completion.
    pub async fn pause(&self) -> Result<(), ControlError> {
        let mut slot = self.slot.lock().await;
        let active = slot.active_mut("pause")?;
        require_status(active, "pause", SessionStatus::Running)?;

        let now = self.clock.now();
        active.session.status = SessionStatus::Paused;
        active.run_log.log(now, EventKind::Paused);
        self.persist(active);
        info!(session_id = %active.session.session_id, "Session paused");
        drop(slot);
        self.notify();
        Ok(())
    }

    pub async fn resume(&self) -> Result<(), ControlError> {
        let mut slot = self.slot.lock().await;
        let active = slot.active_mut("resume")?;
        require_status(active, "resume", SessionStatus::Paused)?;

        let now = self.clock.now();
        active.session.status = SessionStatus::Running;
        active.run_log.log(now, EventKind::Resumed);
        self.persist(active);
        info!(session_id = %active.session.session_id, "Session resumed");
        drop(slot);
        self.notify();
        Ok(())
    }

    /// Mark the current phase Skipped and advance. Requires manual controls.
    pub async fn skip_current_phase(&self, reason: &str) -> Result<(), ControlError> {
        let mut slot = self.slot.lock().await;
        let active = slot.active_mut("skip phase")?;
        if !active.session.manual_controls_enabled {
            return Err(ControlError::ManualControlsDisabled);
        }
        let (index, state) = current_phase(active, "skip phase")?;
        let key = self.phase_key(index);
        if state == PhaseState::Running {
            return Err(ControlError::PhaseInFlight { phase: key });
        }

        let now = self.clock.now();
        active.session.phase_states[index] = PhaseState::Skipped;
        active.session.current_phase_index += 1;
        active.run_log.log(
            now,
            EventKind::PhaseSkipped {
                phase: key.clone(),
                reason: reason.to_string(),
            },
        );
        warn!(session_id = %active.session.session_id, phase = %key, reason, "Phase skipped");

        if active.session.all_phases_done() {
            self.complete(&mut slot, now);
        } else {
            self.persist(active);
        }
        drop(slot);
        self.notify();
        Ok(())
    }

    /// Reset a Failed current phase so it can run again. Never happens automatically.
    pub async fn retry_current_phase(&self, reason: &str) -> Result<(), ControlError> {
        let mut slot = self.slot.lock().await;
        let active = slot.active_mut("retry phase")?;
        if !active.session.manual_controls_enabled {
            return Err(ControlError::ManualControlsDisabled);
        }
        let (index, state) = current_phase(active, "retry phase")?;
        if state != PhaseState::Failed {
            return Err(ControlError::InvalidTransition {
                operation: "retry phase",
                from: state.to_string(),
            });
        }

        let key = self.phase_key(index);
        active.session.phase_states[index] = PhaseState::NotStarted;
        active.run_log.log(
            self.clock.now(),
            EventKind::PhaseRetried {
                phase: key.clone(),
                reason: reason.to_string(),
            },
        );
        self.persist(active);
        info!(session_id = %active.session.session_id, phase = %key, reason, "Phase reset for retry");
        drop(slot);
        self.notify();
        Ok(())
    }

    /// Cancel from any non-terminal state and release the slot.
    ///
    /// In-flight scrapers are killed and their Running rows closed as Stopped.
    pub async fn cancel(&self, reason: &str) -> Result<(), ControlError> {
        let mut slot = self.slot.lock().await;
        let from = slot.idle_status();
        let Some(mut active) = slot.active.take() else {
            return Err(ControlError::InvalidTransition {
                operation: "cancel",
                from: from.to_string(),
            });
        };

        active.cancel.cancel();
        let now = self.clock.now();
        let session_id = active.session.session_id;
        if let Some(PhaseState::Running) = active.session.current_state() {
            let index = active.session.current_phase_index;
            active.session.phase_states[index] = PhaseState::Failed;
        }
        active.session.status = SessionStatus::Cancelled;
        active.session.finished_at = Some(now);
        active.session.cancel_reason = Some(reason.to_string());

        let stopped = match self
            .sequencer
            .log()
            .stop_running(session_id, reason, now)
            .await
        {
            Ok(n) => n,
            Err(e) => {
                error!(%session_id, error = %e, "Failed to stop running executions");
                0
            }
        };
        active.run_log.log(
            now,
            EventKind::Cancelled {
                reason: reason.to_string(),
                stopped_executions: stopped,
            },
        );
        self.persist(&active);
        warn!(%session_id, reason, stopped, "Session cancelled");

        slot.last = Some(active.session);
        slot.last_report = active.report;
        drop(slot);
        self.notify();
        Ok(())
    }

    /// Run the current phase to its end. Returns whether it passed.
    pub async fn execute_current_phase(&self) -> Result<bool, ControlError> {
        let (phase, strategy, session_id, cancel, index) = {
            let mut slot = self.slot.lock().await;
            let active = slot.active.as_mut().ok_or(ControlError::NoActiveSession)?;
            require_status(active, "execute phase", SessionStatus::Running)?;
            let (index, state) = current_phase(active, "execute phase")?;
            let phase = self
                .plan()
                .get(index)
                .cloned()
                .ok_or_else(|| ControlError::UnknownPhase(index.to_string()))?;
            match state {
                PhaseState::Running => {
                    return Err(ControlError::PhaseInFlight { phase: phase.key })
                }
                PhaseState::Failed => return Err(ControlError::PhaseFailed { phase: phase.key }),
                _ => {}
            }
            let missing = self
                .plan()
                .unmet_dependencies(index, &active.session.phase_states);
            if !missing.is_empty() {
                return Err(ControlError::PhaseDependencyUnmet {
                    phase: phase.key,
                    missing,
                });
            }

            let now = self.clock.now();
            active.session.mark_phase_started(index, now);
            active.run_log.log(
                now,
                EventKind::PhaseStarted {
                    phase: phase.key.clone(),
                    jurisdictions: phase.jurisdictions.len(),
                },
            );
            self.persist(active);
            (
                phase,
                active.session.strategy,
                active.session.session_id,
                active.cancel.clone(),
                index,
            )
        };
        self.notify();

        let outcome = self
            .sequencer
            .execute(&phase, strategy, session_id, cancel)
            .await;

        let mut slot = self.slot.lock().await;
        let now = self.clock.now();
        let Some(active) = slot
            .active
            .as_mut()
            .filter(|a| a.session.session_id == session_id)
        else {
            // Cancelled while the phase ran.
            return Ok(false);
        };

        active.report.merge(outcome.report.clone());
        if outcome.passed {
            active.session.phase_states[index] = PhaseState::Completed;
            active.session.current_phase_index = index + 1;
            active.run_log.log(
                now,
                EventKind::PhaseCompleted {
                    phase: phase.key.clone(),
                    succeeded: outcome.succeeded,
                    total: outcome.total,
                    records: outcome.report.records_collected(),
                },
            );
        } else {
            active.session.phase_states[index] = PhaseState::Failed;
            active.run_log.log(
                now,
                EventKind::PhaseFailed {
                    phase: phase.key.clone(),
                    succeeded: outcome.succeeded,
                    total: outcome.total,
                    threshold: outcome.threshold,
                    unresolved: outcome.unresolved.clone(),
                },
            );
        }

        if active.session.all_phases_done() {
            self.complete(&mut slot, now);
        } else {
            self.persist(active);
        }
        drop(slot);
        self.notify();
        Ok(outcome.passed)
    }

    /// Run phases back to back while Running, waiting while Paused.
    pub async fn drive(&self) -> Result<DriveOutcome, ControlError> {
        let mut changes = self.changes.subscribe();
        let session_id = {
            let slot = self.slot.lock().await;
            slot.active
                .as_ref()
                .ok_or(ControlError::NoActiveSession)?
                .session
                .session_id
        };

        loop {
            changes.borrow_and_update();
            let step = {
                let slot = self.slot.lock().await;
                match &slot.active {
                    Some(active) if active.session.session_id == session_id => {
                        match (active.session.status, active.session.current_state()) {
                            (SessionStatus::Paused, _) => Step::Wait,
                            (_, Some(PhaseState::Failed)) => {
                                Step::Halt(self.phase_key(active.session.current_phase_index))
                            }
                            (_, Some(PhaseState::Running)) => Step::Wait,
                            _ => Step::Execute,
                        }
                    }
                    _ => Step::Done(match &slot.last {
                        Some(last)
                            if last.session_id == session_id
                                && last.status == SessionStatus::Completed =>
                        {
                            DriveOutcome::Completed
                        }
                        _ => DriveOutcome::Cancelled,
                    }),
                }
            };

            match step {
                Step::Execute => match self.execute_current_phase().await {
                    Ok(_) => {}
                    Err(ControlError::PhaseInFlight { .. }) => {
                        let _ = changes.changed().await;
                    }
                    // State moved under us; re-evaluate.
                    Err(ControlError::InvalidTransition { .. })
                    | Err(ControlError::NoActiveSession)
                    | Err(ControlError::PhaseFailed { .. }) => {}
                    Err(e) => return Err(e),
                },
                Step::Wait => {
                    let _ = changes.changed().await;
                }
                Step::Halt(phase) => {
                    warn!(%session_id, %phase, "Automatic progression halted");
                    return Ok(DriveOutcome::Halted { phase });
                }
                Step::Done(outcome) => return Ok(outcome),
            }
        }
    }

    /// Apply a command and convert the result into a `ControlResponse`.
    pub async fn handle(&self, command: ControlCommand) -> ControlResponse {
        let result = match command {
            ControlCommand::Start {
                strategy,
                manual_controls,
            } => self
                .start(strategy, manual_controls)
                .await
                .map(|id| format!("Session {id} started with {strategy} strategy")),
            ControlCommand::Pause => self.pause().await.map(|_| "Session paused".to_string()),
            ControlCommand::Resume => self.resume().await.map(|_| "Session resumed".to_string()),
            ControlCommand::SkipCurrentPhase { reason } => self
                .skip_current_phase(&reason)
                .await
                .map(|_| format!("Phase skipped: {reason}")),
            ControlCommand::RetryCurrentPhase { reason } => self
                .retry_current_phase(&reason)
                .await
                .map(|_| format!("Phase reset for retry: {reason}")),
            ControlCommand::Cancel { reason } => self
                .cancel(&reason)
                .await
                .map(|_| format!("Session cancelled: {reason}")),
        };

        let session_id = self.session().await.map(|s| s.session_id);
        let timestamp = self.clock.now();
        match result {
            Ok(message) => ControlResponse {
                success: true,
                message,
                timestamp,
                session_id,
            },
            Err(e) => {
                warn!(error = %e, "Control operation rejected");
                ControlResponse {
                    success: false,
                    message: e.to_string(),
                    timestamp,
                    session_id,
                }
            }
        }
    }

    fn phase_key(&self, index: usize) -> String {
        self.plan()
            .get(index)
            .map(|p| p.key.clone())
            .unwrap_or_default()
    }

    /// Close the active session as Completed.
    fn complete(&self, slot: &mut Slot, now: DateTime<Utc>) {
        let Some(mut active) = slot.active.take() else {
            return;
        };
        active.session.status = SessionStatus::Completed;
        active.session.finished_at = Some(now);
        active.run_log.log(now, EventKind::Completed);
        self.persist(&active);
        info!(
            session_id = %active.session.session_id,
            records = active.report.records_collected(),
            "Loading session completed"
        );
        slot.last = Some(active.session);
        slot.last_report = active.report;
    }

    fn persist(&self, active: &Active) {
        let Some(dir) = &self.data_dir else {
            return;
        };
        if let Err(e) = active.run_log.save(dir, active.session.status) {
            warn!(session_id = %active.session.session_id, error = %e, "Failed to save session run log");
        }
    }

    fn notify(&self) {
        self.changes.send_modify(|v| *v = v.wrapping_add(1));
    }
}

fn require_status(
    active: &Active,
    operation: &'static str,
    expected: SessionStatus,
) -> Result<(), ControlError> {
    if active.session.status != expected {
        return Err(ControlError::InvalidTransition {
            operation,
            from: active.session.status.to_string(),
        });
    }
    Ok(())
}

fn current_phase(
    active: &Active,
    operation: &'static str,
) -> Result<(usize, PhaseState), ControlError> {
    let index = active.session.current_phase_index;
    active
        .session
        .current_state()
        .map(|state| (index, state))
        .ok_or_else(|| ControlError::InvalidTransition {
            operation,
            from: "all phases done".into(),
        })
}
