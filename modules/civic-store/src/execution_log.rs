use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use civic_common::{ExecutionOutcome, ExecutionStatus, ScraperExecution};

/// A write that would break the execution lifecycle. Surfaced so the caller can
/// tell "already reconciled by cancel" apart from a storage failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("execution {id}: cannot move from {from} to {to}")]
pub struct TransitionRejected {
    pub id: Uuid,
    pub from: ExecutionStatus,
    pub to: ExecutionStatus,
}

/// How often a runner refreshes `heartbeat_at` on its Running row.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// A Running row whose heartbeat is older than this is presumed orphaned.
pub const HEARTBEAT_EXPIRY: Duration = Duration::from_secs(90);

/// Cutoff for [`ExecutionLog::reconcile_orphaned`] given the current time.
pub fn heartbeat_cutoff(now: DateTime<Utc>) -> DateTime<Utc> {
    now - chrono::Duration::seconds(HEARTBEAT_EXPIRY.as_secs() as i64)
}

/// Append-only history of scraper runs.
///
/// Implemented by `PgExecutionLog` (postgres) and `MemoryExecutionLog` (tests,
/// database-less runs). Also implemented for `Arc<L>` so one log can be shared.
#[async_trait]
pub trait ExecutionLog: Send + Sync {
    /// Insert a new row. The row must be in `Scheduled` state.
    async fn record_scheduled(&self, execution: &ScraperExecution) -> Result<()>;

    /// Scheduled -> Running. Also the row's first heartbeat.
    async fn mark_running(&self, id: Uuid, started_at: DateTime<Utc>) -> Result<()>;

    /// Refresh the liveness mark of a Running row. No-op once the row is terminal.
    async fn heartbeat(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Running -> Completed | Failed | Stopped.
    async fn finish(&self, id: Uuid, outcome: &ExecutionOutcome) -> Result<()>;

    /// Mark every Running row of a session Stopped. Returns rows touched.
    async fn stop_running(&self, session_id: Uuid, reason: &str, at: DateTime<Utc>)
        -> Result<u64>;

    /// Crash recovery: mark Running rows whose last heartbeat is before
    /// `stale_before` Stopped, regardless of session. Rows still being
    /// heartbeated by a live runner are left alone.
    async fn reconcile_orphaned(
        &self,
        reason: &str,
        at: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<u64>;

    async fn get(&self, id: Uuid) -> Result<Option<ScraperExecution>>;

    /// End time of the most recent Completed run of a scraper.
    async fn last_success(&self, scraper_id: &str) -> Result<Option<DateTime<Utc>>>;

    /// All rows written under a loading session, oldest first.
    async fn for_session(&self, session_id: Uuid) -> Result<Vec<ScraperExecution>>;

    /// Most recent rows, newest first.
    async fn recent(&self, limit: usize) -> Result<Vec<ScraperExecution>>;
}

// ---------------------------------------------------------------------------
// MemoryExecutionLog
// ---------------------------------------------------------------------------

/// In-memory execution log. Thread-safe; rows kept in insertion order.
#[derive(Default)]
pub struct MemoryExecutionLog {
    rows: Mutex<Vec<ScraperExecution>>,
}

impl MemoryExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every row (for test assertions).
    pub fn rows(&self) -> Vec<ScraperExecution> {
        self.guard().clone()
    }

    // A panic while holding the lock cannot leave a row half-written.
    fn guard(&self) -> MutexGuard<'_, Vec<ScraperExecution>> {
        self.rows.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transition(
        &self,
        id: Uuid,
        to: ExecutionStatus,
        apply: impl FnOnce(&mut ScraperExecution),
    ) -> Result<()> {
        let mut rows = self.guard();
        let row = rows
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| anyhow::anyhow!("execution {id} not found"))?;
        if !row.status.can_transition(to) {
            return Err(TransitionRejected {
                id,
                from: row.status,
                to,
            }
            .into());
        }
        row.status = to;
        apply(row);
        Ok(())
    }

    fn stop_where(
        &self,
        reason: &str,
        at: DateTime<Utc>,
        filter: impl Fn(&ScraperExecution) -> bool,
    ) -> u64 {
        let mut rows = self.guard();
        let mut touched = 0;
        for row in rows
            .iter_mut()
            .filter(|r| r.status == ExecutionStatus::Running && filter(r))
        {
            row.status = ExecutionStatus::Stopped;
            row.end_time = Some(at);
            row.error_count += 1;
            row.last_error = Some(reason.to_string());
            touched += 1;
        }
        touched
    }
}

#[async_trait]
impl ExecutionLog for MemoryExecutionLog {
    async fn record_scheduled(&self, execution: &ScraperExecution) -> Result<()> {
        if execution.status != ExecutionStatus::Scheduled {
            anyhow::bail!(
                "execution {} must be inserted as scheduled, got {}",
                execution.id,
                execution.status
            );
        }
        let mut rows = self.guard();
        if rows.iter().any(|r| r.id == execution.id) {
            anyhow::bail!("execution {} already recorded", execution.id);
        }
        rows.push(execution.clone());
        Ok(())
    }

    async fn mark_running(&self, id: Uuid, started_at: DateTime<Utc>) -> Result<()> {
        self.transition(id, ExecutionStatus::Running, |row| {
            row.start_time = Some(started_at);
            row.heartbeat_at = Some(started_at);
        })
    }

    async fn heartbeat(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut rows = self.guard();
        if let Some(row) = rows
            .iter_mut()
            .find(|r| r.id == id && r.status == ExecutionStatus::Running)
        {
            row.heartbeat_at = Some(at);
        }
        Ok(())
    }

    async fn finish(&self, id: Uuid, outcome: &ExecutionOutcome) -> Result<()> {
        self.transition(id, outcome.status, |row| {
            row.end_time = Some(outcome.finished_at);
            row.records_collected = outcome.records_collected;
            row.records_created = outcome.records_created;
            row.records_updated = outcome.records_updated;
            row.error_count = outcome.error_count;
            row.last_error = outcome.last_error.clone();
        })
    }

    async fn stop_running(
        &self,
        session_id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        Ok(self.stop_where(reason, at, |r| r.session_id == Some(session_id)))
    }

    async fn reconcile_orphaned(
        &self,
        reason: &str,
        at: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<u64> {
        Ok(self.stop_where(reason, at, |r| {
            r.heartbeat_at
                .or(r.start_time)
                .map_or(true, |seen| seen < stale_before)
        }))
    }

    async fn get(&self, id: Uuid) -> Result<Option<ScraperExecution>> {
        Ok(self.guard().iter().find(|r| r.id == id).cloned())
    }

    async fn last_success(&self, scraper_id: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .guard()
            .iter()
            .filter(|r| r.scraper_id == scraper_id && r.status == ExecutionStatus::Completed)
            .filter_map(|r| r.end_time)
            .max())
    }

    async fn for_session(&self, session_id: Uuid) -> Result<Vec<ScraperExecution>> {
        Ok(self
            .guard()
            .iter()
            .filter(|r| r.session_id == Some(session_id))
            .cloned()
            .collect())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<ScraperExecution>> {
        Ok(self
            .guard()
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Arc<L> blanket — lets callers share one log between components
// ---------------------------------------------------------------------------

#[async_trait]
impl<L: ExecutionLog + ?Sized> ExecutionLog for Arc<L> {
    async fn record_scheduled(&self, execution: &ScraperExecution) -> Result<()> {
        (**self).record_scheduled(execution).await
    }

    async fn mark_running(&self, id: Uuid, started_at: DateTime<Utc>) -> Result<()> {
        (**self).mark_running(id, started_at).await
    }

    async fn finish(&self, id: Uuid, outcome: &ExecutionOutcome) -> Result<()> {
        (**self).finish(id, outcome).await
    }

    async fn stop_running(
        &self,
        session_id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        (**self).stop_running(session_id, reason, at).await
    }

    async fn heartbeat(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        (**self).heartbeat(id, at).await
    }

    async fn reconcile_orphaned(
        &self,
        reason: &str,
        at: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<u64> {
        (**self).reconcile_orphaned(reason, at, stale_before).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<ScraperExecution>> {
        (**self).get(id).await
    }

    async fn last_success(&self, scraper_id: &str) -> Result<Option<DateTime<Utc>>> {
        (**self).last_success(scraper_id).await
    }

    async fn for_session(&self, session_id: Uuid) -> Result<Vec<ScraperExecution>> {
        (**self).for_session(session_id).await
    }

    async fn recent(&self, limit: usize) -> Result<Vec<ScraperExecution>> {
        (**self).recent(limit).await
    }
}
