//! Postgres implementations of the storage traits.
//!
//! Lifecycle guards live in the `WHERE` clauses: a transition only lands if
//! the row is still in the expected source state, so a late `finish` from a
//! runner cannot overwrite a row a cancel has already stopped.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use civic_common::{
    EntityType, ExecutionOutcome, ExecutionStatus, RawRecord, ScraperExecution, UpsertOutcome,
};

use crate::execution_log::{ExecutionLog, TransitionRejected};
use crate::records::{RecordStore, StoredRecord};

const EXECUTION_COLUMNS: &str = "id, session_id, phase_key, scraper_id, jurisdiction_id, status, \
     start_time, end_time, heartbeat_at, records_collected, records_created, records_updated, error_count, last_error";

/// Create tables if they do not exist. Idempotent.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS scraper_executions (
            id                UUID         PRIMARY KEY,
            session_id        UUID,
            phase_key         TEXT,
            scraper_id        TEXT         NOT NULL,
            jurisdiction_id   TEXT         NOT NULL,
            status            TEXT         NOT NULL,
            start_time        TIMESTAMPTZ,
            end_time          TIMESTAMPTZ,
            heartbeat_at      TIMESTAMPTZ,
            records_collected BIGINT       NOT NULL DEFAULT 0,
            records_created   BIGINT       NOT NULL DEFAULT 0,
            records_updated   BIGINT       NOT NULL DEFAULT 0,
            error_count       INTEGER      NOT NULL DEFAULT 0,
            last_error        TEXT,
            created_at        TIMESTAMPTZ  NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("ALTER TABLE scraper_executions ADD COLUMN IF NOT EXISTS heartbeat_at TIMESTAMPTZ")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS scraper_executions_session_idx ON scraper_executions (session_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS scraper_executions_success_idx \
         ON scraper_executions (scraper_id, end_time) WHERE status = 'completed'",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS civic_records (
            jurisdiction_id TEXT         NOT NULL,
            entity_type     TEXT         NOT NULL,
            natural_key     TEXT         NOT NULL,
            fields          JSONB        NOT NULL,
            created_at      TIMESTAMPTZ  NOT NULL,
            updated_at      TIMESTAMPTZ  NOT NULL,
            last_seen_at    TIMESTAMPTZ  NOT NULL,
            PRIMARY KEY (jurisdiction_id, entity_type, natural_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    info!("Storage schema ready");
    Ok(())
}

// ---------------------------------------------------------------------------
// PgExecutionLog
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PgExecutionLog {
    pool: PgPool,
}

impl PgExecutionLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Explain why a guarded update touched no rows.
    async fn rejection(&self, id: Uuid, to: ExecutionStatus) -> anyhow::Error {
        match self.get(id).await {
            Ok(Some(row)) => TransitionRejected {
                id,
                from: row.status,
                to,
            }
            .into(),
            Ok(None) => anyhow::anyhow!("execution {id} not found"),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl ExecutionLog for PgExecutionLog {
    async fn record_scheduled(&self, execution: &ScraperExecution) -> Result<()> {
        if execution.status != ExecutionStatus::Scheduled {
            anyhow::bail!(
                "execution {} must be inserted as scheduled, got {}",
                execution.id,
                execution.status
            );
        }
        sqlx::query(
            r#"
            INSERT INTO scraper_executions (id, session_id, phase_key, scraper_id, jurisdiction_id, status)
            VALUES ($1, $2, $3, $4, $5, 'scheduled')
            "#,
        )
        .bind(execution.id)
        .bind(execution.session_id)
        .bind(&execution.phase_key)
        .bind(&execution.scraper_id)
        .bind(&execution.jurisdiction_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_running(&self, id: Uuid, started_at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE scraper_executions SET status = 'running', start_time = $2, heartbeat_at = $2 \
             WHERE id = $1 AND status = 'scheduled'",
        )
        .bind(id)
        .bind(started_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.rejection(id, ExecutionStatus::Running).await);
        }
        Ok(())
    }

    async fn heartbeat(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "UPDATE scraper_executions SET heartbeat_at = $2 WHERE id = $1 AND status = 'running'",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish(&self, id: Uuid, outcome: &ExecutionOutcome) -> Result<()> {
        if !ExecutionStatus::Running.can_transition(outcome.status) {
            return Err(TransitionRejected {
                id,
                from: ExecutionStatus::Running,
                to: outcome.status,
            }
            .into());
        }

        let result = sqlx::query(
            r#"
            UPDATE scraper_executions
            SET status = $2, end_time = $3, records_collected = $4, records_created = $5,
                records_updated = $6, error_count = $7, last_error = $8
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(id)
        .bind(outcome.status.as_str())
        .bind(outcome.finished_at)
        .bind(outcome.records_collected as i64)
        .bind(outcome.records_created as i64)
        .bind(outcome.records_updated as i64)
        .bind(outcome.error_count as i32)
        .bind(&outcome.last_error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.rejection(id, outcome.status).await);
        }
        Ok(())
    }

    async fn stop_running(
        &self,
        session_id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE scraper_executions \
             SET status = 'stopped', end_time = $2, error_count = error_count + 1, last_error = $3 \
             WHERE session_id = $1 AND status = 'running'",
        )
        .bind(session_id)
        .bind(at)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn reconcile_orphaned(
        &self,
        reason: &str,
        at: DateTime<Utc>,
        stale_before: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE scraper_executions \
             SET status = 'stopped', end_time = $1, error_count = error_count + 1, last_error = $2 \
             WHERE status = 'running' \
               AND COALESCE(heartbeat_at, start_time, '-infinity'::timestamptz) < $3",
        )
        .bind(at)
        .bind(reason)
        .bind(stale_before)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ScraperExecution>> {
        let row = sqlx::query_as::<_, ExecutionRow>(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM scraper_executions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.0))
    }

    async fn last_success(&self, scraper_id: &str) -> Result<Option<DateTime<Utc>>> {
        let row = sqlx::query_as::<_, (Option<DateTime<Utc>>,)>(
            "SELECT MAX(end_time) FROM scraper_executions \
             WHERE scraper_id = $1 AND status = 'completed'",
        )
        .bind(scraper_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }

    async fn for_session(&self, session_id: Uuid) -> Result<Vec<ScraperExecution>> {
        let rows = sqlx::query_as::<_, ExecutionRow>(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM scraper_executions \
             WHERE session_id = $1 ORDER BY created_at ASC"
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<ScraperExecution>> {
        let rows = sqlx::query_as::<_, ExecutionRow>(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM scraper_executions \
             ORDER BY created_at DESC LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }
}

struct ExecutionRow(ScraperExecution);

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for ExecutionRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> std::result::Result<Self, sqlx::Error> {
        use sqlx::Row;
        let status: String = row.try_get("status")?;
        let status = status
            .parse::<ExecutionStatus>()
            .map_err(|e| sqlx::Error::Decode(e.into()))?;
        let records_collected: i64 = row.try_get("records_collected")?;
        let records_created: i64 = row.try_get("records_created")?;
        let records_updated: i64 = row.try_get("records_updated")?;
        let error_count: i32 = row.try_get("error_count")?;

        Ok(ExecutionRow(ScraperExecution {
            id: row.try_get("id")?,
            session_id: row.try_get("session_id")?,
            phase_key: row.try_get("phase_key")?,
            scraper_id: row.try_get("scraper_id")?,
            jurisdiction_id: row.try_get("jurisdiction_id")?,
            status,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            heartbeat_at: row.try_get("heartbeat_at")?,
            records_collected: records_collected.max(0) as u64,
            records_created: records_created.max(0) as u64,
            records_updated: records_updated.max(0) as u64,
            error_count: error_count.max(0) as u32,
            last_error: row.try_get("last_error")?,
        }))
    }
}

// ---------------------------------------------------------------------------
// PgRecordStore
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn upsert(
        &self,
        jurisdiction_id: &str,
        record: &RawRecord,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        // xmax = 0 only for freshly inserted tuples. updated_at moves only on a real change.
        let (inserted, changed) = sqlx::query_as::<_, (bool, bool)>(
            r#"
            INSERT INTO civic_records
                (jurisdiction_id, entity_type, natural_key, fields, created_at, updated_at, last_seen_at)
            VALUES ($1, $2, $3, $4, $5, $5, $5)
            ON CONFLICT (jurisdiction_id, entity_type, natural_key) DO UPDATE SET
                fields = EXCLUDED.fields,
                updated_at = CASE
                    WHEN civic_records.fields = EXCLUDED.fields THEN civic_records.updated_at
                    ELSE EXCLUDED.updated_at
                END,
                last_seen_at = EXCLUDED.last_seen_at
            RETURNING (xmax = 0) AS inserted, (updated_at = $5) AS changed
            "#,
        )
        .bind(jurisdiction_id)
        .bind(record.entity_type.as_str())
        .bind(&record.natural_key)
        .bind(serde_json::Value::Object(record.fields.clone()))
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(match (inserted, changed) {
            (true, _) => UpsertOutcome::Created,
            (false, true) => UpsertOutcome::Updated,
            (false, false) => UpsertOutcome::Unchanged,
        })
    }

    async fn get(
        &self,
        jurisdiction_id: &str,
        entity_type: EntityType,
        natural_key: &str,
    ) -> Result<Option<StoredRecord>> {
        let row = sqlx::query_as::<
            _,
            (
                serde_json::Value,
                DateTime<Utc>,
                DateTime<Utc>,
                DateTime<Utc>,
            ),
        >(
            "SELECT fields, created_at, updated_at, last_seen_at FROM civic_records \
             WHERE jurisdiction_id = $1 AND entity_type = $2 AND natural_key = $3",
        )
        .bind(jurisdiction_id)
        .bind(entity_type.as_str())
        .bind(natural_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(fields, created_at, updated_at, last_seen_at)| StoredRecord {
            jurisdiction_id: jurisdiction_id.to_string(),
            entity_type,
            natural_key: natural_key.to_string(),
            fields: match fields {
                serde_json::Value::Object(map) => map,
                _ => serde_json::Map::new(),
            },
            created_at,
            updated_at,
            last_seen_at,
        }))
    }

    async fn count(&self, jurisdiction_id: &str) -> Result<u64> {
        let row = sqlx::query_as::<_, (i64,)>(
            "SELECT COUNT(*) FROM civic_records WHERE jurisdiction_id = $1",
        )
        .bind(jurisdiction_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0.max(0) as u64)
    }
}
