//! Storage collaborators for the orchestrator.
//!
//! Two concerns, each behind a trait with an in-memory and a Postgres
//! implementation:
//!
//! - `ExecutionLog`: append-only history of scraper runs. Enforces the
//!   Scheduled -> Running -> terminal lifecycle on every write.
//! - `RecordStore`: idempotent upsert of scraped records keyed by
//!   (jurisdiction, entity type, natural key).

pub mod execution_log;
pub mod postgres;
pub mod records;

pub use execution_log::{
    heartbeat_cutoff, ExecutionLog, MemoryExecutionLog, TransitionRejected, HEARTBEAT_EXPIRY,
    HEARTBEAT_INTERVAL,
};
pub use postgres::{ensure_schema, PgExecutionLog, PgRecordStore};
pub use records::{MemoryRecordStore, RecordStore, StoredRecord};
