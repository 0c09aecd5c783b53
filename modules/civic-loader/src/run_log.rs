//! Session run log: persisted JSON timeline of one loading session.
//!
//! Each session produces `{DATA_DIR}/loading-sessions/{session_id}.json`,
//! rewritten as events are appended.

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use civic_common::{SessionStatus, Strategy};

pub struct SessionRunLog {
    pub session_id: Uuid,
    pub strategy: Strategy,
    pub started_at: DateTime<Utc>,
    events: Vec<RunEvent>,
    seq: u32,
}

#[derive(Debug, Serialize)]
struct RunEvent {
    seq: u32,
    ts: DateTime<Utc>,
    #[serde(flatten)]
    kind: EventKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Started {
        manual_controls: bool,
        phases: usize,
    },
    PhaseStarted {
        phase: String,
        jurisdictions: usize,
    },
    PhaseCompleted {
        phase: String,
        succeeded: usize,
        total: usize,
        records: u64,
    },
    PhaseFailed {
        phase: String,
        succeeded: usize,
        total: usize,
        threshold: f64,
        unresolved: Vec<String>,
    },
    PhaseSkipped {
        phase: String,
        reason: String,
    },
    PhaseRetried {
        phase: String,
        reason: String,
    },
    Paused,
    Resumed,
    Cancelled {
        reason: String,
        stopped_executions: u64,
    },
    Completed,
}

impl SessionRunLog {
    pub fn new(session_id: Uuid, strategy: Strategy, started_at: DateTime<Utc>) -> Self {
        Self {
            session_id,
            strategy,
            started_at,
            events: Vec::new(),
            seq: 0,
        }
    }

    pub fn log(&mut self, ts: DateTime<Utc>, kind: EventKind) {
        self.events.push(RunEvent {
            seq: self.seq,
            ts,
            kind,
        });
        self.seq += 1;
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Serialize the timeline under `data_dir`. Returns the file path.
    pub fn save(&self, data_dir: &Path, status: SessionStatus) -> Result<PathBuf> {
        let dir = data_dir.join("loading-sessions");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{}.json", self.session_id));

        let output = SerializedRunLog {
            session_id: self.session_id,
            strategy: self.strategy,
            status,
            started_at: self.started_at,
            saved_at: Utc::now(),
            events: &self.events,
        };
        std::fs::write(&path, serde_json::to_string_pretty(&output)?)?;
        debug!(path = %path.display(), events = self.events.len(), "Session run log saved");

        Ok(path)
    }
}

#[derive(Serialize)]
struct SerializedRunLog<'a> {
    session_id: Uuid,
    strategy: Strategy,
    status: SessionStatus,
    started_at: DateTime<Utc>,
    saved_at: DateTime<Utc>,
    events: &'a [RunEvent],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saves_ordered_tagged_events() {
        let dir = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        let mut log = SessionRunLog::new(id, Strategy::Balanced, Utc::now());
        log.log(
            Utc::now(),
            EventKind::Started {
                manual_controls: true,
                phases: 7,
            },
        );
        log.log(
            Utc::now(),
            EventKind::PhaseSkipped {
                phase: "federal_core".into(),
                reason: "source down".into(),
            },
        );

        let path = log.save(dir.path(), SessionStatus::Running).unwrap();
        assert_eq!(
            path,
            dir.path().join("loading-sessions").join(format!("{id}.json"))
        );

        let saved: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(saved["status"], "running");
        assert_eq!(saved["strategy"], "balanced");
        assert_eq!(saved["events"][0]["type"], "started");
        assert_eq!(saved["events"][1]["seq"], 1);
        assert_eq!(saved["events"][1]["type"], "phase_skipped");
        assert_eq!(saved["events"][1]["reason"], "source down");
    }
}
