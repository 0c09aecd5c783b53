use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Config-time failures resolving a jurisdiction to a scraper. Fatal to that jurisdiction only.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no scraper matches jurisdiction {jurisdiction}")]
    ScraperNotFound { jurisdiction: String },

    #[error("jurisdiction {jurisdiction} matches {} scrapers: {}", candidates.len(), candidates.join(", "))]
    AmbiguousScraper {
        jurisdiction: String,
        candidates: Vec<String>,
    },

    #[error("invalid scraper {scraper}: {reason}")]
    InvalidScraper { scraper: String, reason: String },
}

/// Runtime failures of a single scraper run. Recorded as data, never propagated to siblings.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScraperError {
    #[error("{}", timeout_message(*secs))]
    Timeout { secs: u64 },

    #[error("scraper failed: {0}")]
    Runtime(String),

    #[error("failed to spawn scraper process: {0}")]
    Spawn(String),

    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl ScraperError {
    /// Deadline expiry. Sub-second remainders round up so a short limit never reads as zero.
    pub fn timeout(limit: Duration) -> Self {
        let secs = limit.as_secs() + u64::from(limit.subsec_nanos() > 0);
        Self::Timeout { secs }
    }
}

/// Human-readable deadline message. Whole minutes read as minutes.
pub fn timeout_message(secs: u64) -> String {
    if secs >= 60 && secs % 60 == 0 {
        let minutes = secs / 60;
        if minutes == 1 {
            "Timeout after 1 minute".to_string()
        } else {
            format!("Timeout after {minutes} minutes")
        }
    } else if secs == 1 {
        "Timeout after 1 second".to_string()
    } else {
        format!("Timeout after {secs} seconds")
    }
}

/// Control-plane misuse. Rejected synchronously with no state change.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("a loading session is already active: {session_id}")]
    SessionAlreadyActive { session_id: Uuid },

    #[error("cannot {operation} while session is {from}")]
    InvalidTransition {
        operation: &'static str,
        from: String,
    },

    #[error("no active loading session")]
    NoActiveSession,

    #[error("manual controls are disabled for this session")]
    ManualControlsDisabled,

    #[error("phase {phase} cannot start: unmet dependencies {}", missing.join(", "))]
    PhaseDependencyUnmet { phase: String, missing: Vec<String> },

    #[error("phase {phase} is currently executing")]
    PhaseInFlight { phase: String },

    #[error("phase {phase} failed; skip, retry or cancel to continue")]
    PhaseFailed { phase: String },

    #[error("unknown phase: {0}")]
    UnknownPhase(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid phase plan: {0}")]
    PhasePlan(String),

    #[error("invalid cadence for {jurisdiction}: {value}")]
    Cadence { jurisdiction: String, value: String },

    #[error("invalid value for {key}: {value}")]
    Env { key: &'static str, value: String },

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}
