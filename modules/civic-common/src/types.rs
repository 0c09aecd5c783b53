use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// --- Jurisdictions ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JurisdictionLevel {
    Federal,
    Provincial,
    Municipal,
}

impl JurisdictionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Federal => "federal",
            Self::Provincial => "provincial",
            Self::Municipal => "municipal",
        }
    }
}

impl fmt::Display for JurisdictionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A governmental unit of data collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Jurisdiction {
    /// Stable slug, e.g. `ca_on_toronto`.
    pub id: String,
    pub name: String,
    pub level: JurisdictionLevel,
    /// OCD-style division identifier, e.g. `ocd-division/country:ca/csd:3520005`.
    pub division_code: String,
}

// --- Cadence ---

/// Scheduling-frequency class for a jurisdiction's scraper.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    Daily,
    Weekly,
    /// Fires on the first day of the calendar month only.
    Monthly,
    Continuous,
    OneTime,
}

impl Cadence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
            Self::Continuous => "continuous",
            Self::OneTime => "one_time",
        }
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Cadence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            "monthly" => Ok(Self::Monthly),
            "continuous" => Ok(Self::Continuous),
            "one_time" | "onetime" | "one-time" => Ok(Self::OneTime),
            other => Err(format!("unknown cadence: {other}")),
        }
    }
}

/// Resolved scraper for one jurisdiction. Immutable once the registry is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ScraperDescriptor {
    pub jurisdiction_id: String,
    pub scraper_identifier: String,
    pub tier: JurisdictionLevel,
    pub cadence: Cadence,
}

// --- Strategy ---

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Conservative,
    Balanced,
    Aggressive,
}

/// How much post-phase checking a strategy performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ValidationLevel {
    None,
    Standard,
    /// Standard checks plus an extra pass that rejects empty scrapes.
    Extended,
}

impl Strategy {
    pub const ALL: [Strategy; 3] = [Self::Conservative, Self::Balanced, Self::Aggressive];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conservative => "conservative",
            Self::Balanced => "balanced",
            Self::Aggressive => "aggressive",
        }
    }

    pub fn duration_multiplier(&self) -> f64 {
        match self {
            Self::Conservative => 1.5,
            Self::Balanced => 1.0,
            Self::Aggressive => 0.7,
        }
    }

    pub fn validation_level(&self) -> ValidationLevel {
        match self {
            Self::Conservative => ValidationLevel::Extended,
            Self::Balanced => ValidationLevel::Standard,
            Self::Aggressive => ValidationLevel::None,
        }
    }

    /// Minimum fraction of jurisdictions that must scrape successfully for a phase to pass.
    pub fn default_success_threshold(&self) -> f64 {
        match self {
            Self::Conservative => 0.90,
            Self::Balanced => 0.75,
            Self::Aggressive => 0.50,
        }
    }

    pub fn default_parallelism(&self) -> usize {
        match self {
            Self::Conservative => 2,
            Self::Balanced => 4,
            Self::Aggressive => 8,
        }
    }

    /// Scale a base estimate (minutes) by this strategy's multiplier.
    pub fn scale_minutes(&self, minutes: u32) -> f64 {
        minutes as f64 * self.duration_multiplier()
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "conservative" => Ok(Self::Conservative),
            "balanced" => Ok(Self::Balanced),
            "aggressive" => Ok(Self::Aggressive),
            other => Err(format!("unknown strategy: {other}")),
        }
    }
}

// --- Executions ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Scheduled,
    Running,
    Completed,
    Failed,
    /// Forcibly terminated (cancel or crash recovery).
    Stopped,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }

    /// Scheduled -> Running -> {Completed, Failed, Stopped}. Nothing else.
    pub fn can_transition(&self, to: ExecutionStatus) -> bool {
        matches!(
            (self, to),
            (Self::Scheduled, Self::Running)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
                | (Self::Running, Self::Stopped)
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// One row per run attempt. Append-only history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ScraperExecution {
    pub id: Uuid,
    pub session_id: Option<Uuid>,
    pub phase_key: Option<String>,
    pub scraper_id: String,
    pub jurisdiction_id: String,
    pub status: ExecutionStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Last liveness mark from the owning runner while Running.
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub records_collected: u64,
    pub records_created: u64,
    pub records_updated: u64,
    pub error_count: u32,
    pub last_error: Option<String>,
}

impl ScraperExecution {
    pub fn scheduled(
        descriptor: &ScraperDescriptor,
        session_id: Option<Uuid>,
        phase_key: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            phase_key,
            scraper_id: descriptor.scraper_identifier.clone(),
            jurisdiction_id: descriptor.jurisdiction_id.clone(),
            status: ExecutionStatus::Scheduled,
            start_time: None,
            end_time: None,
            heartbeat_at: None,
            records_collected: 0,
            records_created: 0,
            records_updated: 0,
            error_count: 0,
            last_error: None,
        }
    }
}

/// Final accounting for a run, applied when a Running row reaches a terminal state.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub finished_at: DateTime<Utc>,
    pub records_collected: u64,
    pub records_created: u64,
    pub records_updated: u64,
    pub error_count: u32,
    pub last_error: Option<String>,
}

impl ExecutionOutcome {
    pub fn stopped(finished_at: DateTime<Utc>, reason: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Stopped,
            finished_at,
            records_collected: 0,
            records_created: 0,
            records_updated: 0,
            error_count: 1,
            last_error: Some(reason.into()),
        }
    }
}

// --- Records ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Bill,
    Representative,
    Vote,
    Committee,
    Event,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bill => "bill",
            Self::Representative => "representative",
            Self::Vote => "vote",
            Self::Committee => "committee",
            Self::Event => "event",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque record produced by a scraper. Stored keyed by (jurisdiction, entity type, natural key).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub entity_type: EntityType,
    pub natural_key: String,
    pub fields: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created,
    Updated,
    /// Stored fields already matched; only the last-seen timestamp moved.
    Unchanged,
}
