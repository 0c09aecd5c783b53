//! Phased loading of Canadian civic data.
//!
//! A single loading session walks an ordered phase plan (federal, then
//! provincial, then municipal), running every jurisdiction's scraper in a
//! phase and gating progression on a strategy-specific success threshold.

pub mod app;
pub mod phases;
pub mod run_log;
pub mod sequencer;
pub mod session;
pub mod status;

pub use app::App;
pub use phases::{PhasePlan, PhasePreview};
pub use sequencer::{PhaseOutcome, PhaseSequencer, SequencerSettings};
pub use session::{ControlCommand, ControlResponse, DriveOutcome, SessionController};
pub use status::{PhaseProgress, ProgressSnapshot, StatusReporter};
