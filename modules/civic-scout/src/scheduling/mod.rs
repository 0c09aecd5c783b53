pub mod cadence;
pub mod scheduler;

pub use cadence::is_due;
pub use scheduler::{BatchOptions, BatchReport, JurisdictionScheduler};
