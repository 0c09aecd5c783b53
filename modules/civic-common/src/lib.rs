pub mod clock;
pub mod config;
pub mod error;
pub mod file_config;
pub mod phase;
pub mod session;
pub mod types;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::Config;
pub use error::{ConfigError, ControlError, RegistryError, ScraperError};
pub use file_config::{load_config, FileConfig};
pub use phase::{LoadingPhase, PhaseState};
pub use session::{LoadingSession, SessionStatus};
pub use types::*;
