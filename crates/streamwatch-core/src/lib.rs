//! Streamwatch Core - connection supervision, signal metering, and alert routing
//!
//! This library keeps many independent live media sources under watch:
//! each source gets a connection controller that classifies its health and
//! retries with exponential backoff, a stereo signal meter that keeps
//! measuring even when output is muted, and a shared alert router that
//! turns health transitions into an alert log plus audible/email
//! notifications.

pub mod alerts;
pub mod config;
pub mod media;
pub mod meter;
pub mod monitor;
pub mod supervisor;

pub use alerts::log::{AlertEntry, AlertKind, AlertLog};
pub use alerts::router::{AlertRouter, AlertSettings, AlertUpdate};
pub use config::{ConfigError, ConfigStore, Configuration, JsonFileStore, MonitorSettings};
pub use media::{AudioBlock, MediaHandle};
pub use meter::{LevelSample, MeterError, MeterReader, OutputKind, SignalMeter};
pub use monitor::backoff::RetryPolicy;
pub use monitor::engine::{EngineError, EngineEvent, EngineEvents, ErrorDetail, PlaybackEngine};
pub use monitor::probe::{HttpProbeEngine, ProbeSettings};
pub use monitor::state::{ConnectionState, Source, SourceStatus, TransitionEvent};
pub use supervisor::{GlobalSignals, SourceSnapshot, Supervisor, SupervisorError};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date stamped by build.rs
pub const BUILD_DATE: &str = env!("BUILD_DATE");
