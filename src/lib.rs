//! Streamwatch - live media source supervisor
//!
//! This library re-exports the connection supervision, signal metering and
//! alert routing from `streamwatch-core`, and the reporting server from
//! `streamwatch-server`.

pub use streamwatch_core::{alerts, config, media, meter, monitor, supervisor};

pub use streamwatch_core::{
    AlertEntry, AlertKind, AlertLog, AlertRouter, AlertSettings, ConfigStore, Configuration,
    ConnectionState, JsonFileStore, LevelSample, MonitorSettings, PlaybackEngine, RetryPolicy,
    Source, SourceStatus, Supervisor, SupervisorError, VERSION,
};

pub use streamwatch_server as server;
