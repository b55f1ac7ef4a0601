//! Per-source connection supervision
//!
//! This module contains:
//! - Source identity and connection status types ([`state`])
//! - Retry delay policy and cancellable retry timers ([`backoff`])
//! - The playback engine boundary ([`engine`])
//! - The per-source connection state machine ([`controller`])
//! - A headless HLS playlist probe engine ([`probe`])

pub mod backoff;
pub mod controller;
pub mod engine;
pub mod probe;
pub mod state;

pub use controller::{ControllerCommand, ControllerConfig, ControllerHandle};
pub use state::{AlertRequest, TransitionEvent};
