//! Playback engine boundary
//!
//! The engine fetches and decodes the stream; the controller only observes
//! its lifecycle events. Events are delivered through [`EngineEvents`], a
//! sink stamped with the attach epoch so that late events from a previous
//! attachment can be recognised and discarded.

use crate::media::MediaHandle;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Error detail codes reported by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorDetail {
    ManifestLoadError,
    ManifestLoadTimeout,
    ManifestParsingError,
    LevelLoadError,
    LevelLoadTimeout,
    FragLoadError,
    FragLoadTimeout,
    BufferStalledError,
    BufferAppendError,
    KeyLoadError,
    InternalException,
    Other(String),
}

impl ErrorDetail {
    /// Details that need a full re-attach even when not marked fatal
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            Self::ManifestLoadError
                | Self::ManifestParsingError
                | Self::LevelLoadError
                | Self::InternalException
        )
    }
}

impl std::fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Other(code) => write!(f, "{}", code),
            other => write!(f, "{:?}", other),
        }
    }
}

/// Lifecycle events observed from the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Media is playing
    Playing,
    /// Playback paused to buffer; the engine may resume by itself
    Waiting,
    /// Data stopped arriving
    Stalled,
    Error { detail: ErrorDetail, fatal: bool },
    /// Enough data to start; the controller attempts autoplay
    CanPlay,
}

/// Errors returned by engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Autoplay was blocked by platform policy")]
    AutoplayBlocked,

    #[error("Unsupported stream URL: {0}")]
    UnsupportedUrl(String),

    #[error("Media handle {0} is not attached")]
    NotAttached(u64),

    #[error("Engine error: {0}")]
    Internal(String),
}

/// An engine event tagged with the attachment it belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StampedEvent {
    pub epoch: u64,
    pub event: EngineEvent,
}

/// Event sink handed to the engine on attach
#[derive(Debug, Clone)]
pub struct EngineEvents {
    epoch: u64,
    tx: mpsc::UnboundedSender<StampedEvent>,
}

impl EngineEvents {
    pub fn new(epoch: u64, tx: mpsc::UnboundedSender<StampedEvent>) -> Self {
        Self { epoch, tx }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Deliver an event. Returns false once the controller is gone.
    pub fn emit(&self, event: EngineEvent) -> bool {
        self.tx
            .send(StampedEvent {
                epoch: self.epoch,
                event,
            })
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// External stream playback engine
///
/// Implementations must tolerate `detach` on a handle that is not attached
/// and must stop emitting through an attachment's [`EngineEvents`] once it
/// has been detached.
pub trait PlaybackEngine: Send + Sync {
    /// Start loading `url` onto `handle`, reporting through `events`
    fn attach(
        &self,
        url: &str,
        handle: &Arc<MediaHandle>,
        events: EngineEvents,
    ) -> Result<(), EngineError>;

    /// Stop loading and release everything tied to `handle`
    fn detach(&self, handle: &MediaHandle) -> Result<(), EngineError>;

    /// Attempt to start playback after `CanPlay`
    fn play(&self, handle: &MediaHandle) -> Result<(), EngineError>;
}
