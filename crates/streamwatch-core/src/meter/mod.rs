//! Stereo signal metering
//!
//! This module contains:
//! - FFT analyser nodes with Web-Audio-compatible byte output ([`analyser`])
//! - Click-free gain smoothing ([`gain`])
//! - The per-handle processing graph ([`graph`])
//! - Output sinks for the audible branch ([`output`])
//!
//! A [`SignalMeter`] installs one graph on a [`MediaHandle`] and publishes
//! left/right levels through atomics. Readers poll at any rate and always
//! see the latest value.

pub mod analyser;
pub mod gain;
pub mod graph;
pub mod output;

use crate::media::{HandleId, MediaHandle};
use graph::{AudioTap, MeterShared};
use output::{DeviceOutput, NullOutput, OutputSink};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Errors from meter graph management
#[derive(Error, Debug)]
pub enum MeterError {
    #[error("An audio graph is already attached to media handle {handle}")]
    AlreadyAttached { handle: HandleId },

    #[error("Output device error: {0}")]
    Output(String),
}

/// One pair of channel levels in [0, 1]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LevelSample {
    pub left: f32,
    pub right: f32,
}

/// Where the audible branch goes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// Discard audio
    #[default]
    Null,
    /// Default output device
    Device,
}

/// Meter construction parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeterSettings {
    pub fft_size: usize,
    pub smoothing: f32,
    pub output: OutputKind,
}

impl Default for MeterSettings {
    fn default() -> Self {
        Self {
            fft_size: analyser::DEFAULT_FFT_SIZE,
            smoothing: analyser::DEFAULT_SMOOTHING,
            output: OutputKind::Null,
        }
    }
}

/// Cloneable read side of a meter
#[derive(Debug, Clone)]
pub struct MeterReader {
    shared: Arc<MeterShared>,
}

impl MeterReader {
    /// Latest computed levels
    pub fn levels(&self) -> LevelSample {
        let (left, right) = self.shared.levels();
        LevelSample { left, right }
    }

    /// Whether a graph is currently attached
    pub fn is_connected(&self) -> bool {
        self.shared.is_connected()
    }
}

/// Owner of at most one attached audio graph
#[derive(Debug)]
pub struct SignalMeter {
    shared: Arc<MeterShared>,
    handle: Option<Arc<MediaHandle>>,
    settings: MeterSettings,
}

impl SignalMeter {
    /// Create a detached meter with the given effective gain
    pub fn new(settings: MeterSettings, muted: bool, volume: f32) -> Self {
        let shared = Arc::new(MeterShared::new(effective_gain(muted, volume)));
        Self {
            shared,
            handle: None,
            settings,
        }
    }

    /// Build the graph on `handle`
    ///
    /// Fails with [`MeterError::AlreadyAttached`] if this meter already
    /// owns a graph or the handle already carries one.
    pub fn attach(&mut self, handle: &Arc<MediaHandle>) -> Result<(), MeterError> {
        if let Some(current) = &self.handle {
            return Err(MeterError::AlreadyAttached {
                handle: current.id(),
            });
        }
        let sink: Box<dyn OutputSink> = match self.settings.output {
            OutputKind::Null => Box::new(NullOutput),
            OutputKind::Device => match DeviceOutput::open() {
                Ok(device) => Box::new(device),
                Err(e) => {
                    tracing::warn!(
                        handle = handle.label(),
                        "Meter output unavailable, metering without playback: {}",
                        e
                    );
                    Box::new(NullOutput)
                }
            },
        };
        let tap = AudioTap::new(
            Arc::clone(&self.shared),
            self.settings.fft_size,
            self.settings.smoothing,
            sink,
        );
        handle.install_tap(tap)?;
        self.shared.set_connected(true);
        self.handle = Some(Arc::clone(handle));
        tracing::debug!(handle = handle.label(), "Meter attached");
        Ok(())
    }

    /// Tear the graph down. Safe to call when detached.
    pub fn detach(&mut self) {
        self.shared.set_connected(false);
        if let Some(handle) = self.handle.take() {
            if let Some(tap) = handle.remove_tap() {
                tap.shutdown();
            }
            tracing::debug!(handle = handle.label(), "Meter detached");
        }
        self.shared.publish_levels(0.0, 0.0);
    }

    pub fn is_attached(&self) -> bool {
        self.handle.is_some()
    }

    /// Set output gain: 0 when muted, else `volume` clamped to [0, 1]
    pub fn set_volume(&self, muted: bool, volume: f32) {
        self.shared.set_target_gain(effective_gain(muted, volume));
    }

    /// Gain the audible branch is ramping towards
    pub fn target_gain(&self) -> f32 {
        self.shared.target_gain()
    }

    pub fn reader(&self) -> MeterReader {
        MeterReader {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn levels(&self) -> LevelSample {
        self.reader().levels()
    }
}

impl Drop for SignalMeter {
    fn drop(&mut self) {
        self.detach();
    }
}

fn effective_gain(muted: bool, volume: f32) -> f32 {
    if muted || !volume.is_finite() {
        0.0
    } else {
        volume.clamp(0.0, 1.0)
    }
}
