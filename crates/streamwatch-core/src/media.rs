//! Media handles shared between the playback engine and the signal meter
//!
//! A [`MediaHandle`] stands for one source's playback surface. The engine
//! attaches streams to it and pushes decoded PCM through
//! [`MediaHandle::feed_audio`]; the signal meter installs its audio tap on
//! it exactly once per handle lifetime.

use crate::meter::graph::AudioTap;
use crate::meter::MeterError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Process-unique handle identifier
pub type HandleId = u64;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// A block of decoded, interleaved PCM samples
#[derive(Debug, Clone, Copy)]
pub struct AudioBlock<'a> {
    /// Interleaved samples in [-1.0, 1.0]
    pub samples: &'a [f32],
    /// Channel count of the interleaving
    pub channels: u16,
    /// Sample rate in Hz
    pub sample_rate: u32,
}

impl<'a> AudioBlock<'a> {
    pub fn new(samples: &'a [f32], channels: u16, sample_rate: u32) -> Self {
        Self {
            samples,
            channels,
            sample_rate,
        }
    }

    /// Number of complete frames in the block
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }
}

/// Playback surface for one source
pub struct MediaHandle {
    id: HandleId,
    label: String,
    tap: Mutex<Option<AudioTap>>,
}

impl std::fmt::Debug for MediaHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaHandle")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("has_tap", &self.has_tap())
            .finish()
    }
}

impl MediaHandle {
    /// Create a new handle with a fresh identifier
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            label: label.into(),
            tap: Mutex::new(None),
        })
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether an audio tap is installed
    pub fn has_tap(&self) -> bool {
        self.tap
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    /// Feed decoded audio into the installed tap, if any
    ///
    /// Never blocks: a block arriving while the tap is being installed or
    /// removed is dropped.
    pub fn feed_audio(&self, block: AudioBlock<'_>) {
        if block.samples.is_empty() || block.channels == 0 {
            return;
        }
        if let Ok(mut guard) = self.tap.try_lock() {
            if let Some(tap) = guard.as_mut() {
                tap.process(block);
            }
        }
    }

    pub(crate) fn install_tap(&self, tap: AudioTap) -> Result<(), MeterError> {
        let mut guard = self.tap.lock().unwrap_or_else(|e| e.into_inner());
        if guard.is_some() {
            return Err(MeterError::AlreadyAttached { handle: self.id });
        }
        *guard = Some(tap);
        Ok(())
    }

    pub(crate) fn remove_tap(&self) -> Option<AudioTap> {
        self.tap.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}
