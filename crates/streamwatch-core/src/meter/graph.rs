//! Per-handle audio graph
//!
//! ```text
//!            +--> splitter --> analyser L --+
//! source tap |             \-> analyser R --+--> levels (atomics)
//!            +--> gain --> output sink
//! ```
//!
//! The analysis branch and the audible branch are fed independently from
//! the tap, so the gain stage never affects measured levels.

use crate::media::AudioBlock;
use crate::meter::analyser::{rms_level, Analyser};
use crate::meter::gain::GainStage;
use crate::meter::output::OutputSink;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// Values shared between the audio tap and meter readers
#[derive(Debug)]
pub struct MeterShared {
    left: AtomicU32,
    right: AtomicU32,
    target_gain: AtomicU32,
    connected: AtomicBool,
}

impl MeterShared {
    pub fn new(initial_gain: f32) -> Self {
        Self {
            left: AtomicU32::new(0.0f32.to_bits()),
            right: AtomicU32::new(0.0f32.to_bits()),
            target_gain: AtomicU32::new(initial_gain.to_bits()),
            connected: AtomicBool::new(false),
        }
    }

    pub fn levels(&self) -> (f32, f32) {
        (
            f32::from_bits(self.left.load(Ordering::Relaxed)),
            f32::from_bits(self.right.load(Ordering::Relaxed)),
        )
    }

    pub(crate) fn publish_levels(&self, left: f32, right: f32) {
        self.left.store(left.to_bits(), Ordering::Relaxed);
        self.right.store(right.to_bits(), Ordering::Relaxed);
    }

    pub fn target_gain(&self) -> f32 {
        f32::from_bits(self.target_gain.load(Ordering::Relaxed))
    }

    pub(crate) fn set_target_gain(&self, gain: f32) {
        self.target_gain.store(gain.to_bits(), Ordering::Relaxed);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }
}

/// The processing graph installed on a media handle
pub struct AudioTap {
    shared: std::sync::Arc<MeterShared>,
    left: Analyser,
    right: Analyser,
    gain: GainStage,
    output: Box<dyn OutputSink>,
    /// Stereo scratch for the audible branch
    out_buf: Vec<f32>,
    bins: Vec<u8>,
}

impl std::fmt::Debug for AudioTap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioTap")
            .field("left", &self.left)
            .field("right", &self.right)
            .field("gain", &self.gain)
            .finish()
    }
}

impl AudioTap {
    pub fn new(
        shared: std::sync::Arc<MeterShared>,
        fft_size: usize,
        smoothing: f32,
        output: Box<dyn OutputSink>,
    ) -> Self {
        let left = Analyser::new(fft_size, smoothing);
        let right = Analyser::new(fft_size, smoothing);
        let bins = vec![0u8; left.frequency_bin_count()];
        let gain = GainStage::new(shared.target_gain(), 48000);
        Self {
            shared,
            left,
            right,
            gain,
            output,
            out_buf: Vec::new(),
            bins,
        }
    }

    /// Run one block through both branches and publish fresh levels
    pub fn process(&mut self, block: AudioBlock<'_>) {
        let channels = block.channels.max(1) as usize;
        let frames = block.frames();
        if frames == 0 {
            return;
        }
        let interleaved = &block.samples[..frames * channels];

        // Splitter: mono feeds both sides
        let right_index = if channels > 1 { 1 } else { 0 };
        self.left
            .push_samples(interleaved.iter().step_by(channels).copied());
        self.right.push_samples(
            interleaved
                .iter()
                .skip(right_index)
                .step_by(channels)
                .copied(),
        );

        self.left.byte_frequency_data(&mut self.bins);
        let left_level = rms_level(&self.bins);
        self.right.byte_frequency_data(&mut self.bins);
        let right_level = rms_level(&self.bins);
        self.shared.publish_levels(left_level, right_level);

        // Audible branch
        self.out_buf.clear();
        self.out_buf.reserve(frames * 2);
        for frame in interleaved.chunks(channels) {
            self.out_buf.push(frame[0]);
            self.out_buf.push(frame[right_index]);
        }
        self.gain.set_sample_rate(block.sample_rate);
        self.gain.set_target(self.shared.target_gain());
        self.gain.apply(&mut self.out_buf, 2);
        self.output.write(&self.out_buf, block.sample_rate);
    }

    /// Current (ramping) gain of the audible branch
    pub fn current_gain(&self) -> f32 {
        self.gain.current()
    }

    /// Stop the output sink and clear analysis state
    pub fn shutdown(mut self) {
        self.output.stop();
        self.left.reset();
        self.right.reset();
        self.shared.publish_levels(0.0, 0.0);
    }
}
