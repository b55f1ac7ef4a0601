//! FFT analyser node for one audio channel
//!
//! Mirrors the behaviour of a browser `AnalyserNode`: the most recent
//! `fft_size` samples are Blackman-windowed and transformed, bin
//! magnitudes are smoothed over time with a fixed time constant, converted
//! to decibels, and mapped onto unsigned bytes between
//! [`MIN_DECIBELS`] and [`MAX_DECIBELS`].

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;

/// Default transform size (128 frequency bins)
pub const DEFAULT_FFT_SIZE: usize = 256;

/// Default smoothing time constant applied between analyses
pub const DEFAULT_SMOOTHING: f32 = 0.7;

/// Magnitude mapped to byte 0
pub const MIN_DECIBELS: f32 = -100.0;

/// Magnitude mapped to byte 255
pub const MAX_DECIBELS: f32 = -30.0;

/// Single-channel frequency analyser
pub struct Analyser {
    fft_size: usize,
    smoothing: f32,
    window: Vec<f32>,
    /// Circular buffer of the most recent time-domain samples
    history: Vec<f32>,
    write_pos: usize,
    smoothed: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
    buffer: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
}

impl std::fmt::Debug for Analyser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Analyser")
            .field("fft_size", &self.fft_size)
            .field("smoothing", &self.smoothing)
            .finish()
    }
}

impl Analyser {
    /// Create an analyser
    ///
    /// # Arguments
    /// * `fft_size` - Transform size, rounded up to a power of two in 32..=32768
    /// * `smoothing` - Time constant in [0, 1); 0 disables smoothing
    pub fn new(fft_size: usize, smoothing: f32) -> Self {
        let fft_size = fft_size.next_power_of_two().clamp(32, 32768);
        let smoothing = if smoothing.is_finite() {
            smoothing.clamp(0.0, 0.999)
        } else {
            DEFAULT_SMOOTHING
        };

        let fft = FftPlanner::<f32>::new().plan_fft_forward(fft_size);
        let scratch_len = fft.get_inplace_scratch_len();

        Self {
            fft_size,
            smoothing,
            window: blackman_window(fft_size),
            history: vec![0.0; fft_size],
            write_pos: 0,
            smoothed: vec![0.0; fft_size / 2],
            fft,
            buffer: vec![Complex::new(0.0, 0.0); fft_size],
            scratch: vec![Complex::new(0.0, 0.0); scratch_len],
        }
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Number of frequency bins (half the transform size)
    pub fn frequency_bin_count(&self) -> usize {
        self.fft_size / 2
    }

    /// Append time-domain samples, keeping only the latest `fft_size`
    pub fn push_samples<I>(&mut self, samples: I)
    where
        I: IntoIterator<Item = f32>,
    {
        for sample in samples {
            self.history[self.write_pos] = if sample.is_finite() { sample } else { 0.0 };
            self.write_pos = (self.write_pos + 1) % self.fft_size;
        }
    }

    /// Analyse the current window and write byte-scaled magnitudes
    ///
    /// Writes `min(out.len(), frequency_bin_count())` bins. Each call
    /// advances the smoothing state once.
    pub fn byte_frequency_data(&mut self, out: &mut [u8]) {
        // Oldest sample first
        for i in 0..self.fft_size {
            let sample = self.history[(self.write_pos + i) % self.fft_size];
            self.buffer[i] = Complex::new(sample * self.window[i], 0.0);
        }
        self.fft
            .process_with_scratch(&mut self.buffer, &mut self.scratch);

        let norm = 1.0 / self.fft_size as f32;
        let tau = self.smoothing;
        let range = MAX_DECIBELS - MIN_DECIBELS;

        for (k, smoothed) in self.smoothed.iter_mut().enumerate() {
            let magnitude = self.buffer[k].norm() * norm;
            *smoothed = tau * *smoothed + (1.0 - tau) * magnitude;
            if k < out.len() {
                out[k] = decibels_to_byte(linear_to_decibels(*smoothed), range);
            }
        }
    }

    /// Clear history and smoothing state
    pub fn reset(&mut self) {
        self.history.fill(0.0);
        self.smoothed.fill(0.0);
        self.write_pos = 0;
    }
}

fn blackman_window(n: usize) -> Vec<f32> {
    let alpha = 0.16f32;
    let a0 = 0.5 * (1.0 - alpha);
    let a1 = 0.5;
    let a2 = 0.5 * alpha;
    let two_pi = 2.0 * std::f32::consts::PI;
    (0..n)
        .map(|i| {
            let x = i as f32 / n as f32;
            a0 - a1 * (two_pi * x).cos() + a2 * (2.0 * two_pi * x).cos()
        })
        .collect()
}

fn linear_to_decibels(value: f32) -> f32 {
    if value <= 0.0 {
        f32::NEG_INFINITY
    } else {
        20.0 * value.log10()
    }
}

fn decibels_to_byte(db: f32, range: f32) -> u8 {
    if !db.is_finite() {
        return 0;
    }
    let scaled = (255.0 / range) * (db - MIN_DECIBELS);
    scaled.floor().clamp(0.0, 255.0) as u8
}

/// Root-mean-square of byte magnitudes, normalized to [0, 1]
pub fn rms_level(bins: &[u8]) -> f32 {
    if bins.is_empty() {
        return 0.0;
    }
    let sum: f32 = bins.iter().map(|&b| (b as f32) * (b as f32)).sum();
    ((sum / bins.len() as f32).sqrt() / u8::MAX as f32).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, sample_rate: f32, amplitude: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| amplitude * (2.0 * std::f32::consts::PI * freq * i as f32 / sample_rate).sin())
            .collect()
    }

    #[test]
    fn test_bin_count() {
        let analyser = Analyser::new(DEFAULT_FFT_SIZE, DEFAULT_SMOOTHING);
        assert_eq!(analyser.fft_size(), 256);
        assert_eq!(analyser.frequency_bin_count(), 128);
    }

    #[test]
    fn test_fft_size_rounded_to_power_of_two() {
        assert_eq!(Analyser::new(200, 0.7).fft_size(), 256);
        assert_eq!(Analyser::new(1, 0.7).fft_size(), 32);
    }

    #[test]
    fn test_silence_is_zero() {
        let mut analyser = Analyser::new(256, 0.7);
        analyser.push_samples(vec![0.0; 512]);
        let mut bins = vec![0u8; 128];
        analyser.byte_frequency_data(&mut bins);
        assert!(bins.iter().all(|&b| b == 0));
        assert_eq!(rms_level(&bins), 0.0);
    }

    #[test]
    fn test_sine_peaks_at_its_bin() {
        let sample_rate = 48000.0;
        // Bin 16 of a 256-point transform
        let freq = 16.0 * sample_rate / 256.0;
        let mut analyser = Analyser::new(256, 0.0);
        analyser.push_samples(sine(freq, sample_rate, 0.8, 256));

        let mut bins = vec![0u8; 128];
        analyser.byte_frequency_data(&mut bins);

        let (peak_bin, &peak) = bins.iter().enumerate().max_by_key(|(_, &b)| b).unwrap();
        assert_eq!(peak_bin, 16);
        assert_eq!(peak, 255);
        assert!(bins[100] < peak, "far bins should be well below the peak");
    }

    #[test]
    fn test_smoothing_rises_gradually() {
        let sample_rate = 48000.0;
        let freq = 16.0 * sample_rate / 256.0;
        let tone = sine(freq, sample_rate, 0.01, 256);

        let mut smoothed = Analyser::new(256, 0.7);
        let mut raw = Analyser::new(256, 0.0);
        smoothed.push_samples(tone.iter().copied());
        raw.push_samples(tone.iter().copied());

        let mut smoothed_bins = vec![0u8; 128];
        let mut raw_bins = vec![0u8; 128];
        smoothed.byte_frequency_data(&mut smoothed_bins);
        raw.byte_frequency_data(&mut raw_bins);

        assert!(smoothed_bins[16] < raw_bins[16]);

        // Repeated analyses of the same window converge towards the raw value
        for _ in 0..50 {
            smoothed.byte_frequency_data(&mut smoothed_bins);
        }
        assert!((smoothed_bins[16] as i32 - raw_bins[16] as i32).abs() <= 1);
    }

    #[test]
    fn test_reset_clears_state() {
        let mut analyser = Analyser::new(256, 0.7);
        analyser.push_samples(sine(1000.0, 48000.0, 0.5, 256));
        let mut bins = vec![0u8; 128];
        analyser.byte_frequency_data(&mut bins);
        assert!(rms_level(&bins) > 0.0);

        analyser.reset();
        analyser.byte_frequency_data(&mut bins);
        assert_eq!(rms_level(&bins), 0.0);
    }

    #[test]
    fn test_rms_level_bounds() {
        assert_eq!(rms_level(&[]), 0.0);
        assert_eq!(rms_level(&[255; 128]), 1.0);
        let half = rms_level(&[128; 64]);
        assert!((half - 128.0 / 255.0).abs() < 1e-6);
    }

    #[test]
    fn test_non_finite_samples_ignored() {
        let mut analyser = Analyser::new(256, 0.0);
        analyser.push_samples(vec![f32::NAN, f32::INFINITY, 0.0]);
        let mut bins = vec![0u8; 128];
        analyser.byte_frequency_data(&mut bins);
        assert_eq!(rms_level(&bins), 0.0);
    }
}
