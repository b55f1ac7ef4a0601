//! Audible alert tone
//!
//! A short 880 Hz beep played on the default output device. The audio
//! context behind it is process-wide and built on first use. When a user
//! gesture is required the context starts suspended and plays nothing until
//! [`AlertSound::resume`] is called.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::HeapRb;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

/// Tone frequency in Hz
pub const TONE_FREQUENCY: f32 = 880.0;

/// Starting gain of the tone envelope
pub const TONE_GAIN: f32 = 0.3;

/// Gain the envelope decays to at the end of the tone
pub const TONE_FLOOR: f32 = 0.0001;

/// Tone length in seconds
pub const TONE_DURATION: f32 = 0.3;

/// Run state of the alert audio context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioContextState {
    /// Waiting for a user gesture, or still opening the device
    Suspended,
    Running,
    /// No usable output device
    Unavailable,
}

/// Something that can play the alert tone
pub trait AlertSound: Send + Sync {
    /// Play the tone. A no-op (logged) when the context is not running.
    fn play(&self);

    fn state(&self) -> AudioContextState;

    /// User-gesture hook: resume a suspended context
    fn resume(&self) -> AudioContextState;
}

/// Mono samples of one alert tone at `sample_rate`
///
/// Sine at [`TONE_FREQUENCY`] under an exponential envelope falling from
/// [`TONE_GAIN`] to [`TONE_FLOOR`] over [`TONE_DURATION`].
pub fn synthesize_tone(sample_rate: u32) -> Vec<f32> {
    let sr = sample_rate.max(1) as f32;
    let len = (TONE_DURATION * sr).round() as usize;
    let ratio = TONE_FLOOR / TONE_GAIN;
    (0..len)
        .map(|i| {
            let t = i as f32 / sr;
            let envelope = TONE_GAIN * ratio.powf(t / TONE_DURATION);
            envelope * (2.0 * std::f32::consts::PI * TONE_FREQUENCY * t).sin()
        })
        .collect()
}

/// Sound sink for headless runs; counts requested plays
#[derive(Debug, Default)]
pub struct SilentSound {
    plays: AtomicUsize,
}

impl SilentSound {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plays(&self) -> usize {
        self.plays.load(Ordering::Relaxed)
    }
}

impl AlertSound for SilentSound {
    fn play(&self) {
        self.plays.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Alert tone (silent)");
    }

    fn state(&self) -> AudioContextState {
        AudioContextState::Running
    }

    fn resume(&self) -> AudioContextState {
        AudioContextState::Running
    }
}

const DEVICE_PENDING: u8 = 0;
const DEVICE_READY: u8 = 1;
const DEVICE_FAILED: u8 = 2;

/// Ring buffer size in samples (several overlapping tones at 48kHz)
const TONE_RING_SIZE: usize = 65536;

/// State shared between the context handle and its audio thread
struct ToneShared {
    device: AtomicU8,
    resumed: AtomicBool,
}

impl ToneShared {
    fn state(&self) -> AudioContextState {
        match self.device.load(Ordering::Acquire) {
            DEVICE_FAILED => AudioContextState::Unavailable,
            DEVICE_READY if self.resumed.load(Ordering::Acquire) => AudioContextState::Running,
            _ => AudioContextState::Suspended,
        }
    }

    fn fail(&self, reason: &str) {
        tracing::warn!("Alert tone unavailable: {}", reason);
        self.device.store(DEVICE_FAILED, Ordering::Release);
    }
}

struct ToneContext {
    shared: Arc<ToneShared>,
    play_tx: crossbeam_channel::Sender<()>,
}

static TONE_CONTEXT: OnceLock<ToneContext> = OnceLock::new();

impl ToneContext {
    fn spawn(require_gesture: bool) -> Self {
        let (play_tx, play_rx) = crossbeam_channel::bounded::<()>(8);
        let shared = Arc::new(ToneShared {
            device: AtomicU8::new(DEVICE_PENDING),
            resumed: AtomicBool::new(!require_gesture),
        });

        let thread_shared = Arc::clone(&shared);
        let spawned = std::thread::Builder::new()
            .name("alert-tone".into())
            .spawn(move || run_tone_thread(&thread_shared, play_rx));
        if let Err(e) = spawned {
            shared.fail(&format!("tone thread could not start: {}", e));
        }
        Self { shared, play_tx }
    }

    fn state(&self) -> AudioContextState {
        self.shared.state()
    }
}

fn run_tone_thread(shared: &ToneShared, play_rx: crossbeam_channel::Receiver<()>) {
    let host = cpal::default_host();
    let opened = host
        .default_output_device()
        .ok_or_else(|| "no default output device".to_string())
        .and_then(|device| {
            let config = device.default_output_config().map_err(|e| e.to_string())?;
            Ok((device, config))
        });
    let (device, default_config) = match opened {
        Ok(v) => v,
        Err(msg) => return shared.fail(&msg),
    };

    let channels = default_config.channels().max(1) as usize;
    let rate = default_config.sample_rate().0;
    let config = StreamConfig {
        channels: channels as u16,
        sample_rate: SampleRate(rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let (mut producer, mut consumer) = HeapRb::<f32>::new(TONE_RING_SIZE).split();
    let stream = device.build_output_stream(
        &config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            for frame in data.chunks_mut(channels) {
                let sample = consumer.try_pop().unwrap_or(0.0);
                frame.fill(sample);
            }
        },
        move |err| {
            tracing::error!("Alert tone stream error: {}", err);
        },
        None,
    );
    let stream = match stream.map_err(|e| e.to_string()).and_then(|s| {
        s.play().map_err(|e| e.to_string())?;
        Ok(s)
    }) {
        Ok(s) => s,
        Err(msg) => return shared.fail(&msg),
    };

    shared.device.store(DEVICE_READY, Ordering::Release);
    tracing::info!("Alert tone ready at {} Hz", rate);

    let tone = synthesize_tone(rate);
    for () in play_rx.iter() {
        let pushed = producer.push_slice(&tone);
        if pushed < tone.len() {
            tracing::debug!("Alert tone truncated, output buffer full");
        }
    }
    drop(stream);
}

/// Alert tone on the system's default output device
#[derive(Debug, Clone, Copy)]
pub struct SystemTone {
    require_gesture: bool,
}

impl SystemTone {
    /// Handle to the process-wide tone context
    ///
    /// `require_gesture` only matters for the first handle used: it decides
    /// whether the shared context starts suspended.
    pub fn new(require_gesture: bool) -> Self {
        Self { require_gesture }
    }

    fn context(&self) -> &'static ToneContext {
        TONE_CONTEXT.get_or_init(|| ToneContext::spawn(self.require_gesture))
    }
}

impl AlertSound for SystemTone {
    fn play(&self) {
        let context = self.context();
        match context.state() {
            AudioContextState::Running => {
                if context.play_tx.try_send(()).is_err() {
                    tracing::debug!("Alert tone already queued");
                }
            }
            AudioContextState::Suspended if context.shared.resumed.load(Ordering::Acquire) => {
                // Device still opening; the thread drains the queue once ready
                let _ = context.play_tx.try_send(());
            }
            state => {
                tracing::warn!(?state, "Alert tone skipped, audio context not running");
            }
        }
    }

    fn state(&self) -> AudioContextState {
        self.context().state()
    }

    fn resume(&self) -> AudioContextState {
        let context = self.context();
        if !context.shared.resumed.swap(true, Ordering::AcqRel) {
            tracing::info!("Alert audio context resumed");
        }
        context.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_tone_length_and_envelope() {
        let tone = synthesize_tone(48000);
        assert_eq!(tone.len(), 14400);

        let peak = tone.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(peak <= TONE_GAIN + 1e-6);
        assert!(peak > 0.25);

        let tail = tone[tone.len() - 100..]
            .iter()
            .fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(tail < 0.001, "tone should have decayed, got {}", tail);
    }

    #[test]
    fn test_tone_frequency() {
        let sample_rate = 48000;
        let tone = synthesize_tone(sample_rate);
        // Count rising zero crossings over the first 100ms
        let window = &tone[..4800];
        let crossings = window
            .windows(2)
            .filter(|w| w[0] <= 0.0 && w[1] > 0.0)
            .count();
        assert_relative_eq!(crossings as f32, 88.0, epsilon = 2.0);
    }

    #[test]
    fn test_shared_state_mapping() {
        let shared = ToneShared {
            device: AtomicU8::new(DEVICE_PENDING),
            resumed: AtomicBool::new(true),
        };
        assert_eq!(shared.state(), AudioContextState::Suspended);
        shared.device.store(DEVICE_READY, Ordering::Release);
        assert_eq!(shared.state(), AudioContextState::Running);
        shared.resumed.store(false, Ordering::Release);
        assert_eq!(shared.state(), AudioContextState::Suspended);
        shared.fail("unplugged");
        assert_eq!(shared.state(), AudioContextState::Unavailable);
    }

    #[test]
    fn test_context_settles_without_global_slot() {
        // A context outside the process-wide slot still hears from its thread
        let context = ToneContext::spawn(false);
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while context.shared.device.load(Ordering::Acquire) == DEVICE_PENDING {
            assert!(
                std::time::Instant::now() < deadline,
                "tone thread never reported a device state"
            );
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_ne!(context.state(), AudioContextState::Suspended);
    }

    #[test]
    fn test_silent_sound_counts() {
        let sound = SilentSound::new();
        sound.play();
        sound.play();
        assert_eq!(sound.plays(), 2);
        assert_eq!(sound.resume(), AudioContextState::Running);
    }
}
