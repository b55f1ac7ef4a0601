//! Output sinks for the audible branch of the meter graph
//!
//! The sink receives stereo interleaved samples after the gain stage.
//! [`NullOutput`] discards them (headless deployments); [`DeviceOutput`]
//! plays them on the default output device.

use crate::meter::MeterError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Ring buffer size in samples (about 0.7s of stereo at 48kHz)
const RING_BUFFER_SIZE: usize = 65536;

/// Destination of the gained audio
pub trait OutputSink: Send {
    /// Write stereo interleaved samples at the given rate
    fn write(&mut self, samples: &[f32], sample_rate: u32);

    /// Stop output and release the device. Idempotent.
    fn stop(&mut self);
}

/// Sink that discards everything
#[derive(Debug, Default)]
pub struct NullOutput;

impl OutputSink for NullOutput {
    fn write(&mut self, _samples: &[f32], _sample_rate: u32) {}

    fn stop(&mut self) {}
}

/// Sink feeding the default cpal output device through a ring buffer
///
/// `cpal::Stream` is not `Send`, so the stream lives on a dedicated thread
/// that exits when the sink is stopped.
pub struct DeviceOutput {
    producer: HeapProd<f32>,
    running: Arc<AtomicBool>,
    stop_tx: crossbeam_channel::Sender<()>,
    thread: Option<JoinHandle<()>>,
    device_rate: u32,
    rate_warned: bool,
}

impl std::fmt::Debug for DeviceOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceOutput")
            .field("device_rate", &self.device_rate)
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

impl DeviceOutput {
    /// Open the default output device and start its stream
    pub fn open() -> Result<Self, MeterError> {
        let ring = HeapRb::<f32>::new(RING_BUFFER_SIZE);
        let (producer, mut consumer) = ring.split();
        let running = Arc::new(AtomicBool::new(true));
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<u32, String>>();

        let thread_running = Arc::clone(&running);
        let thread = std::thread::Builder::new()
            .name("meter-output".into())
            .spawn(move || {
                let host = cpal::default_host();
                let Some(device) = host.default_output_device() else {
                    let _ = ready_tx.send(Err("no default output device".into()));
                    return;
                };
                let default_config = match device.default_output_config() {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                let channels = default_config.channels().max(1) as usize;
                let rate = default_config.sample_rate().0;
                let config = StreamConfig {
                    channels: channels as u16,
                    sample_rate: SampleRate(rate),
                    buffer_size: cpal::BufferSize::Default,
                };

                let callback_running = Arc::clone(&thread_running);
                let stream = device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        if !callback_running.load(Ordering::Relaxed) {
                            data.fill(0.0);
                            return;
                        }
                        for frame in data.chunks_mut(channels) {
                            let left = consumer.try_pop().unwrap_or(0.0);
                            let right = consumer.try_pop().unwrap_or(left);
                            frame[0] = left;
                            if frame.len() > 1 {
                                frame[1] = right;
                            }
                            for ch in frame.iter_mut().skip(2) {
                                *ch = 0.0;
                            }
                        }
                    },
                    move |err| {
                        tracing::error!("Meter output stream error: {}", err);
                    },
                    None,
                );

                let stream = match stream {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }

                let _ = ready_tx.send(Ok(rate));
                // Park until stopped; dropping the stream releases the device
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| MeterError::Output(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(device_rate)) => {
                tracing::info!("Meter output opened at {} Hz", device_rate);
                Ok(Self {
                    producer,
                    running,
                    stop_tx,
                    thread: Some(thread),
                    device_rate,
                    rate_warned: false,
                })
            }
            Ok(Err(msg)) => {
                let _ = thread.join();
                Err(MeterError::Output(msg))
            }
            Err(_) => {
                let _ = thread.join();
                Err(MeterError::Output("output thread exited".into()))
            }
        }
    }
}

impl OutputSink for DeviceOutput {
    fn write(&mut self, samples: &[f32], sample_rate: u32) {
        if sample_rate != self.device_rate && !self.rate_warned {
            tracing::warn!(
                "Stream rate {} Hz differs from device rate {} Hz; playing without resampling",
                sample_rate,
                self.device_rate
            );
            self.rate_warned = true;
        }
        // Overflow drops the newest samples rather than blocking the tap
        let _ = self.producer.push_slice(samples);
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = self.stop_tx.try_send(());
            if thread.join().is_err() {
                tracing::warn!("Meter output thread panicked during shutdown");
            }
        }
    }
}

impl Drop for DeviceOutput {
    fn drop(&mut self) {
        self.stop();
    }
}
