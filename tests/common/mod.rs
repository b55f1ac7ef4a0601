//! Shared fixtures for the end-to-end suites
//!
//! `ScriptedEngine` stands in for a real playback engine: tests drive each
//! attachment by emitting engine events and feeding audio through the media
//! handle the controller handed over.

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use streamwatch::alerts::{
    AlertSound, EmailChannel, NotificationTransport, NotifyError, SilentSound,
};
use streamwatch::media::{AudioBlock, MediaHandle};
use streamwatch::monitor::engine::{EngineError, EngineEvent, EngineEvents};
use streamwatch::{AlertRouter, AlertSettings, MonitorSettings, PlaybackEngine, Supervisor};

/// One `attach` call as seen by the engine
#[derive(Clone)]
pub struct Attachment {
    pub url: String,
    pub handle: Arc<MediaHandle>,
    pub events: EngineEvents,
}

/// Engine driven by the test
#[derive(Default)]
pub struct ScriptedEngine {
    attachments: Mutex<Vec<Attachment>>,
    detaches: AtomicUsize,
    block_autoplay: AtomicBool,
}

impl ScriptedEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attach_count(&self) -> usize {
        self.attachments.lock().unwrap().len()
    }

    pub fn attach_count_for(&self, url: &str) -> usize {
        self.attachments
            .lock()
            .unwrap()
            .iter()
            .filter(|a| a.url == url)
            .count()
    }

    pub fn detach_count(&self) -> usize {
        self.detaches.load(Ordering::SeqCst)
    }

    pub fn set_block_autoplay(&self, blocked: bool) {
        self.block_autoplay.store(blocked, Ordering::SeqCst);
    }

    /// Most recent attachment for `url`
    pub fn latest(&self, url: &str) -> Attachment {
        self.attachments
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|a| a.url == url)
            .cloned()
            .unwrap_or_else(|| panic!("{} was never attached", url))
    }

    /// Emit an event on the latest attachment for `url`
    pub fn emit(&self, url: &str, event: EngineEvent) {
        self.latest(url).events.emit(event);
    }

    /// Push interleaved audio through the latest attachment for `url`
    pub fn feed(&self, url: &str, samples: &[f32], channels: u16) {
        self.latest(url)
            .handle
            .feed_audio(AudioBlock::new(samples, channels, 48000));
    }
}

impl PlaybackEngine for ScriptedEngine {
    fn attach(
        &self,
        url: &str,
        handle: &Arc<MediaHandle>,
        events: EngineEvents,
    ) -> Result<(), EngineError> {
        self.attachments.lock().unwrap().push(Attachment {
            url: url.to_string(),
            handle: Arc::clone(handle),
            events,
        });
        Ok(())
    }

    fn detach(&self, _handle: &MediaHandle) -> Result<(), EngineError> {
        self.detaches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn play(&self, _handle: &MediaHandle) -> Result<(), EngineError> {
        if self.block_autoplay.load(Ordering::SeqCst) {
            Err(EngineError::AutoplayBlocked)
        } else {
            Ok(())
        }
    }
}

/// A sent email notification
#[derive(Debug, Clone, PartialEq)]
pub struct SentEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Transport that records every request and always succeeds
#[derive(Default)]
pub struct CapturingTransport {
    sent: Mutex<Vec<SentEmail>>,
}

impl CapturingTransport {
    pub fn sent(&self) -> Vec<SentEmail> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationTransport for CapturingTransport {
    async fn send_notification(
        &self,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push(SentEmail {
            to: to.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }
}

/// Everything a supervisor-level test needs to observe
pub struct Harness {
    pub engine: Arc<ScriptedEngine>,
    pub sound: Arc<SilentSound>,
    pub transport: Arc<CapturingTransport>,
    pub supervisor: Arc<Supervisor>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(AlertSettings::default(), MonitorSettings::default())
    }

    /// Must be called from within a tokio runtime
    pub fn with_settings(alerts: AlertSettings, monitor: MonitorSettings) -> Self {
        let engine = ScriptedEngine::new();
        let sound = Arc::new(SilentSound::new());
        let transport = Arc::new(CapturingTransport::default());

        let sound_dyn: Arc<dyn AlertSound> = sound.clone();
        let transport_dyn: Arc<dyn NotificationTransport> = transport.clone();
        let router = Arc::new(AlertRouter::new(
            alerts,
            monitor.max_alerts,
            sound_dyn,
            EmailChannel::new(transport_dyn),
        ));
        let supervisor = Arc::new(Supervisor::new(engine.clone(), router, monitor));

        Self {
            engine,
            sound,
            transport,
            supervisor,
        }
    }
}

/// Let spawned tasks run until they block
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Interleaved stereo sine with independent channel amplitudes
pub fn stereo_sine(frames: usize, frequency: f32, left: f32, right: f32) -> Vec<f32> {
    let mut samples = Vec::with_capacity(frames * 2);
    for n in 0..frames {
        let s = (2.0 * std::f32::consts::PI * frequency * n as f32 / 48000.0).sin();
        samples.push(s * left);
        samples.push(s * right);
    }
    samples
}
