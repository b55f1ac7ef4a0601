//! Supervisor: the composition root
//!
//! Owns the ordered set of active sources with one connection controller
//! each, the global signals every controller observes, and the alert
//! router fed by all controllers through one shared event queue.

use crate::alerts::router::AlertRouter;
use crate::config::{parse_grid_layout, ConfigError, Configuration, MonitorSettings};
use crate::meter::LevelSample;
use crate::monitor::controller::{ControllerCommand, ControllerHandle};
use crate::monitor::engine::PlaybackEngine;
use crate::monitor::state::{Source, SourceStatus, TransitionEvent};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

/// Capacity of the transition broadcast to UI subscribers
const TRANSITION_CHANNEL_CAPACITY: usize = 256;

/// Process-wide signals read by every controller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GlobalSignals {
    pub master_mute: bool,
    /// Incremented to force every controller to re-attach at once
    pub refresh_generation: u64,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("Source already exists: {0}")]
    DuplicateSource(String),

    #[error("Unknown source: {0}")]
    UnknownSource(String),

    #[error("Source id must not be empty")]
    EmptySourceId,

    #[error("Supervisor is shut down")]
    ShutDown,
}

/// Everything the UI needs to render one source
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceSnapshot {
    #[serde(flatten)]
    pub source: Source,
    pub status: SourceStatus,
    pub levels: LevelSample,
    pub muted: bool,
    pub volume: f32,
}

struct SourceEntry {
    source: Source,
    controller: ControllerHandle,
    muted: bool,
    volume: f32,
}

pub struct Supervisor {
    engine: Arc<dyn PlaybackEngine>,
    router: Arc<AlertRouter>,
    settings: Mutex<MonitorSettings>,
    grid_layout: Mutex<String>,
    sources: Mutex<Vec<SourceEntry>>,
    globals: watch::Sender<GlobalSignals>,
    /// Shared controller event queue; taken on shutdown to end the intake
    events_tx: Mutex<Option<mpsc::UnboundedSender<TransitionEvent>>>,
    transitions: broadcast::Sender<TransitionEvent>,
    intake: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("sources", &self.source_count())
            .field("globals", &self.globals())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Supervisor {
    /// Create an empty supervisor and start the alert intake
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        engine: Arc<dyn PlaybackEngine>,
        router: Arc<AlertRouter>,
        settings: MonitorSettings,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_CAPACITY);
        let intake = router.spawn_intake(events_rx, transitions.clone());
        let (globals, _) = watch::channel(GlobalSignals::default());

        Self {
            engine,
            router,
            settings: Mutex::new(settings),
            grid_layout: Mutex::new("2x2".to_string()),
            sources: Mutex::new(Vec::new()),
            globals,
            events_tx: Mutex::new(Some(events_tx)),
            transitions,
            intake: Mutex::new(Some(intake)),
        }
    }

    pub fn router(&self) -> &Arc<AlertRouter> {
        &self.router
    }

    pub fn globals(&self) -> GlobalSignals {
        *self.globals.borrow()
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        lock(&self.settings).clone()
    }

    /// Transitions of every source, as processed by the alert router
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<TransitionEvent> {
        self.transitions.subscribe()
    }

    pub fn source_count(&self) -> usize {
        lock(&self.sources).len()
    }

    /// Start supervising a new source
    pub fn add_source(&self, source: Source) -> Result<(), SupervisorError> {
        if source.id.trim().is_empty() {
            return Err(SupervisorError::EmptySourceId);
        }
        let events_tx = lock(&self.events_tx)
            .clone()
            .ok_or(SupervisorError::ShutDown)?;
        let mut sources = lock(&self.sources);
        if sources.iter().any(|e| e.source.id == source.id) {
            return Err(SupervisorError::DuplicateSource(source.id));
        }

        let settings = lock(&self.settings).clone();
        let muted = settings.sources_start_muted;
        let volume = 1.0;
        let controller = ControllerHandle::spawn(
            &source,
            Arc::clone(&self.engine),
            self.globals.subscribe(),
            events_tx,
            settings.controller_config(muted, volume),
        );
        tracing::info!(source = %source.display_name(), id = %source.id, "Source added");
        sources.push(SourceEntry {
            source,
            controller,
            muted,
            volume,
        });
        Ok(())
    }

    /// Apply edited metadata; URL and name changes reach the live controller
    pub fn update_source(&self, source: Source) -> Result<(), SupervisorError> {
        let mut sources = lock(&self.sources);
        let entry = sources
            .iter_mut()
            .find(|e| e.source.id == source.id)
            .ok_or_else(|| SupervisorError::UnknownSource(source.id.clone()))?;

        if entry.source.display_name() != source.display_name() {
            entry
                .controller
                .send(ControllerCommand::SetName(source.display_name().to_string()));
        }
        if entry.source.url.trim() != source.url.trim() {
            entry
                .controller
                .send(ControllerCommand::SetUrl(source.url.clone()));
        }
        tracing::info!(source = %source.display_name(), id = %source.id, "Source updated");
        entry.source = source;
        Ok(())
    }

    /// Stop supervising a source; returns once its controller has torn down
    pub async fn remove_source(&self, id: &str) -> Result<Source, SupervisorError> {
        let entry = {
            let mut sources = lock(&self.sources);
            let index = sources
                .iter()
                .position(|e| e.source.id == id)
                .ok_or_else(|| SupervisorError::UnknownSource(id.to_string()))?;
            sources.remove(index)
        };
        entry.controller.shutdown().await;
        tracing::info!(source = %entry.source.display_name(), id = %id, "Source removed");
        Ok(entry.source)
    }

    /// Manual refresh of one source
    pub fn refresh_source(&self, id: &str) -> Result<(), SupervisorError> {
        self.with_entry(id, |entry| {
            entry.controller.refresh();
        })
    }

    /// Force every controller to re-attach; returns the new generation
    pub fn refresh_all(&self) -> u64 {
        self.globals.send_modify(|g| g.refresh_generation += 1);
        let generation = self.globals().refresh_generation;
        tracing::info!(generation, "Global refresh");
        generation
    }

    pub fn set_master_mute(&self, muted: bool) {
        self.globals.send_if_modified(|g| {
            let changed = g.master_mute != muted;
            g.master_mute = muted;
            changed
        });
        tracing::info!(muted, "Master mute");
    }

    /// Set a source's local mute
    ///
    /// Unmuting counts as an operator gesture and resumes the alert audio.
    pub fn set_source_mute(&self, id: &str, muted: bool) -> Result<(), SupervisorError> {
        self.with_entry(id, |entry| {
            entry.muted = muted;
            entry.controller.send(ControllerCommand::SetMuted(muted));
        })?;
        if !muted {
            self.router.sound().resume();
        }
        Ok(())
    }

    pub fn set_source_volume(&self, id: &str, volume: f32) -> Result<(), SupervisorError> {
        let volume = if volume.is_finite() {
            volume.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.with_entry(id, |entry| {
            entry.volume = volume;
            entry.controller.send(ControllerCommand::SetVolume(volume));
        })
    }

    pub fn status(&self, id: &str) -> Option<SourceStatus> {
        lock(&self.sources)
            .iter()
            .find(|e| e.source.id == id)
            .map(|e| e.controller.status())
    }

    /// Latest status of every source, in grid order
    pub fn statuses(&self) -> Vec<(String, SourceStatus)> {
        lock(&self.sources)
            .iter()
            .map(|e| (e.source.id.clone(), e.controller.status()))
            .collect()
    }

    /// Latest meter levels of every source, in grid order
    pub fn levels(&self) -> Vec<(String, LevelSample)> {
        lock(&self.sources)
            .iter()
            .map(|e| (e.source.id.clone(), e.controller.levels()))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<SourceSnapshot> {
        lock(&self.sources)
            .iter()
            .map(|e| SourceSnapshot {
                source: e.source.clone(),
                status: e.controller.status(),
                levels: e.controller.levels(),
                muted: e.muted,
                volume: e.volume,
            })
            .collect()
    }

    pub fn sources(&self) -> Vec<Source> {
        lock(&self.sources)
            .iter()
            .map(|e| e.source.clone())
            .collect()
    }

    pub fn grid_layout(&self) -> String {
        lock(&self.grid_layout).clone()
    }

    pub fn set_grid_layout(&self, layout: &str) -> Result<(), ConfigError> {
        parse_grid_layout(layout)?;
        *lock(&self.grid_layout) = layout.trim().to_string();
        Ok(())
    }

    /// Snapshot of the current configuration, for saving
    pub fn configuration(&self) -> Configuration {
        Configuration {
            sources: self.sources(),
            grid_layout: self.grid_layout(),
            notifications: self.router.settings(),
            monitor: self.monitor_settings(),
        }
    }

    /// Replace every source and setting with a loaded configuration
    ///
    /// Invalid parts are logged and skipped; valid sources are still loaded.
    pub async fn apply_configuration(&self, config: Configuration) {
        let existing: Vec<SourceEntry> = lock(&self.sources).drain(..).collect();
        futures_util::future::join_all(existing.into_iter().map(|e| e.controller.shutdown())).await;

        *lock(&self.settings) = config.monitor.validated();
        if let Err(e) = self.set_grid_layout(&config.grid_layout) {
            tracing::warn!("Keeping grid layout {}: {}", self.grid_layout(), e);
        }
        if let Err(e) = self.router.set_settings(config.notifications) {
            tracing::warn!("Notification settings not applied: {}", e);
        }
        for source in config.sources {
            if let Err(e) = self.add_source(source) {
                tracing::warn!("Skipping configured source: {}", e);
            }
        }
        tracing::info!(sources = self.source_count(), "Configuration applied");
    }

    /// Stop every controller and the alert intake
    pub async fn shutdown(&self) {
        let entries: Vec<SourceEntry> = lock(&self.sources).drain(..).collect();
        futures_util::future::join_all(entries.into_iter().map(|e| e.controller.shutdown())).await;

        // Dropping the last sender lets the intake drain and finish
        lock(&self.events_tx).take();
        let intake = lock(&self.intake).take();
        if let Some(intake) = intake {
            if let Err(e) = intake.await {
                tracing::error!("Alert intake failed: {}", e);
            }
        }
        tracing::info!("Supervisor stopped");
    }

    fn with_entry<F>(&self, id: &str, f: F) -> Result<(), SupervisorError>
    where
        F: FnOnce(&mut SourceEntry),
    {
        let mut sources = lock(&self.sources);
        let entry = sources
            .iter_mut()
            .find(|e| e.source.id == id)
            .ok_or_else(|| SupervisorError::UnknownSource(id.to_string()))?;
        f(entry);
        Ok(())
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if let Some(intake) = lock(&self.intake).take() {
            intake.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::email::{EmailChannel, HttpNotificationTransport};
    use crate::alerts::router::AlertSettings;
    use crate::alerts::tone::SilentSound;
    use crate::media::MediaHandle;
    use crate::monitor::engine::{EngineError, EngineEvents};

    /// Engine that accepts everything and never reports
    struct QuietEngine;

    impl PlaybackEngine for QuietEngine {
        fn attach(
            &self,
            _url: &str,
            _handle: &Arc<MediaHandle>,
            _events: EngineEvents,
        ) -> Result<(), EngineError> {
            Ok(())
        }

        fn detach(&self, _handle: &MediaHandle) -> Result<(), EngineError> {
            Ok(())
        }

        fn play(&self, _handle: &MediaHandle) -> Result<(), EngineError> {
            Ok(())
        }
    }

    fn supervisor() -> Supervisor {
        let router = Arc::new(AlertRouter::new(
            AlertSettings::default(),
            100,
            Arc::new(SilentSound::new()),
            EmailChannel::new(Arc::new(HttpNotificationTransport::new(None))),
        ));
        Supervisor::new(Arc::new(QuietEngine), router, MonitorSettings::default())
    }

    #[tokio::test]
    async fn test_duplicate_and_unknown_ids() {
        let sup = supervisor();
        sup.add_source(Source::new("a", "A", "http://x/a.m3u8")).unwrap();
        assert_eq!(
            sup.add_source(Source::new("a", "Again", "http://x/b.m3u8")),
            Err(SupervisorError::DuplicateSource("a".into()))
        );
        assert_eq!(
            sup.add_source(Source::new(" ", "Blank", "")),
            Err(SupervisorError::EmptySourceId)
        );
        assert_eq!(
            sup.refresh_source("missing"),
            Err(SupervisorError::UnknownSource("missing".into()))
        );
        assert_eq!(
            sup.remove_source("missing").await,
            Err(SupervisorError::UnknownSource("missing".into()))
        );
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_sources_start_muted_in_order() {
        let sup = supervisor();
        sup.add_source(Source::new("b", "B", "")).unwrap();
        sup.add_source(Source::new("a", "A", "")).unwrap();
        let snapshot = sup.snapshot();
        let ids: Vec<_> = snapshot.iter().map(|s| s.source.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert!(snapshot.iter().all(|s| s.muted));

        sup.set_source_volume("a", 3.0).unwrap();
        assert_eq!(sup.snapshot()[1].volume, 1.0);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_refresh_all_bumps_generation() {
        let sup = supervisor();
        assert_eq!(sup.globals().refresh_generation, 0);
        assert_eq!(sup.refresh_all(), 1);
        assert_eq!(sup.refresh_all(), 2);
        sup.set_master_mute(true);
        assert!(sup.globals().master_mute);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_add_after_shutdown_rejected() {
        let sup = supervisor();
        sup.shutdown().await;
        assert_eq!(
            sup.add_source(Source::new("a", "A", "")),
            Err(SupervisorError::ShutDown)
        );
    }

    #[tokio::test]
    async fn test_apply_configuration_rejects_bad_retry_policy() {
        let sup = supervisor();
        let mut config = Configuration::default();
        config.monitor.retry.initial_delay_ms = 1e25;
        config.monitor.retry.max_delay_ms = 1e30;
        sup.apply_configuration(config).await;
        assert_eq!(
            sup.monitor_settings().retry,
            crate::monitor::backoff::RetryPolicy::default()
        );
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_configuration_snapshot() {
        let sup = supervisor();
        sup.add_source(Source::new("a", "A", "http://x/a.m3u8")).unwrap();
        sup.set_grid_layout("3x2").unwrap();
        assert!(sup.set_grid_layout("big").is_err());

        let config = sup.configuration();
        assert_eq!(config.grid_layout, "3x2");
        assert_eq!(config.sources, vec![Source::new("a", "A", "http://x/a.m3u8")]);
        sup.shutdown().await;
    }
}
