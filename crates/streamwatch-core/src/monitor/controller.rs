//! Per-source connection controller
//!
//! Each source runs as one tokio task that owns its state outright. Engine
//! events, retry timer fires, operator commands, and global signal changes
//! all arrive on channels and are handled one at a time, so transitions for
//! a source are strictly serialized.
//!
//! ## Alert episodes
//!
//! A failure (`Error` or `Stalled`) entered outside an outage opens one and
//! requests a single `Error` alert. Further failures during the same outage,
//! including every failed retry, stay silent. The first `Connected` after
//! that closes the outage with a single `Recovery` alert. Removing the URL
//! ends an outage without an alert.

use crate::media::MediaHandle;
use crate::meter::{LevelSample, MeterReader, MeterSettings, SignalMeter};
use crate::monitor::backoff::{DelayedFire, RetryPolicy, RetryState};
use crate::monitor::engine::{EngineError, EngineEvent, EngineEvents, PlaybackEngine, StampedEvent};
use crate::monitor::state::{
    AlertRequest, ConnectionState, Source, SourceStatus, TransitionEvent,
};
use crate::alerts::log::AlertKind;
use crate::supervisor::GlobalSignals;
use chrono::Utc;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Default time a buffering stall may last before a re-attach is forced
pub const DEFAULT_STALL_GRACE: Duration = Duration::from_secs(10);

pub const MSG_FATAL_ERROR: &str = "Fatal error detected";
pub const MSG_STALLED: &str = "Stream stalled";
pub const MSG_RECOVERED: &str = "Stream recovered";

/// Commands accepted by a running controller
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerCommand {
    /// Replace the stream URL; empty detaches
    SetUrl(String),
    SetName(String),
    /// Manual refresh: cancel backoff and re-attach now
    Refresh,
    SetMuted(bool),
    SetVolume(f32),
    Shutdown,
}

/// Per-controller tuning
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControllerConfig {
    pub retry: RetryPolicy,
    /// How long a buffering stall may last before forcing a retry
    pub stall_grace: Option<Duration>,
    pub meter: MeterSettings,
    /// Initial local mute
    pub muted: bool,
    pub volume: f32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            stall_grace: Some(DEFAULT_STALL_GRACE),
            meter: MeterSettings::default(),
            muted: true,
            volume: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum TimerFire {
    Retry(u64),
    StallGrace(u64),
}

/// Owner-side handle of a running controller
#[derive(Debug)]
pub struct ControllerHandle {
    source_id: String,
    commands: mpsc::UnboundedSender<ControllerCommand>,
    status: watch::Receiver<SourceStatus>,
    meter: MeterReader,
    task: Option<JoinHandle<()>>,
}

impl ControllerHandle {
    /// Start a controller for `source`
    ///
    /// Must be called from within a tokio runtime. The controller attaches
    /// immediately when the source has a URL.
    pub fn spawn(
        source: &Source,
        engine: Arc<dyn PlaybackEngine>,
        globals: watch::Receiver<GlobalSignals>,
        events_out: mpsc::UnboundedSender<TransitionEvent>,
        config: ControllerConfig,
    ) -> Self {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(SourceStatus::default());

        let handle = MediaHandle::new(source.id.clone());
        let snapshot = *globals.borrow();
        let mut meter = SignalMeter::new(
            config.meter,
            config.muted || snapshot.master_mute,
            config.volume,
        );
        if let Err(e) = meter.attach(&handle) {
            tracing::warn!(source = %source.display_name(), "Meter not attached: {}", e);
        }
        let reader = meter.reader();

        let controller = Controller {
            source_id: source.id.clone(),
            name: source.display_name().to_string(),
            url: source.url.trim().to_string(),
            engine,
            handle,
            meter,
            config,
            state: ConnectionState::Idle,
            last_message: None,
            retry: RetryState::new(),
            stall_grace: DelayedFire::new(),
            outage: false,
            epoch: 0,
            attached: false,
            muted: config.muted,
            volume: config.volume,
            globals: snapshot,
            status_tx,
            events_out,
            engine_tx,
            timer_tx,
        };
        let task = tokio::spawn(controller.run(command_rx, engine_rx, timer_rx, globals));

        Self {
            source_id: source.id.clone(),
            commands: command_tx,
            status: status_rx,
            meter: reader,
            task: Some(task),
        }
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Queue a command. Returns false if the controller has stopped.
    pub fn send(&self, command: ControllerCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn refresh(&self) -> bool {
        self.send(ControllerCommand::Refresh)
    }

    /// Latest published status
    pub fn status(&self) -> SourceStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SourceStatus> {
        self.status.clone()
    }

    /// Latest meter levels
    pub fn levels(&self) -> LevelSample {
        self.meter.levels()
    }

    pub fn meter(&self) -> &MeterReader {
        &self.meter
    }

    /// Stop the controller and wait for its teardown to finish
    pub async fn shutdown(mut self) {
        let _ = self.commands.send(ControllerCommand::Shutdown);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::error!(source = %self.source_id, "Controller task failed: {}", e);
            }
        }
    }
}

impl Drop for ControllerHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            let _ = self.commands.send(ControllerCommand::Shutdown);
        }
    }
}

struct Controller {
    source_id: String,
    name: String,
    url: String,
    engine: Arc<dyn PlaybackEngine>,
    handle: Arc<MediaHandle>,
    meter: SignalMeter,
    config: ControllerConfig,
    state: ConnectionState,
    last_message: Option<String>,
    retry: RetryState,
    stall_grace: DelayedFire,
    /// An `Error` alert has been raised and not yet answered by `Recovery`
    outage: bool,
    /// Attachment generation; engine events from other epochs are stale
    epoch: u64,
    attached: bool,
    muted: bool,
    volume: f32,
    globals: GlobalSignals,
    status_tx: watch::Sender<SourceStatus>,
    events_out: mpsc::UnboundedSender<TransitionEvent>,
    engine_tx: mpsc::UnboundedSender<StampedEvent>,
    timer_tx: mpsc::UnboundedSender<TimerFire>,
}

impl Controller {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<ControllerCommand>,
        mut engine_rx: mpsc::UnboundedReceiver<StampedEvent>,
        mut timer_rx: mpsc::UnboundedReceiver<TimerFire>,
        mut globals: watch::Receiver<GlobalSignals>,
    ) {
        tracing::debug!(source = %self.name, "Controller started");
        if self.has_stream() {
            self.connect();
        } else {
            self.publish_status();
        }

        let mut globals_closed = false;
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(ControllerCommand::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(stamped) = engine_rx.recv() => self.handle_engine_event(stamped),
                Some(fire) = timer_rx.recv() => self.handle_timer(fire),
                changed = globals.changed(), if !globals_closed => match changed {
                    Ok(()) => {
                        let snapshot = *globals.borrow_and_update();
                        self.handle_globals(snapshot);
                    }
                    Err(_) => globals_closed = true,
                },
            }
        }

        self.teardown();
        tracing::debug!(source = %self.name, "Controller stopped");
    }

    fn has_stream(&self) -> bool {
        !self.url.is_empty()
    }

    fn handle_command(&mut self, command: ControllerCommand) {
        match command {
            ControllerCommand::SetUrl(url) => {
                let url = url.trim().to_string();
                if url == self.url {
                    return;
                }
                tracing::info!(source = %self.name, url = %url, "Stream URL changed");
                self.url = url;
                self.retry.cancel();
                self.stall_grace.cancel();
                self.retry.reset_attempts();
                // A different stream starts a fresh episode
                self.outage = false;
                if self.has_stream() {
                    self.connect();
                } else {
                    self.detach_engine();
                    self.go_idle("No stream configured");
                }
            }
            ControllerCommand::SetName(name) => {
                let name = name.trim();
                self.name = if name.is_empty() {
                    self.url.clone()
                } else {
                    name.to_string()
                };
            }
            ControllerCommand::Refresh => {
                tracing::info!(source = %self.name, "Manual refresh");
                self.refresh();
            }
            ControllerCommand::SetMuted(muted) => {
                self.muted = muted;
                self.apply_gain();
            }
            ControllerCommand::SetVolume(volume) => {
                self.volume = volume;
                self.apply_gain();
            }
            ControllerCommand::Shutdown => {}
        }
    }

    fn handle_globals(&mut self, snapshot: GlobalSignals) {
        let previous = std::mem::replace(&mut self.globals, snapshot);
        if snapshot.master_mute != previous.master_mute {
            self.apply_gain();
        }
        if snapshot.refresh_generation != previous.refresh_generation {
            tracing::info!(
                source = %self.name,
                generation = snapshot.refresh_generation,
                "Global refresh"
            );
            self.refresh();
        }
    }

    fn handle_timer(&mut self, fire: TimerFire) {
        match fire {
            TimerFire::Retry(token) => {
                if !self.retry.accept_fire(token) {
                    tracing::trace!(source = %self.name, token, "Discarding stale retry timer");
                    return;
                }
                tracing::info!(
                    source = %self.name,
                    attempt = self.retry.attempt(),
                    "Retrying stream"
                );
                self.connect();
            }
            TimerFire::StallGrace(token) => {
                if !self.stall_grace.accept(token) {
                    return;
                }
                if self.state == ConnectionState::Stalled && !self.retry.is_pending() {
                    tracing::warn!(source = %self.name, "Stall did not clear, re-attaching");
                    self.schedule_retry();
                }
            }
        }
    }

    fn handle_engine_event(&mut self, stamped: StampedEvent) {
        if stamped.epoch != self.epoch || !self.attached {
            tracing::trace!(
                source = %self.name,
                epoch = stamped.epoch,
                current = self.epoch,
                "Discarding stale engine event"
            );
            return;
        }

        match stamped.event {
            EngineEvent::Playing => {
                self.retry.cancel();
                self.stall_grace.cancel();
                self.retry.reset_attempts();
                self.transition(ConnectionState::Connected, "Playing");
            }
            EngineEvent::Waiting => {
                if self.state == ConnectionState::Connected {
                    self.transition(ConnectionState::Stalled, "Buffering");
                    if let Some(grace) = self.config.stall_grace {
                        let tx = self.timer_tx.clone();
                        self.stall_grace.schedule(grace, move |token| {
                            let _ = tx.send(TimerFire::StallGrace(token));
                        });
                    }
                }
            }
            EngineEvent::Stalled => match self.state {
                ConnectionState::Connected => {
                    self.transition(ConnectionState::Stalled, MSG_STALLED);
                    self.schedule_retry();
                }
                ConnectionState::Stalled if !self.retry.is_pending() => {
                    self.schedule_retry();
                }
                _ => {}
            },
            EngineEvent::Error { detail, fatal } => {
                if !fatal && !detail.is_critical() {
                    tracing::debug!(source = %self.name, %detail, "Ignoring recoverable engine error");
                    return;
                }
                if self.state == ConnectionState::Error || self.retry.is_pending() {
                    tracing::debug!(source = %self.name, %detail, "Error already being handled");
                    return;
                }
                tracing::warn!(source = %self.name, %detail, fatal, "Critical engine error");
                self.fail(format!("{} ({})", MSG_FATAL_ERROR, detail));
            }
            EngineEvent::CanPlay => match self.engine.play(&self.handle) {
                Ok(()) => {}
                Err(EngineError::AutoplayBlocked) => {
                    tracing::info!(source = %self.name, "Autoplay blocked");
                    self.go_idle("Autoplay blocked");
                }
                Err(e) => {
                    tracing::warn!(source = %self.name, "Play request failed: {}", e);
                }
            },
        }
    }

    /// Cancel backoff, reset attempts, and re-attach immediately
    fn refresh(&mut self) {
        self.retry.cancel();
        self.stall_grace.cancel();
        self.retry.reset_attempts();
        if self.has_stream() {
            self.connect();
        } else {
            self.go_idle("No stream configured");
        }
    }

    /// Tear down any attachment and attach afresh
    fn connect(&mut self) {
        self.stall_grace.cancel();
        self.detach_engine();
        if !self.has_stream() {
            self.go_idle("No stream configured");
            return;
        }

        self.epoch += 1;
        self.transition(ConnectionState::Connecting, "Connecting");
        let events = EngineEvents::new(self.epoch, self.engine_tx.clone());
        match self.engine.attach(&self.url, &self.handle, events) {
            Ok(()) => {
                self.attached = true;
                tracing::debug!(source = %self.name, epoch = self.epoch, "Engine attached");
            }
            Err(e) => {
                tracing::warn!(source = %self.name, "Attach failed: {}", e);
                self.fail(format!("{} ({})", MSG_FATAL_ERROR, e));
            }
        }
    }

    /// Enter `Error` and schedule the next retry
    fn fail(&mut self, message: String) {
        self.transition(ConnectionState::Error, message);
        self.schedule_retry();
    }

    /// Arm the retry timer; the source reports `Connecting` while it is pending
    fn schedule_retry(&mut self) {
        self.stall_grace.cancel();
        let tx = self.timer_tx.clone();
        let delay = self.retry.schedule(&self.config.retry, move |token| {
            let _ = tx.send(TimerFire::Retry(token));
        });
        let delay_ms = delay.as_millis();
        let attempt = self.retry.attempt() + 1;
        tracing::info!(
            source = %self.name,
            delay_ms = delay_ms as u64,
            attempt,
            "Stream interrupted, retry scheduled"
        );
        self.transition(
            ConnectionState::Connecting,
            format!("Retrying in {}ms (attempt {})", delay_ms, attempt),
        );
    }

    fn go_idle(&mut self, message: &str) {
        self.retry.cancel();
        self.stall_grace.cancel();
        self.transition(ConnectionState::Idle, message);
    }

    fn detach_engine(&mut self) {
        self.epoch += 1;
        if !self.attached {
            return;
        }
        self.attached = false;
        let engine = &self.engine;
        let handle = &self.handle;
        match std::panic::catch_unwind(AssertUnwindSafe(|| engine.detach(handle))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(source = %self.name, "Detach failed: {}", e),
            Err(_) => tracing::error!(source = %self.name, "Engine panicked during detach"),
        }
    }

    fn apply_gain(&self) {
        self.meter
            .set_volume(self.muted || self.globals.master_mute, self.volume);
    }

    fn alert_for(&mut self, from: ConnectionState, to: ConnectionState) -> Option<AlertRequest> {
        if to.is_failure() && !self.outage {
            self.outage = true;
            let message = if to == ConnectionState::Error {
                MSG_FATAL_ERROR
            } else {
                MSG_STALLED
            };
            return Some(AlertRequest {
                kind: AlertKind::Error,
                message: message.to_string(),
            });
        }
        if to == ConnectionState::Connected && from != ConnectionState::Connected && self.outage {
            self.outage = false;
            return Some(AlertRequest {
                kind: AlertKind::Recovery,
                message: MSG_RECOVERED.to_string(),
            });
        }
        None
    }

    fn transition(&mut self, to: ConnectionState, message: impl Into<String>) {
        let from = self.state;
        let message = message.into();
        let alert = self.alert_for(from, to);
        self.state = to;
        self.last_message = Some(message.clone());
        self.publish_status();

        if from == to && alert.is_none() {
            return;
        }
        tracing::info!(
            source = %self.name,
            from = %from,
            to = %to,
            "{}",
            message
        );
        let event = TransitionEvent {
            source_id: self.source_id.clone(),
            source_name: self.name.clone(),
            from,
            to,
            message: Some(message),
            alert,
            at: Utc::now(),
        };
        if self.events_out.send(event).is_err() {
            tracing::debug!(source = %self.name, "Transition dropped, event queue closed");
        }
    }

    fn publish_status(&self) {
        let status = SourceStatus {
            state: self.state,
            last_message: self.last_message.clone(),
            attempt: self.retry.attempt(),
            retry_in_ms: self.retry.remaining().map(|d| d.as_millis() as u64),
            updated_at: Utc::now(),
        };
        self.status_tx.send_replace(status);
    }

    fn teardown(&mut self) {
        self.retry.cancel();
        self.stall_grace.cancel();
        self.detach_engine();
        self.meter.detach();
        self.outage = false;
        self.state = ConnectionState::Idle;
        self.last_message = Some("Stopped".to_string());
        self.publish_status();
    }
}
