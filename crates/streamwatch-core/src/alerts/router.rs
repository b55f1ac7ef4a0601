//! Alert router
//!
//! Consumes transition events from every connection controller, records
//! alerts in the session log, and fans `Error` alerts out to the audible
//! and email channels.

use crate::alerts::email::{alert_body, alert_subject, is_valid_address, EmailChannel};
use crate::alerts::log::{AlertEntry, AlertKind, AlertLog};
use crate::alerts::tone::AlertSound;
use crate::monitor::state::TransitionEvent;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Capacity of the alert update broadcast
const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Notification channel switches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertSettings {
    pub audible_enabled: bool,
    pub email_enabled: bool,
    /// Recipient; empty disables email even when enabled
    pub email_address: String,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            audible_enabled: true,
            email_enabled: false,
            email_address: String::new(),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AlertSettingsError {
    #[error("Invalid email address: {0}")]
    InvalidAddress(String),
}

/// Change to the alert log, pushed to subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertUpdate {
    Recorded { entry: AlertEntry },
    Cleared,
    Read,
}

/// Shared alert log plus notification fan-out
pub struct AlertRouter {
    log: Mutex<AlertLog>,
    settings: Mutex<AlertSettings>,
    sound: Arc<dyn AlertSound>,
    email: EmailChannel,
    updates: broadcast::Sender<AlertUpdate>,
}

impl std::fmt::Debug for AlertRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertRouter")
            .field("settings", &self.settings())
            .field("email", &self.email)
            .finish()
    }
}

impl AlertRouter {
    pub fn new(
        settings: AlertSettings,
        max_entries: usize,
        sound: Arc<dyn AlertSound>,
        email: EmailChannel,
    ) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            log: Mutex::new(AlertLog::new(max_entries)),
            settings: Mutex::new(settings),
            sound,
            email,
            updates,
        }
    }

    fn lock_log(&self) -> std::sync::MutexGuard<'_, AlertLog> {
        self.log.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append an alert and dispatch notifications for `Error` alerts
    pub fn record(&self, source_name: &str, message: &str, kind: AlertKind) -> AlertEntry {
        let entry = self.lock_log().record(source_name, message, kind);
        tracing::info!(
            source = %source_name,
            kind = %kind,
            id = entry.id,
            "Alert: {}",
            message
        );
        let _ = self.updates.send(AlertUpdate::Recorded {
            entry: entry.clone(),
        });

        if kind == AlertKind::Error {
            let settings = self.settings();
            if settings.audible_enabled {
                self.sound.play();
            }
            if settings.email_enabled && !settings.email_address.trim().is_empty() {
                self.email.dispatch(
                    settings.email_address.clone(),
                    alert_subject(&entry.source_name),
                    alert_body(&entry.source_name, &entry.message, entry.timestamp),
                );
            }
        }
        entry
    }

    /// Entries newest-first
    pub fn entries(&self) -> Vec<AlertEntry> {
        self.lock_log().entries()
    }

    pub fn clear(&self) {
        self.lock_log().clear();
        let _ = self.updates.send(AlertUpdate::Cleared);
    }

    pub fn mark_read(&self) {
        self.lock_log().mark_read();
        let _ = self.updates.send(AlertUpdate::Read);
    }

    pub fn open_viewer(&self) {
        self.lock_log().open_viewer();
        let _ = self.updates.send(AlertUpdate::Read);
    }

    pub fn close_viewer(&self) {
        self.lock_log().close_viewer();
    }

    pub fn has_unread(&self) -> bool {
        self.lock_log().has_unread()
    }

    pub fn unread_count(&self) -> usize {
        self.lock_log().unread_count()
    }

    pub fn settings(&self) -> AlertSettings {
        self.settings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace notification settings
    ///
    /// A non-empty address must look like `local@domain.tld`.
    pub fn set_settings(&self, settings: AlertSettings) -> Result<(), AlertSettingsError> {
        let address = settings.email_address.trim();
        if !address.is_empty() && !is_valid_address(address) {
            return Err(AlertSettingsError::InvalidAddress(address.to_string()));
        }
        tracing::info!(
            audible = settings.audible_enabled,
            email = settings.email_enabled,
            "Alert settings updated"
        );
        *self.settings.lock().unwrap_or_else(|e| e.into_inner()) = settings;
        Ok(())
    }

    /// The audible channel, for the user-gesture resume hook
    pub fn sound(&self) -> &Arc<dyn AlertSound> {
        &self.sound
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AlertUpdate> {
        self.updates.subscribe()
    }

    /// Consume controller transitions until every sender is gone
    ///
    /// Alerts carried by events are recorded in arrival order; every event
    /// is then re-broadcast on `transitions` for UI subscribers.
    pub fn spawn_intake(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<TransitionEvent>,
        transitions: broadcast::Sender<TransitionEvent>,
    ) -> JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let Some(alert) = &event.alert {
                    router.record(&event.source_name, &alert.message, alert.kind);
                }
                let _ = transitions.send(event);
            }
            tracing::debug!("Alert intake closed");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::email::{NotificationTransport, NotifyError};
    use crate::alerts::tone::SilentSound;
    use crate::monitor::state::{AlertRequest, ConnectionState};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Transport that blocks until released and counts calls
    struct GatedTransport {
        calls: AtomicUsize,
        release: Notify,
    }

    #[async_trait]
    impl NotificationTransport for GatedTransport {
        async fn send_notification(
            &self,
            _to: &str,
            _subject: &str,
            _body: &str,
        ) -> Result<(), NotifyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            Ok(())
        }
    }

    fn router_with(
        settings: AlertSettings,
    ) -> (Arc<AlertRouter>, Arc<SilentSound>, Arc<GatedTransport>) {
        let sound = Arc::new(SilentSound::new());
        let transport = Arc::new(GatedTransport {
            calls: AtomicUsize::new(0),
            release: Notify::new(),
        });
        let router = Arc::new(AlertRouter::new(
            settings,
            100,
            sound.clone(),
            EmailChannel::new(transport.clone()),
        ));
        (router, sound, transport)
    }

    #[tokio::test]
    async fn test_error_plays_tone_recovery_does_not() {
        let (router, sound, _) = router_with(AlertSettings::default());
        router.record("A", "Fatal error detected", AlertKind::Error);
        router.record("A", "Stream recovered", AlertKind::Recovery);
        assert_eq!(sound.plays(), 1);
        assert_eq!(router.entries().len(), 2);
    }

    #[tokio::test]
    async fn test_audible_disabled() {
        let settings = AlertSettings {
            audible_enabled: false,
            ..AlertSettings::default()
        };
        let (router, sound, _) = router_with(settings);
        router.record("A", "Stream stalled", AlertKind::Error);
        assert_eq!(sound.plays(), 0);
    }

    #[tokio::test]
    async fn test_overlapping_emails_are_dropped() {
        let settings = AlertSettings {
            audible_enabled: false,
            email_enabled: true,
            email_address: "ops@example.com".into(),
        };
        let (router, _, transport) = router_with(settings);

        router.record("A", "Fatal error detected", AlertKind::Error);
        router.record("B", "Stream stalled", AlertKind::Error);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);

        // Once the first dispatch resolves, the next trigger goes out
        transport.release.notify_one();
        tokio::time::sleep(Duration::from_millis(20)).await;
        router.record("C", "Stream stalled", AlertKind::Error);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 2);
        transport.release.notify_one();
    }

    #[tokio::test]
    async fn test_email_needs_address() {
        let settings = AlertSettings {
            audible_enabled: false,
            email_enabled: true,
            email_address: String::new(),
        };
        let (router, _, transport) = router_with(settings);
        router.record("A", "Fatal error detected", AlertKind::Error);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_invalid_address_rejected() {
        let (router, _, _) = router_with(AlertSettings::default());
        let bad = AlertSettings {
            email_address: "not-an-address".into(),
            ..AlertSettings::default()
        };
        assert_eq!(
            router.set_settings(bad),
            Err(AlertSettingsError::InvalidAddress("not-an-address".into()))
        );
        assert_eq!(router.settings(), AlertSettings::default());
    }

    #[tokio::test]
    async fn test_intake_records_and_rebroadcasts() {
        let (router, _, _) = router_with(AlertSettings::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let (transitions, mut transitions_rx) = broadcast::channel(16);
        let mut updates = router.subscribe();
        let intake = router.spawn_intake(rx, transitions);

        let event = TransitionEvent {
            source_id: "a".into(),
            source_name: "Studio A".into(),
            from: ConnectionState::Connected,
            to: ConnectionState::Error,
            message: Some("Fatal error detected".into()),
            alert: Some(AlertRequest {
                kind: AlertKind::Error,
                message: "Fatal error detected".into(),
            }),
            at: chrono::Utc::now(),
        };
        tx.send(event.clone()).unwrap();
        drop(tx);

        assert_eq!(transitions_rx.recv().await.unwrap(), event);
        match updates.recv().await.unwrap() {
            AlertUpdate::Recorded { entry } => {
                assert_eq!(entry.source_name, "Studio A");
                assert_eq!(entry.kind, AlertKind::Error);
            }
            other => panic!("unexpected update {:?}", other),
        }
        intake.await.unwrap();
        assert!(router.has_unread());
    }

    #[tokio::test]
    async fn test_clear_and_read_notify_subscribers() {
        let (router, _, _) = router_with(AlertSettings::default());
        let mut updates = router.subscribe();
        router.record("A", "x", AlertKind::Error);
        router.mark_read();
        router.clear();
        assert!(matches!(updates.recv().await, Ok(AlertUpdate::Recorded { .. })));
        assert_eq!(updates.recv().await.unwrap(), AlertUpdate::Read);
        assert_eq!(updates.recv().await.unwrap(), AlertUpdate::Cleared);
        assert!(router.entries().is_empty());
    }
}
