//! Email alert channel
//!
//! Alerts are handed to a [`NotificationTransport`]. At most one dispatch
//! is in flight process-wide; triggers arriving meanwhile are dropped, never
//! queued. A dispatch that outlives [`DISPATCH_TIMEOUT`] is abandoned.
//! Transport failures are logged and go nowhere else.

use async_trait::async_trait;
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Upper bound for a single HTTP notification request
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound for a whole dispatch, whatever the transport
pub const DISPATCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Errors from a notification transport
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Endpoint rejected notification (status {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Notification endpoint not configured")]
    NotConfigured,

    #[error("Notification timed out after {0:?}")]
    TimedOut(Duration),
}

/// Outbound notification delivery
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    async fn send_notification(&self, to: &str, subject: &str, body: &str)
        -> Result<(), NotifyError>;
}

#[derive(Serialize)]
struct NotificationRequest<'a> {
    to: &'a str,
    subject: &'a str,
    body: &'a str,
}

/// Transport POSTing `{to, subject, body}` JSON to an HTTP endpoint
#[derive(Debug, Clone)]
pub struct HttpNotificationTransport {
    client: reqwest::Client,
    endpoint: Option<String>,
}

impl HttpNotificationTransport {
    pub fn new(endpoint: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Notification client without request timeout: {}", e);
                reqwest::Client::new()
            });
        Self {
            client,
            endpoint: endpoint.filter(|e| !e.trim().is_empty()),
        }
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.endpoint.as_deref()
    }
}

#[async_trait]
impl NotificationTransport for HttpNotificationTransport {
    async fn send_notification(
        &self,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), NotifyError> {
        let endpoint = self.endpoint.as_deref().ok_or(NotifyError::NotConfigured)?;
        let response = self
            .client
            .post(endpoint)
            .json(&NotificationRequest { to, subject, body })
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        // Endpoints report failures as {"error": "..."}
        let message = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(String::from))
            .unwrap_or_else(|| format!("HTTP error! status: {}", status.as_u16()));
        Err(NotifyError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

/// Email subject for an alert on `source_name`
pub fn alert_subject(source_name: &str) -> String {
    format!("[MultiViewer Alert] Stream: {}", source_name)
}

/// Email body for an alert, with the timestamp in local time
pub fn alert_body(source_name: &str, message: &str, at: DateTime<Utc>) -> String {
    format!(
        "An alert was triggered for stream: \"{}\"\n\nMessage: {}\n\nTimestamp: {}",
        source_name,
        message,
        at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
    )
}

/// Loose `local@domain.tld` shape check used before accepting an address
pub fn is_valid_address(address: &str) -> bool {
    let Some((local, domain)) = address.split_once('@') else {
        return false;
    };
    let clean = |s: &str| !s.is_empty() && !s.contains(char::is_whitespace) && !s.contains('@');
    if !clean(local) || !clean(domain) {
        return false;
    }
    match domain.rsplit_once('.') {
        Some((host, tld)) => !host.is_empty() && !tld.is_empty(),
        None => false,
    }
}

/// Clears the in-flight flag when a dispatch task ends, however it ends
struct InFlightGuard(Arc<AtomicBool>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Fire-and-forget email dispatcher with a single in-flight guard
#[derive(Clone)]
pub struct EmailChannel {
    transport: Arc<dyn NotificationTransport>,
    in_flight: Arc<AtomicBool>,
}

impl std::fmt::Debug for EmailChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailChannel")
            .field("in_flight", &self.is_busy())
            .finish()
    }
}

impl EmailChannel {
    pub fn new(transport: Arc<dyn NotificationTransport>) -> Self {
        Self {
            transport,
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether a dispatch is currently in flight
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Start a dispatch in the background
    ///
    /// Returns false when dropped because another dispatch is in flight or
    /// no tokio runtime is available.
    pub fn dispatch(&self, to: String, subject: String, body: String) -> bool {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("Email alert dropped, no async runtime");
            return false;
        };
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!(to = %to, "Email alert dropped, another dispatch in flight");
            return false;
        }

        let transport = Arc::clone(&self.transport);
        let guard = InFlightGuard(Arc::clone(&self.in_flight));
        runtime.spawn(async move {
            let _guard = guard;
            let send = transport.send_notification(&to, &subject, &body);
            let result = match tokio::time::timeout(DISPATCH_TIMEOUT, send).await {
                Ok(result) => result,
                Err(_) => Err(NotifyError::TimedOut(DISPATCH_TIMEOUT)),
            };
            match result {
                Ok(()) => tracing::info!(to = %to, "Email alert sent"),
                Err(e) => tracing::error!(to = %to, "Error sending email alert: {}", e),
            }
        });
        true
    }
}
