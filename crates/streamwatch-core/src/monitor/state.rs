//! Source identity, connection state, and status snapshots

use crate::alerts::log::AlertKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A configured live media source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    /// Opaque identifier, unique within a configuration
    pub id: String,
    /// Stream URL (empty means "no stream")
    #[serde(default)]
    pub url: String,
    /// Display name
    #[serde(default)]
    pub name: String,
    /// Optional title image reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title_image: Option<String>,
    /// Optional poster image reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poster_image: Option<String>,
}

impl Source {
    /// Create a source without image references
    pub fn new(id: impl Into<String>, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            name: name.into(),
            title_image: None,
            poster_image: None,
        }
    }

    /// Whether a stream URL is configured
    pub fn has_stream(&self) -> bool {
        !self.url.trim().is_empty()
    }

    /// Name used in alerts: the display name, or the URL when unnamed
    pub fn display_name(&self) -> &str {
        if self.name.trim().is_empty() {
            &self.url
        } else {
            &self.name
        }
    }
}

/// Health classification of one source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// No stream attached
    #[default]
    Idle,
    /// Attaching, or waiting for a pending retry
    Connecting,
    /// Engine reports playback
    Connected,
    /// Playback interrupted by buffering or missing data
    Stalled,
    /// Fatal or critical engine error
    Error,
}

impl ConnectionState {
    /// `Error` and `Stalled` are failure states
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Error | Self::Stalled)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "IDLE",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Stalled => "STALLED",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Latest published status of one source
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceStatus {
    pub state: ConnectionState,
    /// Human-readable detail of the last transition
    pub last_message: Option<String>,
    /// Consecutive retry attempts since the last confirmed connection
    pub attempt: u32,
    /// Time until the pending retry fires, if one is scheduled
    pub retry_in_ms: Option<u64>,
    pub updated_at: DateTime<Utc>,
}

impl Default for SourceStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Idle,
            last_message: None,
            attempt: 0,
            retry_in_ms: None,
            updated_at: Utc::now(),
        }
    }
}

/// Alert a transition asks the router to record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlertRequest {
    pub kind: AlertKind,
    pub message: String,
}

/// A state change emitted by a connection controller
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionEvent {
    pub source_id: String,
    pub source_name: String,
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub message: Option<String>,
    /// Present exactly when this transition opens or closes an outage
    pub alert: Option<AlertRequest>,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name_falls_back_to_url() {
        let named = Source::new("a", "Studio 1", "http://example.com/a.m3u8");
        assert_eq!(named.display_name(), "Studio 1");

        let unnamed = Source::new("b", "  ", "http://example.com/b.m3u8");
        assert_eq!(unnamed.display_name(), "http://example.com/b.m3u8");
    }

    #[test]
    fn test_has_stream() {
        assert!(Source::new("a", "A", "http://x/a.m3u8").has_stream());
        assert!(!Source::new("a", "A", "").has_stream());
        assert!(!Source::new("a", "A", "   ").has_stream());
    }

    #[test]
    fn test_failure_states() {
        assert!(ConnectionState::Error.is_failure());
        assert!(ConnectionState::Stalled.is_failure());
        assert!(!ConnectionState::Connecting.is_failure());
        assert!(!ConnectionState::Connected.is_failure());
        assert!(!ConnectionState::Idle.is_failure());
    }

    #[test]
    fn test_state_serializes_uppercase() {
        let json = serde_json::to_string(&ConnectionState::Connecting).unwrap();
        assert_eq!(json, "\"CONNECTING\"");
        assert_eq!(ConnectionState::Stalled.to_string(), "STALLED");
    }

    #[test]
    fn test_source_missing_fields_use_defaults() {
        let json = r#"{"id": "cell-1", "name": "Radio"}"#;
        let source: Source = serde_json::from_str(json).unwrap();
        assert_eq!(source.url, "");
        assert!(source.title_image.is_none());
        assert!(!source.has_stream());
    }
}
