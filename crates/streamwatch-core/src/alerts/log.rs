//! Session alert log
//!
//! Entries are kept newest-first with monotonically increasing ids. The log
//! tracks whether anything arrived since the operator last looked at it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Default cap on retained entries
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Severity of an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    Error,
    Recovery,
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => f.write_str("error"),
            Self::Recovery => f.write_str("recovery"),
        }
    }
}

/// One immutable alert record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEntry {
    /// Creation order, starting at 1
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub source_name: String,
    pub message: String,
    pub kind: AlertKind,
}

/// Newest-first alert log with unread tracking
#[derive(Debug)]
pub struct AlertLog {
    entries: VecDeque<AlertEntry>,
    next_id: u64,
    unread: usize,
    viewing: bool,
    max_entries: usize,
}

impl Default for AlertLog {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl AlertLog {
    /// Create an empty log retaining at most `max_entries` (minimum 1)
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            next_id: 1,
            unread: 0,
            viewing: false,
            max_entries: max_entries.max(1),
        }
    }

    /// Append a new entry at the head and return it
    pub fn record(
        &mut self,
        source_name: impl Into<String>,
        message: impl Into<String>,
        kind: AlertKind,
    ) -> AlertEntry {
        let entry = AlertEntry {
            id: self.next_id,
            timestamp: Utc::now(),
            source_name: source_name.into(),
            message: message.into(),
            kind,
        };
        self.next_id += 1;
        self.entries.push_front(entry.clone());
        while self.entries.len() > self.max_entries {
            self.entries.pop_back();
        }
        if !self.viewing {
            self.unread += 1;
        }
        entry
    }

    /// Entries newest-first
    pub fn entries(&self) -> Vec<AlertEntry> {
        self.entries.iter().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AlertEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry. Ids keep increasing afterwards.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.unread = 0;
    }

    pub fn mark_read(&mut self) {
        self.unread = 0;
    }

    /// Operator opened the log; new entries no longer count as unread
    pub fn open_viewer(&mut self) {
        self.viewing = true;
        self.unread = 0;
    }

    pub fn close_viewer(&mut self) {
        self.viewing = false;
    }

    pub fn is_viewing(&self) -> bool {
        self.viewing
    }

    pub fn has_unread(&self) -> bool {
        self.unread > 0
    }

    /// Entries recorded since the last read, capped by retention
    pub fn unread_count(&self) -> usize {
        self.unread.min(self.entries.len())
    }
}
