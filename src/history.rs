use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

pub const HISTORY_KEY: &str = "downloadHistory";

/// How a download ended. Serialized as `Completed`, `Canceled` or
/// `Failed: <cause>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum TerminalStatus {
    Completed,
    Canceled,
    Failed(String),
}

impl fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalStatus::Completed => f.write_str("Completed"),
            TerminalStatus::Canceled => f.write_str("Canceled"),
            TerminalStatus::Failed(cause) => write!(f, "Failed: {}", cause),
        }
    }
}

impl From<TerminalStatus> for String {
    fn from(status: TerminalStatus) -> Self {
        status.to_string()
    }
}

impl From<String> for TerminalStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "Completed" => TerminalStatus::Completed,
            "Canceled" => TerminalStatus::Canceled,
            other => TerminalStatus::Failed(
                other.strip_prefix("Failed: ").unwrap_or(other).to_string(),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: u64,
    pub filename: String,
    pub url: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub file_size: u64,
    pub total_size: i64,
    pub mime_type: String,
    pub status: TerminalStatus,
}

/// Newest-first list of finished downloads, capped at `limit` entries.
pub struct History {
    entries: VecDeque<HistoryEntry>,
    limit: usize,
}

impl History {
    pub fn new(limit: usize, entries: Vec<HistoryEntry>) -> Self {
        let mut entries = VecDeque::from(entries);
        entries.truncate(limit);
        Self { entries, limit }
    }

    pub fn push(&mut self, entry: HistoryEntry) {
        self.entries.push_front(entry);
        self.entries.truncate(self.limit);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries.iter().cloned().collect()
    }
}
