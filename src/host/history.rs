//! Bounded error history and the durable log behind it.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Entries kept in memory.
pub const HISTORY_CAPACITY: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Local>,
    pub message: String,
    pub kind: EntryKind,
}

impl std::fmt::Display for HistoryEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.timestamp.format("%H:%M:%S"), self.message)
    }
}

/// Newest-first ring of the most recent entries.
#[derive(Debug, Clone, Default)]
pub struct ErrorHistory {
    entries: VecDeque<HistoryEntry>,
}

impl ErrorHistory {
    /// Empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert at the front, evicting the oldest entry when full.
    pub fn push(&mut self, entry: HistoryEntry) {
        self.entries.push_front(entry);
        self.entries.truncate(HISTORY_CAPACITY);
    }

    /// Entries, newest first.
    pub fn entries(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    /// Most recent entry.
    pub fn latest(&self) -> Option<&HistoryEntry> {
        self.entries.front()
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Unbounded, append-only record of history entries.
pub trait LogSink: Send {
    fn append(
        &mut self,
        timestamp: DateTime<Local>,
        message: &str,
        kind: EntryKind,
    ) -> std::io::Result<()>;
}

/// Appends `[YYYY-mm-dd HH:MM:SS] message` lines to a text file.
#[derive(Debug, Clone)]
pub struct FileLogSink {
    path: PathBuf,
}

impl FileLogSink {
    /// Append to `path`, creating it on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// File being appended to.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl LogSink for FileLogSink {
    fn append(
        &mut self,
        timestamp: DateTime<Local>,
        message: &str,
        _kind: EntryKind,
    ) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(
            file,
            "[{}] {}",
            timestamp.format("%Y-%m-%d %H:%M:%S"),
            message
        )
    }
}

/// Keeps appended entries in memory; clones share storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryLogSink {
    entries: Arc<Mutex<Vec<HistoryEntry>>>,
}

impl MemoryLogSink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything appended so far.
    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl LogSink for MemoryLogSink {
    fn append(
        &mut self,
        timestamp: DateTime<Local>,
        message: &str,
        kind: EntryKind,
    ) -> std::io::Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(HistoryEntry {
                timestamp,
                message: message.to_string(),
                kind,
            });
        Ok(())
    }
}
