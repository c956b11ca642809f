//! Completed-cycle counters.
//!
//! The session count lives only in memory; the total count is persisted to
//! JSON after every change so it survives restarts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Envelope cycle counters.
#[derive(Debug)]
pub struct Counters {
    /// Cycles completed since this process started
    session_count: AtomicU64,
    /// Cycles completed over the lifetime of the installation
    total_count: AtomicU64,
    /// Session start time
    session_start: DateTime<Utc>,
    /// Identifies this process run in the persisted file
    run_id: Uuid,
    /// Path for persisting the total
    persist_path: Option<PathBuf>,
}

impl Counters {
    /// In-memory counters starting at zero.
    pub fn new() -> Self {
        Self {
            session_count: AtomicU64::new(0),
            total_count: AtomicU64::new(0),
            session_start: Utc::now(),
            run_id: Uuid::new_v4(),
            persist_path: None,
        }
    }

    /// Create counters backed by a file, resuming the stored total.
    ///
    /// A file that cannot be parsed is renamed aside before anything is
    /// written, keeping its content for recovery. If it cannot be read or
    /// moved, persistence stays off for this run.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut counters = Self::new();

        match read_persisted_total(&path) {
            Ok(Some(total)) => counters.total_count.store(total, Ordering::Relaxed),
            Ok(None) => {}
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                let aside = corrupt_path(&path);
                if let Err(rename_err) = std::fs::rename(&path, &aside) {
                    tracing::error!(
                        error = %e,
                        rename_error = %rename_err,
                        path = %path.display(),
                        "Counters file is unreadable; not persisting this run"
                    );
                    return counters;
                }
                tracing::error!(
                    error = %e,
                    moved_to = %aside.display(),
                    "Counters file is unreadable; moved aside and starting from zero"
                );
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    path = %path.display(),
                    "Could not load previous counters; not persisting this run"
                );
                return counters;
            }
        }

        counters.persist_path = Some(path);
        counters
    }

    /// Whether the total is being written to disk.
    pub fn is_persistent(&self) -> bool {
        self.persist_path.is_some()
    }

    /// Count one completed envelope cycle and persist the new total.
    pub fn record_cycle(&self) -> CounterSnapshot {
        self.session_count.fetch_add(1, Ordering::Relaxed);
        self.total_count.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = self.save() {
            tracing::warn!(error = %e, "Failed to persist counters");
        }
        self.snapshot()
    }

    /// Current values.
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            session_count: self.session_count.load(Ordering::Relaxed),
            total_count: self.total_count.load(Ordering::Relaxed),
            session_start: self.session_start,
        }
    }

    /// Get a summary string for display.
    pub fn summary(&self) -> String {
        let snapshot = self.snapshot();
        format!(
            "Counters:\n\
             - This session: {}\n\
             - Total: {}\n\
             - Session running for {} seconds",
            snapshot.session_count,
            snapshot.total_count,
            (Utc::now() - snapshot.session_start).num_seconds().max(0)
        )
    }

    /// Save the total to disk.
    ///
    /// Writes a sibling temp file and renames it over the target, so a crash
    /// leaves either the old or the new file.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let persisted = PersistedCounters {
                total_count: self.total_count.load(Ordering::Relaxed),
                last_run_id: self.run_id,
                last_updated: Utc::now(),
            };

            let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;

            let tmp = sibling(path, "tmp");
            std::fs::write(&tmp, json)?;
            std::fs::rename(&tmp, path)?;
        }
        Ok(())
    }

    /// Reset the session count. The total is never reset.
    pub fn reset_session(&self) {
        self.session_count.store(0, Ordering::Relaxed);
    }
}

impl Default for Counters {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub session_count: u64,
    pub total_count: u64,
    pub session_start: DateTime<Utc>,
}

/// On-disk format.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedCounters {
    total_count: u64,
    last_run_id: Uuid,
    last_updated: DateTime<Utc>,
}

/// Read the persisted total without creating counters.
///
/// Unparseable content is reported as [`std::io::ErrorKind::InvalidData`].
pub fn read_persisted_total(path: &Path) -> Result<Option<u64>, std::io::Error> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)?;
    let persisted: PersistedCounters = serde_json::from_str(&content)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(persisted.total_count))
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// `counters.json` -> `counters.json.corrupt-20261019T101500`
fn corrupt_path(path: &Path) -> PathBuf {
    sibling(
        path,
        &format!("corrupt-{}", Utc::now().format("%Y%m%dT%H%M%S%.3f")),
    )
}

/// Thread-safe shared counters.
pub type SharedCounters = Arc<Counters>;

/// Shared in-memory counters.
pub fn create_shared_counters() -> SharedCounters {
    Arc::new(Counters::new())
}

/// Shared counters persisted to `path`.
pub fn create_shared_counters_with_persistence(path: PathBuf) -> SharedCounters {
    Arc::new(Counters::with_persistence(path))
}
