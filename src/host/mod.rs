//! Operator side of the link.
//!
//! Counters, error history and the reconciler that ties session events and
//! operator actions together.

pub mod actions;
pub mod counters;
pub mod history;
pub mod reconciler;

pub use actions::OperatorAction;
pub use counters::{
    create_shared_counters, create_shared_counters_with_persistence, read_persisted_total,
    CounterSnapshot, Counters, SharedCounters,
};
pub use history::{
    EntryKind, ErrorHistory, FileLogSink, HistoryEntry, LogSink, MemoryLogSink, HISTORY_CAPACITY,
};
pub use reconciler::{CommandSink, HostReconciler, LiveReading, Notification, READY_LABEL};
