//! Operator-side bookkeeping.
//!
//! The [`HostReconciler`] consumes session events, keeps counters, the error
//! history and the display state up to date, and turns operator actions into
//! device commands. Everything it learns is published as a [`Notification`];
//! it never renders anything itself.

use super::counters::{CounterSnapshot, SharedCounters};
use super::history::{EntryKind, ErrorHistory, HistoryEntry, LogSink};
use crate::config::{Config, ConfigError, ConfigStore, LogVerbosity};
use crate::device::{DeviceConfig, SENSOR_MAX, SENSOR_MIN};
use crate::protocol::{Command, DeviceEvent, ErrorKind, Frame, Telemetry, ValidationError};
use crate::session::{PortTarget, SessionEvent, SessionHandle};
use chrono::Local;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};

/// Capacity of the notification channel.
const NOTIFICATION_CAPACITY: usize = 1024;

/// Where operator commands go. Implemented by [`SessionHandle`].
pub trait CommandSink: Send {
    fn send(&self, command: Command) -> Result<(), ValidationError>;
    fn replace_config(&self, config: DeviceConfig);
    fn retarget(&self, target: Option<PortTarget>);
}

impl CommandSink for SessionHandle {
    fn send(&self, command: Command) -> Result<(), ValidationError> {
        SessionHandle::send(self, command)
    }

    fn replace_config(&self, config: DeviceConfig) {
        SessionHandle::replace_config(self, config)
    }

    fn retarget(&self, target: Option<PortTarget>) {
        SessionHandle::retarget(self, target)
    }
}

/// Latest telemetry, converted for display.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveReading {
    pub raw: u16,
    pub millimetres: f64,
    pub envelope: bool,
    pub stop: bool,
    /// Raw value outside the sensor's working band
    pub out_of_range: bool,
}

impl LiveReading {
    /// `millimetres = (raw - floor) * factor`, or 0.0 when out of range.
    pub fn from_telemetry(telemetry: &Telemetry, floor_value: u16, factor: f64) -> Self {
        let out_of_range = !(SENSOR_MIN..=SENSOR_MAX).contains(&telemetry.adc);
        let millimetres = if out_of_range {
            0.0
        } else {
            (f64::from(telemetry.adc) - f64::from(floor_value)) * factor
        };

        Self {
            raw: telemetry.adc,
            millimetres,
            envelope: telemetry.envelope,
            stop: telemetry.stop,
            out_of_range,
        }
    }
}

/// What presentation code is told about.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    ConnectionChanged { connected: bool, detail: String },
    TelemetryUpdated(LiveReading),
    /// `event` is `None` when the display was reset by the operator
    EventOccurred {
        event: Option<DeviceEvent>,
        label: String,
    },
    CountersChanged(CounterSnapshot),
    HistoryChanged,
}

/// Display label shown while nothing is wrong.
pub const READY_LABEL: &str = "System Ready";

pub struct HostReconciler<S: CommandSink> {
    sink: S,
    store: Box<dyn ConfigStore>,
    config: Config,
    counters: SharedCounters,
    history: ErrorHistory,
    log_sink: Box<dyn LogSink>,
    notifications: Sender<Notification>,
    connected: Option<String>,
    live: Option<LiveReading>,
    last_event: String,
    last_error: Option<String>,
}

impl<S: CommandSink> HostReconciler<S> {
    /// Create the reconciler and the notification stream it feeds.
    pub fn new(
        sink: S,
        store: Box<dyn ConfigStore>,
        config: Config,
        counters: SharedCounters,
        log_sink: Box<dyn LogSink>,
    ) -> (Self, Receiver<Notification>) {
        let (tx, rx) = bounded(NOTIFICATION_CAPACITY);
        let reconciler = Self {
            sink,
            store,
            config,
            counters,
            history: ErrorHistory::new(),
            log_sink,
            notifications: tx,
            connected: None,
            live: None,
            last_event: READY_LABEL.to_string(),
            last_error: None,
        };
        (reconciler, rx)
    }

    /// Configuration as last saved.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Current counter values.
    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Counters formatted for display.
    pub fn counters_summary(&self) -> String {
        self.counters.summary()
    }

    /// Recent errors, newest first.
    pub fn history(&self) -> &ErrorHistory {
        &self.history
    }

    /// Latest telemetry, if any arrived this connection.
    pub fn live(&self) -> Option<&LiveReading> {
        self.live.as_ref()
    }

    /// Label of the most recent event.
    pub fn last_event(&self) -> &str {
        &self.last_event
    }

    /// Error shown until the next resume.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Port of the live connection, if any.
    pub fn connected_port(&self) -> Option<&str> {
        self.connected.as_deref()
    }

    /// Whether the session is live.
    pub fn is_connected(&self) -> bool {
        self.connected.is_some()
    }

    /// Apply one session event.
    pub fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Connected { port } => {
                self.connected = Some(port.clone());
                self.record(EntryKind::Info, format!("Connected to {port}"));
                self.notify(Notification::ConnectionChanged {
                    connected: true,
                    detail: port,
                });
            }
            SessionEvent::Disconnected { reason } => {
                self.connected = None;
                self.live = None;
                self.record(EntryKind::Info, format!("Disconnected: {reason}"));
                self.notify(Notification::ConnectionChanged {
                    connected: false,
                    detail: reason,
                });
            }
            SessionEvent::Frame(frame) => self.handle_frame(frame),
        }
    }

    fn handle_frame(&mut self, frame: Frame) {
        match frame {
            Frame::Telemetry(telemetry) => {
                let reading = LiveReading::from_telemetry(
                    &telemetry,
                    self.config.floor_value,
                    self.config.factor,
                );
                self.live = Some(reading.clone());
                self.notify(Notification::TelemetryUpdated(reading));
            }
            Frame::Event(event) => self.handle_device_event(event),
            Frame::Log(text) => tracing::debug!(%text, "Device log"),
            Frame::Status(text) => tracing::info!(%text, "Device status"),
            // Commands never travel device-to-host
            Frame::Command(command) => tracing::debug!(?command, "Ignoring echoed command"),
        }
    }

    fn handle_device_event(&mut self, event: DeviceEvent) {
        let label = match &event {
            DeviceEvent::Pass { peak } => {
                self.record(EntryKind::Info, format!("PASS (Max: {peak})"));
                "PASS OK".to_string()
            }
            DeviceEvent::PassOverride { peak } => {
                self.record(EntryKind::Info, format!("PASS OVERRIDE (Max: {peak})"));
                "PASS OVERRIDE".to_string()
            }
            DeviceEvent::Error { kind, peak } => {
                let detail = match peak {
                    Some(peak) => format!("{kind}:{peak}"),
                    None => kind.to_string(),
                };
                self.record(EntryKind::Error, detail.clone());
                let label = format!("STOP: {detail}");
                self.last_error = Some(label.clone());
                label
            }
        };

        self.last_event = label.clone();
        let counted = completes_cycle(&event);
        self.notify(Notification::EventOccurred {
            event: Some(event),
            label,
        });

        if counted {
            let snapshot = self.counters.record_cycle();
            self.notify(Notification::CountersChanged(snapshot));
        }
    }

    /// Operator resume: clear the device fault and the local indicator.
    pub fn resume(&mut self) -> Result<(), ValidationError> {
        self.sink.send(Command::Resume)?;
        self.last_error = None;
        self.last_event = READY_LABEL.to_string();
        self.notify(Notification::EventOccurred {
            event: None,
            label: self.last_event.clone(),
        });
        Ok(())
    }

    /// Validate, persist, then upload new device settings.
    pub fn save_config(&mut self, device: DeviceConfig, factor: f64) -> Result<(), ConfigError> {
        let mut updated = self.config.clone();
        updated.apply_device(&device);
        updated.factor = factor;
        updated.validate()?;

        self.store.save(&updated)?;
        self.config = updated;

        self.sink.replace_config(device);
        for command in device.commands() {
            self.sink.send(command)?;
        }
        tracing::info!(?device, factor, "Settings saved and uploaded");
        Ok(())
    }

    /// Change the connection target and persist it.
    pub fn set_target(&mut self, target: Option<PortTarget>) -> Result<(), ConfigError> {
        let mut updated = self.config.clone();
        match &target {
            Some(t) => {
                updated.serial_port = t.path.clone();
                updated.baud_rate = t.baud_rate;
            }
            None => updated.serial_port.clear(),
        }
        updated.validate()?;
        self.store.save(&updated)?;
        self.config = updated;
        self.sink.retarget(target);
        Ok(())
    }

    /// Change and persist the log verbosity.
    pub fn set_verbosity(&mut self, verbosity: LogVerbosity) -> Result<(), ConfigError> {
        let mut updated = self.config.clone();
        updated.log_verbosity = verbosity;
        self.store.save(&updated)?;
        self.config = updated;
        Ok(())
    }

    /// Errors always reach the history; info entries only at `info` verbosity.
    fn record(&mut self, kind: EntryKind, message: String) {
        if kind == EntryKind::Info && self.config.log_verbosity != LogVerbosity::Info {
            return;
        }

        let timestamp = Local::now();
        if let Err(e) = self.log_sink.append(timestamp, &message, kind) {
            tracing::warn!(error = %e, "Failed to append to error log");
        }
        self.history.push(HistoryEntry {
            timestamp,
            message,
            kind,
        });
        self.notify(Notification::HistoryChanged);
    }

    fn notify(&self, notification: Notification) {
        match self.notifications.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => tracing::debug!("Notification queue full; dropping"),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// Whether an event ends an envelope cycle (and so is counted).
///
/// Passes always do. Faults do when they come from evaluating a cycle,
/// which the device marks by attaching the peak.
fn completes_cycle(event: &DeviceEvent) -> bool {
    match event {
        DeviceEvent::Pass { .. } | DeviceEvent::PassOverride { .. } => true,
        DeviceEvent::Error { kind, peak } => {
            peak.is_some() || matches!(kind, ErrorKind::EmptyEnvelope | ErrorKind::DoubleCard)
        }
    }
}
