//! Typed frames carried over the serial line.
//!
//! Every line on the wire maps to exactly one [`Frame`]. Consumers match on
//! the closed set of variants instead of testing string prefixes.

use serde::{Deserialize, Serialize};

/// Largest value the 10-bit ADC can produce.
pub const ADC_MAX: u16 = 1023;

/// Periodic sensor reading sent by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Telemetry {
    /// Conditioned ADC value (0..=1023)
    pub adc: u16,
    /// Whether an envelope is currently over the sensor
    pub envelope: bool,
    /// Whether the machine stop output is active (device faulted)
    pub stop: bool,
}

/// Fault categories reported with `ERR:` lines.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    SensorOutOfRange,
    EmptyEnvelope,
    DoubleCard,
    WatchdogTimeout,
    /// `ERR:` line without a type token
    Unknown,
    /// A type token this build does not know about
    Other(String),
}

impl ErrorKind {
    /// Wire token for this kind.
    pub fn as_str(&self) -> &str {
        match self {
            ErrorKind::SensorOutOfRange => "SENSOR_OUT_OF_RANGE",
            ErrorKind::EmptyEnvelope => "EMPTY_ENVELOPE",
            ErrorKind::DoubleCard => "DOUBLE_CARD",
            ErrorKind::WatchdogTimeout => "WATCHDOG_TIMEOUT",
            ErrorKind::Unknown => "UNKNOWN",
            ErrorKind::Other(token) => token,
        }
    }

    /// Parse a wire token. Empty tokens map to [`ErrorKind::Unknown`].
    pub fn from_token(token: &str) -> Self {
        match token.trim() {
            "" | "UNKNOWN" => ErrorKind::Unknown,
            "SENSOR_OUT_OF_RANGE" => ErrorKind::SensorOutOfRange,
            "EMPTY_ENVELOPE" => ErrorKind::EmptyEnvelope,
            "DOUBLE_CARD" => ErrorKind::DoubleCard,
            "WATCHDOG_TIMEOUT" => ErrorKind::WatchdogTimeout,
            other => ErrorKind::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of an envelope cycle, or a fault, as reported by the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceEvent {
    /// Card detected; peak was inside the accepted band
    Pass { peak: u16 },
    /// Cycle completed while the system override was enabled
    PassOverride { peak: u16 },
    /// Fault; `peak` is only present for cycle-related faults
    Error { kind: ErrorKind, peak: Option<u16> },
}

impl DeviceEvent {
    /// Whether the cycle was accepted, with or without override.
    pub fn is_pass(&self) -> bool {
        matches!(self, DeviceEvent::Pass { .. } | DeviceEvent::PassOverride { .. })
    }

    /// Peak value carried by the event, 0 when absent.
    pub fn peak(&self) -> u16 {
        match self {
            DeviceEvent::Pass { peak } | DeviceEvent::PassOverride { peak } => *peak,
            DeviceEvent::Error { peak, .. } => peak.unwrap_or(0),
        }
    }
}

/// Host-to-device commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    SetFloor(u16),
    SetThreshold(u16),
    SetUpperThreshold(u16),
    SetReverse(bool),
    SetOverride(bool),
    Resume,
    Ping,
}

impl Command {
    /// Check that the command carries an in-range value.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match *self {
            Command::SetFloor(v) => validate_floor(v),
            Command::SetThreshold(v) => validate_threshold(v),
            Command::SetUpperThreshold(v) => validate_upper_threshold(v),
            Command::SetReverse(_) | Command::SetOverride(_) | Command::Resume | Command::Ping => {
                Ok(())
            }
        }
    }
}

/// A single decoded line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    Telemetry(Telemetry),
    Event(DeviceEvent),
    Command(Command),
    /// `LOG:` line, informational only
    Log(String),
    /// `MSG:` line, informational only
    Status(String),
}

/// Which end of the link a decoder runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Operator side: decodes telemetry, events, logs and status lines
    Host,
    /// Sensing side: decodes commands only
    Device,
}

impl Frame {
    /// The role that decodes this frame when it arrives.
    pub fn receiver(&self) -> Role {
        match self {
            Frame::Command(_) => Role::Device,
            _ => Role::Host,
        }
    }
}

/// Values that cannot be configured or put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    FloorOutOfRange(u16),
    ThresholdOutOfRange(u16),
    UpperThresholdOutOfRange(u16),
    UpperBelowThreshold { upper: u16, threshold: u16 },
    /// `LOG:`/`MSG:` text with a line break
    MultiLineText(String),
    /// Error token that would not decode to the same kind
    BadErrorToken(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::FloorOutOfRange(v) => {
                write!(f, "floor value {v} outside 0..={ADC_MAX}")
            }
            ValidationError::ThresholdOutOfRange(v) => {
                write!(f, "card threshold {v} outside 1..={ADC_MAX}")
            }
            ValidationError::UpperThresholdOutOfRange(v) => {
                write!(f, "card upper threshold {v} outside 1..={ADC_MAX}")
            }
            ValidationError::UpperBelowThreshold { upper, threshold } => write!(
                f,
                "card upper threshold {upper} is below card threshold {threshold}"
            ),
            ValidationError::MultiLineText(text) => {
                write!(f, "text {text:?} does not fit on one line")
            }
            ValidationError::BadErrorToken(token) => {
                write!(f, "error token {token:?} cannot be sent")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Floor values span the whole ADC range.
pub fn validate_floor(value: u16) -> Result<(), ValidationError> {
    if value <= ADC_MAX {
        Ok(())
    } else {
        Err(ValidationError::FloorOutOfRange(value))
    }
}

/// Card thresholds must be at least 1.
pub fn validate_threshold(value: u16) -> Result<(), ValidationError> {
    if (1..=ADC_MAX).contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::ThresholdOutOfRange(value))
    }
}

/// Upper thresholds must be at least 1.
pub fn validate_upper_threshold(value: u16) -> Result<(), ValidationError> {
    if (1..=ADC_MAX).contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::UpperThresholdOutOfRange(value))
    }
}
