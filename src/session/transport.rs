//! Byte transports the session runs over.
//!
//! A [`Transport`] is a duplex byte pipe with bounded-time reads. The
//! production implementation wraps a serial port; [`crate::session::memory`]
//! provides an in-process pipe for tests and the demo.

use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::time::Duration;

/// Where to connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortTarget {
    /// Device path or port name (e.g. `/dev/ttyACM0`, `COM3`)
    pub path: String,
    /// Line rate in baud
    pub baud_rate: u32,
}

impl PortTarget {
    /// Target a port at the given baud rate.
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
        }
    }
}

impl std::fmt::Display for PortTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.path, self.baud_rate)
    }
}

/// Transport failures. All of them end the current connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    Open { port: String, message: String },
    Read(String),
    Write(String),
    Control(String),
    /// The other end went away
    Closed,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Open { port, message } => write!(f, "Failed to open {port}: {message}"),
            TransportError::Read(e) => write!(f, "Read error: {e}"),
            TransportError::Write(e) => write!(f, "Write error: {e}"),
            TransportError::Control(e) => write!(f, "Control line error: {e}"),
            TransportError::Closed => write!(f, "Transport closed"),
        }
    }
}

impl std::error::Error for TransportError {}

/// A duplex byte stream with bounded-time reads.
pub trait Transport: Send {
    /// Read whatever is available, waiting at most the transport's read
    /// timeout. `Ok(0)` means nothing arrived and is not an error.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Write all bytes and flush.
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Drive the hardware reset line. Returns `Ok(false)` when the transport
    /// has no such line.
    fn set_reset_line(&mut self, asserted: bool) -> Result<bool, TransportError>;

    /// Throw away anything buffered on the input side.
    fn discard_input(&mut self) -> Result<(), TransportError>;

    /// Human-readable name for logs.
    fn name(&self) -> &str;
}

/// Opens transports for a target. Owned by the session worker.
pub trait Connector: Send {
    fn open(&mut self, target: &PortTarget) -> Result<Box<dyn Transport>, TransportError>;
}

/// Serial port transport. The reset line is DTR.
pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
    name: String,
}

impl SerialTransport {
    /// Open a serial port with the given read timeout.
    pub fn open(target: &PortTarget, read_timeout: Duration) -> Result<Self, TransportError> {
        let port = serialport::new(&target.path, target.baud_rate)
            .timeout(read_timeout)
            .open()
            .map_err(|e| TransportError::Open {
                port: target.path.clone(),
                message: e.to_string(),
            })?;

        Ok(Self {
            port,
            name: target.path.clone(),
        })
    }
}

impl Transport for SerialTransport {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::Interrupted
                ) =>
            {
                Ok(0)
            }
            Err(e) => Err(TransportError::Read(e.to_string())),
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.port
            .write_all(bytes)
            .and_then(|_| self.port.flush())
            .map_err(|e| TransportError::Write(e.to_string()))
    }

    fn set_reset_line(&mut self, asserted: bool) -> Result<bool, TransportError> {
        self.port
            .write_data_terminal_ready(asserted)
            .map(|_| true)
            .map_err(|e| TransportError::Control(e.to_string()))
    }

    fn discard_input(&mut self) -> Result<(), TransportError> {
        self.port
            .clear(serialport::ClearBuffer::All)
            .map_err(|e| TransportError::Control(e.to_string()))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Opens [`SerialTransport`]s.
#[derive(Debug, Clone)]
pub struct SerialConnector {
    read_timeout: Duration,
}

impl SerialConnector {
    /// Connector whose ports wait at most `read_timeout` per read.
    pub fn new(read_timeout: Duration) -> Self {
        Self { read_timeout }
    }
}

impl Default for SerialConnector {
    fn default() -> Self {
        Self::new(Duration::from_millis(20))
    }
}

impl Connector for SerialConnector {
    fn open(&mut self, target: &PortTarget) -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(SerialTransport::open(target, self.read_timeout)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_port_fails() {
        let target = PortTarget::new("/dev/card-detector-does-not-exist", 115_200);
        let err = SerialConnector::default().open(&target).err();
        assert!(matches!(err, Some(TransportError::Open { .. })));
    }

    #[test]
    fn test_target_display() {
        assert_eq!(
            PortTarget::new("/dev/ttyACM0", 115_200).to_string(),
            "/dev/ttyACM0@115200"
        );
    }
}
