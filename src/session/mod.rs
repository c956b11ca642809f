//! Host-side session with the device.
//!
//! The session owns the transport, runs the connect / handshake / reconnect
//! lifecycle and pumps frames between the wire and the host reconciler.

pub mod manager;
pub mod memory;
pub mod transport;

// Re-export commonly used types
pub use manager::{SessionEvent, SessionHandle, SessionManager, SessionState, SessionTiming};
pub use memory::{pipe, MemoryConnector, MemoryTransport};
pub use transport::{
    Connector, PortTarget, SerialConnector, SerialTransport, Transport, TransportError,
};
