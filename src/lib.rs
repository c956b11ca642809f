//! Card Detector Agent - envelope/card pass validation over a serial link.
//!
//! A distance sensor watches envelopes go by. The device side decides, per
//! envelope, whether a card was inside (pass) or not (fault) and reports it
//! over a line-oriented serial protocol. The host side keeps counters and an
//! error history, and pushes configuration back to the device.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────── device ────────────────────┐
//! │  ┌─────────────┐   ┌─────────────┐             │
//! │  │ Conditioner │──▶│  Detection  │──▶ frames ──┼──┐
//! │  │ (polarity)  │   │   Machine   │             │  │
//! │  └─────────────┘   └─────────────┘             │  │
//! └────────────────────────────────────────────────┘  │ D: / EVT: / ERR:
//!                                                     │ SET_* / RESUME / PING
//! ┌───────────────────── host ─────────────────────┐  │
//! │  ┌─────────────┐   ┌─────────────┐             │  │
//! │  │ Reconciler  │◀──│   Session   │◀────────────┼──┘
//! │  │ (counters,  │──▶│   Manager   │             │
//! │  │  history)   │   │ (transport) │             │
//! │  └─────────────┘   └─────────────┘             │
//! └────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use card_detector_agent::{device::DeviceConfig, session::*};
//!
//! let target = PortTarget::new("/dev/ttyACM0", 115_200);
//! let (manager, handle, events) = SessionManager::new(
//!     SerialConnector::default(),
//!     Some(target),
//!     DeviceConfig::default(),
//!     SessionTiming::default(),
//! );
//! let worker = manager.spawn().expect("spawn session thread");
//!
//! for event in events.iter().take(10) {
//!     println!("{event:?}");
//! }
//! handle.shutdown();
//! worker.join().ok();
//! ```

pub mod config;
pub mod device;
pub mod host;
pub mod protocol;
pub mod session;

// Re-export key types at crate root for convenience
pub use config::{Config, ConfigError, ConfigStore, JsonConfigStore, LogVerbosity};
pub use device::{DetectionMachine, DetectionState, DeviceConfig, DeviceController, Simulator};
pub use host::{HostReconciler, LiveReading, Notification, OperatorAction};
pub use protocol::{Command, DeviceEvent, ErrorKind, Frame, ValidationError};
pub use session::{SessionEvent, SessionHandle, SessionManager, SessionTiming};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
