//! Wire protocol shared by the device and the host.
//!
//! One ASCII message per newline-terminated line, colon/comma delimited.

pub mod codec;
pub mod frame;

// Re-export commonly used types
pub use codec::{decode, encode, LineDecoder, MAX_LINE_LEN};
pub use frame::{
    validate_floor, validate_threshold, validate_upper_threshold, Command, DeviceEvent,
    ErrorKind, Frame, Role, Telemetry, ValidationError, ADC_MAX,
};
