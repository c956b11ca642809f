//! Line codec for the ASCII serial protocol.
//!
//! The codec never touches a transport. [`LineDecoder`] turns a byte stream
//! into complete lines, [`decode`] classifies a line into a [`Frame`] and
//! [`encode`] produces the newline-terminated wire text.

use super::frame::{Command, DeviceEvent, ErrorKind, Frame, Role, Telemetry, ValidationError};

/// Lines longer than this are discarded up to the next newline.
pub const MAX_LINE_LEN: usize = 256;

/// Classify one line, with or without its delimiter.
///
/// Returns `None` for anything that is not a well-formed frame for `role`;
/// callers discard such lines and keep the session running. Only the line
/// delimiter is stripped, so `LOG:` and `MSG:` text keeps its whitespace.
pub fn decode(line: &str, role: Role) -> Option<Frame> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return None;
    }

    match role {
        Role::Host => decode_host(line.trim_start()),
        Role::Device => decode_command(line.trim()).map(Frame::Command),
    }
}

fn decode_host(line: &str) -> Option<Frame> {
    if let Some(rest) = line.strip_prefix("D:") {
        return decode_telemetry(rest).map(Frame::Telemetry);
    }
    if let Some(rest) = line.strip_prefix("EVT:") {
        return decode_pass(rest).map(Frame::Event);
    }
    if let Some(rest) = line.strip_prefix("ERR:") {
        return Some(Frame::Event(decode_error(rest)));
    }
    if let Some(rest) = line.strip_prefix("LOG:") {
        return Some(Frame::Log(rest.to_string()));
    }
    if let Some(rest) = line.strip_prefix("MSG:") {
        return Some(Frame::Status(rest.to_string()));
    }
    None
}

fn decode_telemetry(payload: &str) -> Option<Telemetry> {
    let parts: Vec<&str> = payload.split(',').map(str::trim).collect();
    if parts.len() < 3 {
        return None;
    }

    Some(Telemetry {
        adc: parts[0].parse().ok()?,
        envelope: parts[1] == "1",
        stop: parts[2] == "1",
    })
}

fn decode_pass(payload: &str) -> Option<DeviceEvent> {
    let mut tokens = payload.splitn(2, ':');
    let kind = tokens.next().unwrap_or_default();
    let peak = tokens
        .next()
        .and_then(|p| p.trim().parse().ok())
        .unwrap_or(0);

    match kind {
        "PASS" => Some(DeviceEvent::Pass { peak }),
        "PASS_OVERRIDE" => Some(DeviceEvent::PassOverride { peak }),
        _ => None,
    }
}

fn decode_error(payload: &str) -> DeviceEvent {
    let mut tokens = payload.splitn(2, ':');
    let kind = ErrorKind::from_token(tokens.next().unwrap_or_default());
    let peak = tokens.next().and_then(|p| p.trim().parse().ok());
    DeviceEvent::Error { kind, peak }
}

fn decode_command(line: &str) -> Option<Command> {
    match line {
        "PING" => return Some(Command::Ping),
        "RESUME" => return Some(Command::Resume),
        _ => {}
    }

    let (name, value) = line.split_once(':')?;
    let value = value.trim();
    match name {
        "SET_FLOOR" => value.parse().ok().map(Command::SetFloor),
        "SET_THR" => value.parse().ok().map(Command::SetThreshold),
        "SET_THR_UPPER" => value.parse().ok().map(Command::SetUpperThreshold),
        "SET_REVERSE" => parse_flag(value).map(Command::SetReverse),
        "SET_OVERRIDE" => parse_flag(value).map(Command::SetOverride),
        _ => None,
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value {
        "1" => Some(true),
        "0" => Some(false),
        _ => None,
    }
}

/// Encode a frame as a newline-terminated line.
///
/// Commands are range-checked first; a rejected command is never encoded.
/// Text containing a line break and error tokens that would decode to a
/// different kind are refused too, so every encoded line decodes back to
/// the same frame.
pub fn encode(frame: &Frame) -> Result<String, ValidationError> {
    let body = match frame {
        Frame::Telemetry(t) => format!(
            "D:{},{},{}",
            t.adc,
            u8::from(t.envelope),
            u8::from(t.stop)
        ),
        Frame::Event(DeviceEvent::Pass { peak }) => format!("EVT:PASS:{peak}"),
        Frame::Event(DeviceEvent::PassOverride { peak }) => format!("EVT:PASS_OVERRIDE:{peak}"),
        Frame::Event(DeviceEvent::Error { kind, peak }) => {
            check_error_kind(kind)?;
            match peak {
                Some(peak) => format!("ERR:{kind}:{peak}"),
                None => format!("ERR:{kind}"),
            }
        }
        Frame::Command(cmd) => {
            cmd.validate()?;
            encode_command(cmd)
        }
        Frame::Log(text) => format!("LOG:{}", single_line(text)?),
        Frame::Status(text) => format!("MSG:{}", single_line(text)?),
    };
    Ok(body + "\n")
}

fn encode_command(cmd: &Command) -> String {
    match *cmd {
        Command::SetFloor(v) => format!("SET_FLOOR:{v}"),
        Command::SetThreshold(v) => format!("SET_THR:{v}"),
        Command::SetUpperThreshold(v) => format!("SET_THR_UPPER:{v}"),
        Command::SetReverse(on) => format!("SET_REVERSE:{}", u8::from(on)),
        Command::SetOverride(on) => format!("SET_OVERRIDE:{}", u8::from(on)),
        Command::Resume => "RESUME".to_string(),
        Command::Ping => "PING".to_string(),
    }
}

fn single_line(text: &str) -> Result<&str, ValidationError> {
    if text.contains(['\r', '\n']) {
        return Err(ValidationError::MultiLineText(text.to_string()));
    }
    Ok(text)
}

fn check_error_kind(kind: &ErrorKind) -> Result<(), ValidationError> {
    let token = kind.as_str();
    if token.contains([':', '\r', '\n']) || ErrorKind::from_token(token) != *kind {
        return Err(ValidationError::BadErrorToken(token.to_string()));
    }
    Ok(())
}

/// Accumulates raw bytes and yields complete lines.
///
/// Partial lines are kept across calls; `\r` before the delimiter is
/// dropped. A line that grows past [`MAX_LINE_LEN`] is thrown away together
/// with everything up to its terminating newline.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
    discarding: bool,
}

impl LineDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(MAX_LINE_LEN),
            discarding: false,
        }
    }

    /// Feed bytes, returning every line completed by them, in order.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();

        for &b in bytes {
            if b == b'\n' {
                if !self.discarding {
                    if self.buffer.last() == Some(&b'\r') {
                        self.buffer.pop();
                    }
                    if !self.buffer.is_empty() {
                        lines.push(String::from_utf8_lossy(&self.buffer).into_owned());
                    }
                }
                self.buffer.clear();
                self.discarding = false;
                continue;
            }

            if self.discarding {
                continue;
            }

            self.buffer.push(b);
            if self.buffer.len() > MAX_LINE_LEN {
                tracing::debug!("Discarding overlong line ({} bytes)", self.buffer.len());
                self.buffer.clear();
                self.discarding = true;
            }
        }

        lines
    }

    /// Drop any partial line, e.g. after a reconnect.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.discarding = false;
    }

    /// Number of bytes waiting for a delimiter.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
