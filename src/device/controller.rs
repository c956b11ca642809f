//! Sensing-side control loop logic.
//!
//! [`DeviceController`] is the firmware of the detector minus the hardware:
//! it conditions samples, runs the detection machine, enforces the ping
//! watchdog, applies commands and produces the outbound frames. It performs
//! no I/O; [`super::simulator::Simulator`] moves its frames over a transport.

use super::conditioner::{condition, Sample, Smoother};
use super::detection::{DetectionMachine, DetectionState, DeviceConfig};
use crate::protocol::{decode, encode, Command, DeviceEvent, ErrorKind, Frame, Role, Telemetry};
use std::time::Duration;

/// Timing of the sensing-side loop, expressed in ticks.
#[derive(Debug, Clone)]
pub struct DeviceTiming {
    /// Control loop period
    pub tick: Duration,
    /// Send telemetry every N ticks
    pub telemetry_every: u32,
    /// Fault after this many ticks without a PING; `None` disables
    pub watchdog_ticks: Option<u32>,
}

impl Default for DeviceTiming {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(50),
            telemetry_every: 2,
            // 2000 ms at 50 ms per tick
            watchdog_ticks: Some(40),
        }
    }
}

/// The sensing side of the link.
#[derive(Debug)]
pub struct DeviceController {
    config: DeviceConfig,
    machine: DetectionMachine,
    smoother: Smoother,
    timing: DeviceTiming,
    ticks: u64,
    last_ping_tick: u64,
    last_conditioned: Option<u16>,
}

impl DeviceController {
    /// Create a freshly booted controller.
    pub fn new(config: DeviceConfig, smoother: Smoother, timing: DeviceTiming) -> Self {
        Self {
            config,
            machine: DetectionMachine::new(),
            smoother,
            timing,
            ticks: 0,
            last_ping_tick: 0,
            last_conditioned: None,
        }
    }

    /// Configuration currently applied.
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// State of the detection machine.
    pub fn state(&self) -> DetectionState {
        self.machine.state()
    }

    /// Highest value seen in the current envelope window.
    pub fn peak_in_window(&self) -> u16 {
        self.machine.peak_in_window()
    }

    /// Loop timing.
    pub fn timing(&self) -> &DeviceTiming {
        &self.timing
    }

    /// Frames sent once at power-up.
    pub fn boot(&mut self) -> Vec<Frame> {
        vec![Frame::Status("System Booted".to_string())]
    }

    /// Handle one inbound line. Unknown lines are ignored.
    pub fn handle_line(&mut self, line: &str) -> Vec<Frame> {
        match decode(line, Role::Device) {
            Some(Frame::Command(command)) => self.handle_command(command),
            _ => {
                tracing::debug!(%line, "Ignoring unrecognised command line");
                Vec::new()
            }
        }
    }

    /// Apply a command and return the acknowledgement frames.
    pub fn handle_command(&mut self, command: Command) -> Vec<Frame> {
        if let Err(e) = command.validate() {
            return vec![Frame::Log(format!("REJECTED {e}"))];
        }

        let ack = match command {
            Command::Ping => {
                self.last_ping_tick = self.ticks;
                return Vec::new();
            }
            Command::Resume => {
                if !self.machine.resume() {
                    return Vec::new();
                }
                // Forget the history so the filter cannot re-trip instantly
                if let Some(value) = self.last_conditioned {
                    self.smoother.reseed(value);
                }
                "System Resumed".to_string()
            }
            Command::SetFloor(v) => {
                self.config.floor_value = v;
                format!("Floor Value Set to {v}")
            }
            Command::SetThreshold(v) => {
                self.config.card_threshold = v;
                format!("Card Threshold Set to {v}")
            }
            Command::SetUpperThreshold(v) => {
                self.config.card_upper_threshold = v;
                format!("Card Upper Threshold Set to {v}")
            }
            Command::SetReverse(on) => {
                self.config.reverse_sensor = on;
                format!("Reverse Sensor {}", if on { "Enabled" } else { "Disabled" })
            }
            Command::SetOverride(on) => {
                self.config.system_override = on;
                format!(
                    "System Override {}",
                    if on {
                        "ENABLED - Safety bypassed!"
                    } else {
                        "Disabled"
                    }
                )
            }
        };
        vec![Frame::Status(ack)]
    }

    /// Run one control tick.
    pub fn tick(&mut self, sample: Sample) -> Vec<Frame> {
        self.ticks += 1;
        let mut frames = Vec::new();

        let conditioned = condition(sample.raw, self.config.reverse_sensor);
        self.last_conditioned = Some(conditioned);
        let value = self.smoother.apply(conditioned);

        if let Some(limit) = self.timing.watchdog_ticks {
            let silent_for = self.ticks - self.last_ping_tick;
            if !self.config.system_override && silent_for > u64::from(limit) {
                if let Some(event) = self.machine.trip(ErrorKind::WatchdogTimeout) {
                    push_event(&mut frames, event);
                }
            }
        }

        if let Some(event) = self
            .machine
            .tick(value, sample.envelope_present, &self.config)
        {
            push_event(&mut frames, event);
        }

        if self.ticks % u64::from(self.timing.telemetry_every.max(1)) == 0 {
            frames.push(Frame::Telemetry(Telemetry {
                adc: value,
                envelope: sample.envelope_present,
                stop: self.machine.is_faulted(),
            }));
        }

        frames
    }
}

/// Faults are preceded by a LOG line echoing the error.
fn push_event(frames: &mut Vec<Frame>, event: DeviceEvent) {
    if let DeviceEvent::Error { .. } = event {
        if let Ok(line) = encode(&Frame::Event(event.clone())) {
            frames.push(Frame::Log(line.trim_end().to_string()));
        }
    }
    frames.push(Frame::Event(event));
}
