//! Envelope detection state machine.
//!
//! The machine is fed one conditioned value per tick together with the
//! envelope-present input and turns the stream into pass and fault events.
//! Faults latch until [`DetectionMachine::resume`] is called, except that an
//! enabled system override releases non-range faults on the next tick.

use crate::protocol::{
    validate_floor, validate_threshold, validate_upper_threshold, Command, DeviceEvent,
    ErrorKind, ValidationError,
};
use serde::{Deserialize, Serialize};

/// Lowest conditioned value considered a working sensor.
pub const SENSOR_MIN: u16 = 50;
/// Highest conditioned value considered a working sensor.
pub const SENSOR_MAX: u16 = 1000;

/// Detection parameters owned by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Baseline reading with nothing on the sensor
    pub floor_value: u16,
    /// Minimum peak for a card to be present
    pub card_threshold: u16,
    /// Peaks above this are reported as double cards
    pub card_upper_threshold: u16,
    /// Sensor mounted upside-down
    pub reverse_sensor: bool,
    /// Convert would-be faults into override passes
    pub system_override: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            floor_value: 100,
            card_threshold: 150,
            card_upper_threshold: 800,
            reverse_sensor: false,
            system_override: false,
        }
    }
}

impl DeviceConfig {
    /// Range-check every field and the threshold ordering.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_floor(self.floor_value)?;
        validate_threshold(self.card_threshold)?;
        validate_upper_threshold(self.card_upper_threshold)?;
        if self.card_upper_threshold < self.card_threshold {
            return Err(ValidationError::UpperBelowThreshold {
                upper: self.card_upper_threshold,
                threshold: self.card_threshold,
            });
        }
        Ok(())
    }

    /// The command sequence that recreates this configuration on a device.
    pub fn commands(&self) -> Vec<Command> {
        vec![
            Command::SetFloor(self.floor_value),
            Command::SetThreshold(self.card_threshold),
            Command::SetUpperThreshold(self.card_upper_threshold),
            Command::SetReverse(self.reverse_sensor),
            Command::SetOverride(self.system_override),
        ]
    }
}

/// Current phase of the detection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectionState {
    Idle,
    Measuring,
    Fault,
}

/// The sensing-side authority over pass/fault outcomes.
#[derive(Debug, Clone)]
pub struct DetectionMachine {
    state: DetectionState,
    peak_in_window: u16,
    envelope_was_present: bool,
    fault: Option<ErrorKind>,
}

impl DetectionMachine {
    /// Idle machine with no peak recorded.
    pub fn new() -> Self {
        Self {
            state: DetectionState::Idle,
            peak_in_window: 0,
            envelope_was_present: false,
            fault: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> DetectionState {
        self.state
    }

    /// Highest value seen in the current window; 0 outside `Measuring`.
    pub fn peak_in_window(&self) -> u16 {
        self.peak_in_window
    }

    /// Kind of the latched fault, if any.
    pub fn fault(&self) -> Option<&ErrorKind> {
        self.fault.as_ref()
    }

    /// Whether a fault is latched.
    pub fn is_faulted(&self) -> bool {
        self.state == DetectionState::Fault
    }

    /// Advance by one tick.
    ///
    /// Returns at most one event per tick.
    pub fn tick(
        &mut self,
        value: u16,
        envelope_present: bool,
        config: &DeviceConfig,
    ) -> Option<DeviceEvent> {
        let rising_edge = envelope_present && !self.envelope_was_present;
        self.envelope_was_present = envelope_present;

        // Absolute range check runs before anything else; nothing moves
        // while the sensor reads outside its working band.
        if !(SENSOR_MIN..=SENSOR_MAX).contains(&value) {
            return self.trip(ErrorKind::SensorOutOfRange);
        }

        if self.state == DetectionState::Fault {
            let range_fault = self.fault == Some(ErrorKind::SensorOutOfRange);
            if !config.system_override || range_fault {
                return None;
            }
            self.clear_fault();
        }

        if self.state == DetectionState::Idle && rising_edge {
            self.state = DetectionState::Measuring;
            self.peak_in_window = 0;
        }

        if self.state != DetectionState::Measuring {
            return None;
        }

        if envelope_present {
            self.peak_in_window = self.peak_in_window.max(value);
            return None;
        }

        // Falling edge: the envelope has left the sensor.
        let peak = self.peak_in_window;
        self.peak_in_window = 0;
        self.state = DetectionState::Idle;
        Some(self.evaluate(peak, config))
    }

    /// Latch an externally detected fault (e.g. a watchdog expiry).
    ///
    /// Returns `None` when already faulted.
    pub fn trip(&mut self, kind: ErrorKind) -> Option<DeviceEvent> {
        if self.is_faulted() {
            return None;
        }
        Some(self.latch(kind, None))
    }

    /// Clear a latched fault. Returns whether a fault was cleared.
    pub fn resume(&mut self) -> bool {
        if !self.is_faulted() {
            return false;
        }
        self.clear_fault();
        true
    }

    fn evaluate(&mut self, peak: u16, config: &DeviceConfig) -> DeviceEvent {
        if config.system_override {
            return DeviceEvent::PassOverride { peak };
        }

        if peak > config.card_upper_threshold {
            self.latch(ErrorKind::DoubleCard, Some(peak))
        } else if peak >= config.card_threshold {
            DeviceEvent::Pass { peak }
        } else {
            self.latch(ErrorKind::EmptyEnvelope, Some(peak))
        }
    }

    fn latch(&mut self, kind: ErrorKind, peak: Option<u16>) -> DeviceEvent {
        self.state = DetectionState::Fault;
        self.peak_in_window = 0;
        self.fault = Some(kind.clone());
        DeviceEvent::Error { kind, peak }
    }

    fn clear_fault(&mut self) {
        self.state = DetectionState::Idle;
        self.peak_in_window = 0;
        self.fault = None;
    }
}

impl Default for DetectionMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> DeviceConfig {
        DeviceConfig::default()
    }

    fn run(
        machine: &mut DetectionMachine,
        ticks: &[(u16, bool)],
        config: &DeviceConfig,
    ) -> Vec<DeviceEvent> {
        ticks
            .iter()
            .filter_map(|&(value, env)| machine.tick(value, env, config))
            .collect()
    }

    #[test]
    fn test_rising_edge_starts_measuring() {
        let mut machine = DetectionMachine::new();
        assert_eq!(machine.tick(100, true, &config()), None);
        assert_eq!(machine.state(), DetectionState::Measuring);
        assert_eq!(machine.peak_in_window(), 100);
    }

    #[test]
    fn test_envelope_held_through_resume_needs_new_edge() {
        let cfg = config();
        let mut machine = DetectionMachine::new();
        run(&mut machine, &[(100, true), (120, false)], &cfg);
        assert!(machine.is_faulted());

        machine.tick(100, true, &cfg);
        assert!(machine.resume());
        // Envelope never left the sensor: no rising edge, stay idle
        machine.tick(300, true, &cfg);
        assert_eq!(machine.state(), DetectionState::Idle);
    }

    #[test]
    fn test_double_card_latches() {
        let cfg = config();
        let mut machine = DetectionMachine::new();
        let events = run(&mut machine, &[(100, true), (900, true), (100, false)], &cfg);
        assert_eq!(
            events,
            vec![DeviceEvent::Error {
                kind: ErrorKind::DoubleCard,
                peak: Some(900),
            }]
        );
        assert!(machine.is_faulted());
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let cfg = config();
        let mut machine = DetectionMachine::new();
        let events = run(&mut machine, &[(150, true), (100, false)], &cfg);
        assert_eq!(events, vec![DeviceEvent::Pass { peak: 150 }]);
    }

    #[test]
    fn test_override_passes_every_cycle() {
        let cfg = DeviceConfig {
            system_override: true,
            ..config()
        };
        let mut machine = DetectionMachine::new();
        let events = run(
            &mut machine,
            &[(200, true), (100, false), (900, true), (100, false)],
            &cfg,
        );
        assert_eq!(
            events,
            vec![
                DeviceEvent::PassOverride { peak: 200 },
                DeviceEvent::PassOverride { peak: 900 },
            ]
        );
        assert_eq!(machine.state(), DetectionState::Idle);
    }

    #[test]
    fn test_override_releases_latched_cycle_fault() {
        let mut cfg = config();
        let mut machine = DetectionMachine::new();
        run(&mut machine, &[(120, true), (100, false)], &cfg);
        assert!(machine.is_faulted());

        cfg.system_override = true;
        assert_eq!(machine.tick(100, false, &cfg), None);
        assert_eq!(machine.state(), DetectionState::Idle);
        assert_eq!(machine.fault(), None);
    }

    #[test]
    fn test_override_does_not_release_range_fault() {
        let cfg = DeviceConfig {
            system_override: true,
            ..config()
        };
        let mut machine = DetectionMachine::new();
        assert!(machine.tick(20, false, &cfg).is_some());
        assert_eq!(machine.tick(100, false, &cfg), None);
        assert!(machine.is_faulted());
        assert_eq!(machine.fault(), Some(&ErrorKind::SensorOutOfRange));
    }

    #[test]
    fn test_range_fault_fires_once_per_entry() {
        let cfg = config();
        let mut machine = DetectionMachine::new();
        let events = run(&mut machine, &[(10, false), (5, false), (1010, false)], &cfg);
        assert_eq!(events.len(), 1);

        machine.tick(100, false, &cfg);
        assert!(machine.resume());
        // Leaving the band again is a new entry
        assert!(machine.tick(1020, false, &cfg).is_some());
    }

    #[test]
    fn test_trip_and_resume() {
        let mut machine = DetectionMachine::new();
        assert!(!machine.resume());
        assert_eq!(
            machine.trip(ErrorKind::WatchdogTimeout),
            Some(DeviceEvent::Error {
                kind: ErrorKind::WatchdogTimeout,
                peak: None,
            })
        );
        assert_eq!(machine.trip(ErrorKind::WatchdogTimeout), None);
        assert!(machine.resume());
        assert_eq!(machine.state(), DetectionState::Idle);
        assert_eq!(machine.peak_in_window(), 0);
    }

    #[test]
    fn test_peak_monotonic_while_measuring() {
        let cfg = config();
        let mut machine = DetectionMachine::new();
        let mut seed: u32 = 0x2545_f491;
        machine.tick(100, true, &cfg);

        let mut last_peak = machine.peak_in_window();
        for _ in 0..500 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            let value = SENSOR_MIN + (seed >> 16) as u16 % (SENSOR_MAX - SENSOR_MIN);
            machine.tick(value, true, &cfg);
            assert_eq!(machine.state(), DetectionState::Measuring);
            assert!(machine.peak_in_window() >= last_peak);
            last_peak = machine.peak_in_window();
        }

        machine.tick(100, false, &cfg);
        assert_eq!(machine.peak_in_window(), 0);
    }

    #[test]
    fn test_config_validation() {
        assert!(config().validate().is_ok());
        let bad = DeviceConfig {
            card_threshold: 900,
            ..config()
        };
        assert_eq!(
            bad.validate(),
            Err(ValidationError::UpperBelowThreshold {
                upper: 800,
                threshold: 900,
            })
        );
        assert_eq!(config().commands().len(), 5);
    }
}
