//! Software stand-in for the detector hardware.
//!
//! Drives a [`DeviceController`] on a fixed tick over any [`Transport`],
//! taking samples from a [`SampleSource`].

use super::conditioner::Sample;
use super::controller::DeviceController;
use crate::protocol::{encode, Frame, LineDecoder};
use crate::session::{Transport, TransportError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Where the simulator gets its sensor readings from.
pub trait SampleSource: Send {
    fn next_sample(&mut self) -> Sample;
}

/// Operator-controlled readings shared with another thread.
#[derive(Debug, Clone)]
pub struct ManualSource {
    current: Arc<Mutex<Sample>>,
}

impl ManualSource {
    /// Source that reports `initial` until changed.
    pub fn new(initial: Sample) -> Self {
        Self {
            current: Arc::new(Mutex::new(initial)),
        }
    }

    /// Set the raw reading.
    pub fn set_raw(&self, raw: u16) {
        let mut sample = self.current.lock().unwrap_or_else(|e| e.into_inner());
        *sample = Sample::new(raw, sample.envelope_present);
    }

    /// Set the envelope-present input.
    pub fn set_envelope(&self, present: bool) {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .envelope_present = present;
    }

    /// Sample the next tick will read.
    pub fn current(&self) -> Sample {
        *self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ManualSource {
    fn default() -> Self {
        Self::new(Sample::new(100, false))
    }
}

impl SampleSource for ManualSource {
    fn next_sample(&mut self) -> Sample {
        self.current()
    }
}

/// Plays back a fixed sequence, then holds the last sample.
#[derive(Debug, Clone)]
pub struct ScriptedSource {
    samples: VecDeque<Sample>,
    last: Sample,
}

impl ScriptedSource {
    /// Play `samples` in order, then repeat the last one.
    pub fn new(samples: impl IntoIterator<Item = Sample>) -> Self {
        let samples: VecDeque<Sample> = samples.into_iter().collect();
        let last = samples
            .back()
            .copied()
            .unwrap_or_else(|| Sample::new(100, false));
        Self { samples, last }
    }

    /// Samples not yet played.
    pub fn remaining(&self) -> usize {
        self.samples.len()
    }
}

impl SampleSource for ScriptedSource {
    fn next_sample(&mut self) -> Sample {
        self.samples.pop_front().unwrap_or(self.last)
    }
}

/// Runs a controller against a transport.
pub struct Simulator<S: SampleSource> {
    controller: DeviceController,
    source: S,
    transport: Box<dyn Transport>,
    decoder: LineDecoder,
    booted: bool,
}

impl<S: SampleSource> Simulator<S> {
    /// Wire a controller to a sample source and a transport.
    pub fn new(controller: DeviceController, source: S, transport: Box<dyn Transport>) -> Self {
        Self {
            controller,
            source,
            transport,
            decoder: LineDecoder::new(),
            booted: false,
        }
    }

    /// The simulated firmware.
    pub fn controller(&self) -> &DeviceController {
        &self.controller
    }

    /// One tick: handle pending commands, sample, send frames.
    pub fn step(&mut self) -> Result<(), TransportError> {
        if !self.booted {
            self.booted = true;
            let frames = self.controller.boot();
            self.send(&frames)?;
        }

        let mut buf = [0u8; 256];
        loop {
            let n = self.transport.read(&mut buf)?;
            if n == 0 {
                break;
            }
            for line in self.decoder.push(&buf[..n]) {
                let frames = self.controller.handle_line(&line);
                self.send(&frames)?;
            }
        }

        let sample = self.source.next_sample();
        let frames = self.controller.tick(sample);
        self.send(&frames)
    }

    /// Tick at the controller's period until `running` goes false or the
    /// link closes.
    pub fn run(&mut self, running: &AtomicBool) -> Result<(), TransportError> {
        let period = self.controller.timing().tick;
        tracing::info!(
            port = self.transport.name(),
            period_ms = period.as_millis() as u64,
            "Simulated device running"
        );

        while running.load(Ordering::SeqCst) {
            let started = Instant::now();
            self.step()?;
            if let Some(remaining) = period.checked_sub(started.elapsed()) {
                std::thread::sleep(remaining);
            }
        }
        Ok(())
    }

    fn send(&mut self, frames: &[Frame]) -> Result<(), TransportError> {
        for frame in frames {
            match encode(frame) {
                Ok(line) => self.transport.write_all(line.as_bytes())?,
                Err(e) => tracing::warn!(error = %e, "Dropping unencodable frame"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceConfig, DeviceTiming, Smoother};
    use crate::session::{pipe, MemoryTransport};
    use std::time::Duration;

    fn simulator<S: SampleSource>(source: S) -> (Simulator<S>, MemoryTransport) {
        let (device_end, host_end) = pipe(Duration::ZERO);
        let controller = DeviceController::new(
            DeviceConfig::default(),
            Smoother::disabled(),
            DeviceTiming {
                telemetry_every: 1,
                watchdog_ticks: None,
                ..DeviceTiming::default()
            },
        );
        (
            Simulator::new(controller, source, Box::new(device_end)),
            host_end,
        )
    }

    #[test]
    fn test_boot_message_then_telemetry() {
        let (mut sim, mut host) = simulator(ManualSource::default());
        sim.step().unwrap();
        assert_eq!(
            host.read_lines().unwrap(),
            vec!["MSG:System Booted".to_string(), "D:100,0,0".to_string()]
        );
    }

    #[test]
    fn test_commands_are_applied_before_sampling() {
        let (mut sim, mut host) = simulator(ManualSource::default());
        sim.step().unwrap();
        host.read_lines().unwrap();

        host.write_all(b"SET_REVERSE:1\n").unwrap();
        sim.step().unwrap();
        assert_eq!(
            host.read_lines().unwrap(),
            vec![
                "MSG:Reverse Sensor Enabled".to_string(),
                "D:923,0,0".to_string()
            ]
        );
    }

    #[test]
    fn test_scripted_pass() {
        let script = ScriptedSource::new([
            Sample::new(100, false),
            Sample::new(180, true),
            Sample::new(220, true),
            Sample::new(100, false),
        ]);
        let (mut sim, mut host) = simulator(script);
        for _ in 0..4 {
            sim.step().unwrap();
        }
        let lines = host.read_lines().unwrap();
        assert!(lines.contains(&"EVT:PASS:220".to_string()));
    }

    #[test]
    fn test_manual_source_is_shared() {
        let source = ManualSource::default();
        let handle = source.clone();
        handle.set_raw(2000);
        handle.set_envelope(true);
        assert_eq!(source.current(), Sample::new(1023, true));
    }

    #[test]
    fn test_closed_link_stops_simulator() {
        let (mut sim, host) = simulator(ManualSource::default());
        drop(host);
        assert_eq!(sim.step(), Err(TransportError::Closed));
    }
}
