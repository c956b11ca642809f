//! Sensing side of the link.
//!
//! This module contains:
//! - Signal conditioning (polarity, smoothing)
//! - The detection state machine that decides pass / fault
//! - A tick-driven controller and a simulator that runs it over a transport

pub mod conditioner;
pub mod controller;
pub mod detection;
pub mod simulator;

pub use conditioner::{condition, Sample, Smoother};
pub use controller::{DeviceController, DeviceTiming};
pub use detection::{
    DetectionMachine, DetectionState, DeviceConfig, SENSOR_MAX, SENSOR_MIN,
};
pub use simulator::{ManualSource, SampleSource, ScriptedSource, Simulator};
