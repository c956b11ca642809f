//! Signal conditioning for raw ADC samples.
//!
//! Polarity is applied once, right after sampling, so telemetry and the
//! detection state machine always see the same value.

use crate::protocol::ADC_MAX;
use serde::{Deserialize, Serialize};

/// One sampling tick worth of input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    /// Raw ADC reading, 0..=1023
    pub raw: u16,
    /// Envelope-present input
    pub envelope_present: bool,
}

impl Sample {
    /// Build a sample, clamping `raw` to the ADC range.
    pub fn new(raw: u16, envelope_present: bool) -> Self {
        Self {
            raw: raw.min(ADC_MAX),
            envelope_present,
        }
    }
}

/// Map a raw reading to the value consumed downstream.
///
/// Reversed sensors (mounted upside-down) read `1023 - raw`.
pub fn condition(raw: u16, reverse_sensor: bool) -> u16 {
    let raw = raw.min(ADC_MAX);
    if reverse_sensor {
        ADC_MAX - raw
    } else {
        raw
    }
}

/// Exponential moving average over conditioned values.
///
/// An `alpha` of 1.0 passes values through unchanged.
#[derive(Debug, Clone)]
pub struct Smoother {
    alpha: f32,
    value: Option<f32>,
}

impl Smoother {
    /// Create a smoother, clamping `alpha` into `0.01..=1.0`.
    ///
    /// A non-finite `alpha` gives a pass-through smoother.
    pub fn new(alpha: f32) -> Self {
        let alpha = if alpha.is_finite() { alpha } else { 1.0 };
        Self {
            alpha: alpha.clamp(0.01, 1.0),
            value: None,
        }
    }

    /// Create a smoother only if `alpha` is usable as given: finite and in
    /// `(0, 1]`.
    pub fn checked(alpha: f32) -> Option<Self> {
        (alpha.is_finite() && alpha > 0.0 && alpha <= 1.0).then(|| Self::new(alpha))
    }

    /// Pass-through smoother.
    pub fn disabled() -> Self {
        Self::new(1.0)
    }

    /// Feed a value and return the filtered output.
    pub fn apply(&mut self, input: u16) -> u16 {
        let input = f32::from(input);
        let next = match self.value {
            Some(prev) => self.alpha * input + (1.0 - self.alpha) * prev,
            None => input,
        };
        self.value = Some(next);
        next.round() as u16
    }

    /// Seed the filter with a fresh reading, forgetting history.
    pub fn reseed(&mut self, input: u16) {
        self.value = Some(f32::from(input));
    }

    /// Effective smoothing factor.
    pub fn alpha(&self) -> f32 {
        self.alpha
    }
}

impl Default for Smoother {
    fn default() -> Self {
        Self::disabled()
    }
}
