//! Simulated detector
//!
//! Looks at the simulated AWG's buffer, optionally pushes the pulse through
//! the amplifier model, and embeds it into a longer record on top of a
//! constant baseline, the way a scope channel would see it.

use super::awg::SimulatedAwg;
use super::model::AmplifierModel;
use crate::device::{DeviceError, FeedbackSource};
use crate::trace::{Trace, TraceProcessor};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Record geometry of the simulated scope
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScopeSettings {
    /// Samples of the AWG buffer that form the pulse
    pub pulse_size: usize,
    /// Samples per record
    pub record_length: usize,
    /// First record sample of the pulse
    pub offset: usize,
    /// Constant level under the pulse, detector units
    pub baseline: f64,
    /// Detector reading for a full-scale pulse
    pub amplitude: f64,
    /// Seconds per sample
    pub resolution: f64,
}

impl ScopeSettings {
    /// Pulse in the middle of a record twice its length
    pub fn centered(pulse_size: usize) -> Self {
        Self {
            pulse_size,
            record_length: pulse_size * 2,
            offset: pulse_size / 2,
            baseline: 0.002,
            amplitude: 0.04,
            resolution: 1.25e-10,
        }
    }
}

/// Shared switches for fault injection
#[derive(Debug, Clone)]
pub struct ScopeHandle {
    connected: Arc<AtomicBool>,
    resolution_bits: Arc<AtomicU64>,
}

impl ScopeHandle {
    /// Simulate unplugging or reconnecting the scope
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    /// Change the time base, as an operator touching the scope would
    pub fn set_resolution(&self, resolution: f64) {
        self.resolution_bits.store(resolution.to_bits(), Ordering::Release);
    }
}

pub struct SimulatedScope {
    awg: SimulatedAwg,
    settings: ScopeSettings,
    amplifier: Option<AmplifierModel>,
    handle: ScopeHandle,
}

impl SimulatedScope {
    pub fn new(awg: SimulatedAwg, settings: ScopeSettings) -> Self {
        let handle = ScopeHandle {
            connected: Arc::new(AtomicBool::new(true)),
            resolution_bits: Arc::new(AtomicU64::new(settings.resolution.to_bits())),
        };
        Self {
            awg,
            settings,
            amplifier: None,
            handle,
        }
    }

    /// Route the pulse through an amplifier before it reaches the detector
    pub fn with_amplifier(mut self, model: AmplifierModel) -> Self {
        self.amplifier = Some(model);
        self
    }

    /// Fault-injection switches shared with this scope
    pub fn handle(&self) -> ScopeHandle {
        self.handle.clone()
    }

    pub fn settings(&self) -> &ScopeSettings {
        &self.settings
    }

    /// A record taken with no pulse present
    pub fn background(&self) -> Trace {
        Trace::background(
            "simulated background",
            vec![self.settings.baseline; self.settings.record_length],
        )
    }

    /// `(start, length)` of the pulse inside a record
    pub fn pulse_window(&self) -> (usize, usize) {
        let length = self
            .settings
            .pulse_size
            .min(self.settings.record_length.saturating_sub(self.settings.offset));
        (self.settings.offset, length)
    }

    fn pulse_shape(&mut self) -> Vec<f64> {
        let mut pulse = self.awg.normalized();
        pulse.truncate(self.settings.pulse_size);

        match self.amplifier.as_mut() {
            Some(model) => {
                let peak = pulse.iter().fold(0.0_f64, |acc, &x| acc.max(x));
                model.set_input_shape(&pulse);
                model.simulate();
                let shape = TraceProcessor::resample(&model.output_shape(), pulse.len())
                    .unwrap_or_else(|_| vec![0.0; pulse.len()]);
                // keep the AWG level so an all-zero drive still reads zero
                shape.iter().map(|v| v * peak).collect()
            }
            None => pulse,
        }
    }
}

impl FeedbackSource for SimulatedScope {
    fn name(&self) -> &str {
        "simulated scope"
    }

    fn is_connected(&self) -> bool {
        self.handle.connected.load(Ordering::Acquire)
    }

    fn read_one_trace(&mut self) -> Result<Vec<f64>, DeviceError> {
        if !self.is_connected() {
            return Err(DeviceError::Disconnected(self.name().to_string()));
        }
        let ScopeSettings {
            record_length,
            offset,
            baseline,
            amplitude,
            ..
        } = self.settings;

        let mut record = vec![baseline; record_length];
        for (slot, v) in record.iter_mut().skip(offset).zip(self.pulse_shape()) {
            *slot += amplitude * v;
        }
        Ok(record)
    }

    fn resolution(&mut self) -> Result<f64, DeviceError> {
        Ok(f64::from_bits(self.handle.resolution_bits.load(Ordering::Acquire)))
    }
}
