//! Safety-gated AWG writer
//!
//! Applies a normalized waveform to the AWG. Two write methods exist and the
//! choice is fixed per device:
//!
//! - **Point by point**: one PV write per sample. Each write is clamped so a
//!   single step never exceeds `max_percent_change` of full scale.
//! - **Bulk**: all samples are staged into holding registers and committed
//!   with one command, then the busy flag is polled until the device is done.
//!   Faster, but without the per-sample step clamp.
//!
//! Both methods are bracketed by pausing the device's periodic self-scan so
//! it never reads back a half-written waveform.

use super::pv::{ProcessVariables, PvNames};
use super::DeviceError;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, trace, warn};

/// Errors raised by [`SafetyGatedWriter`]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WriterError {
    #[error("waveform has {actual} samples, expected {expected}")]
    ShapeMismatch { expected: usize, actual: usize },

    #[error("sample index {index} outside device buffer of {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("refusing to write non-finite value {value} to sample {index}")]
    InvalidValue { index: usize, value: f64 },

    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// How waveforms are written to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMethod {
    #[default]
    #[serde(alias = "pts")]
    PointByPoint,
    #[serde(alias = "wfm")]
    Bulk,
}

/// Static writer settings for one device
#[derive(Debug, Clone, PartialEq)]
pub struct WriterConfig {
    /// Number of samples in one pulse
    pub pulse_size: usize,
    /// Largest single-sample step, in percent of full scale
    pub max_percent_change: f64,
    pub method: WriteMethod,
    /// Delay after each point write, to respect the device command buffer
    pub write_pacing: Duration,
    /// Delay after pausing the self-scan before the first write
    pub scan_settle: Duration,
    pub busy_poll_interval: Duration,
    pub busy_timeout: Duration,
}

impl WriterConfig {
    /// Point-by-point writer with no pacing delays
    pub fn new(pulse_size: usize, max_percent_change: f64) -> Self {
        Self {
            pulse_size,
            max_percent_change,
            method: WriteMethod::PointByPoint,
            write_pacing: Duration::ZERO,
            scan_settle: Duration::ZERO,
            busy_poll_interval: Duration::ZERO,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

/// Snapshot of the device buffer
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformSample {
    /// Maximum representable device value
    pub dac_full_scale: f64,
    /// Device units
    pub current_raw: Vec<f64>,
    /// `current_raw / dac_full_scale`
    pub current_normalized: Vec<f64>,
}

impl WaveformSample {
    pub fn new(dac_full_scale: f64, current_raw: Vec<f64>) -> Self {
        let current_normalized = current_raw.iter().map(|v| v / dac_full_scale).collect();
        Self {
            dac_full_scale,
            current_raw,
            current_normalized,
        }
    }

    /// Normalized samples belonging to the pulse
    pub fn pulse(&self, pulse_size: usize) -> &[f64] {
        &self.current_normalized[..pulse_size.min(self.current_normalized.len())]
    }
}

/// Outcome of a single [`SafetyGatedWriter::modify_point`] call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PointWrite {
    /// Value actually written, device units
    pub value: f64,
    /// Whether the proposed value was clamped
    pub clamped: bool,
}

/// Summary of one waveform write
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    /// Samples written inside the pulse
    pub written: usize,
    /// Of those, how many were step-clamped
    pub clamped: usize,
    /// Samples above full scale that were not written
    pub skipped: Vec<usize>,
    /// Samples beyond the pulse reset to zero
    pub zeroed: usize,
}

/// Writes waveforms to the AWG under the configured safety limits
pub struct SafetyGatedWriter {
    pvs: Box<dyn ProcessVariables>,
    names: PvNames,
    config: WriterConfig,
    dac_full_scale: f64,
    /// Last known device buffer, device units
    current: Vec<f64>,
}

impl SafetyGatedWriter {
    /// Connect to the device and read its current buffer
    pub fn connect(
        pvs: Box<dyn ProcessVariables>,
        names: PvNames,
        config: WriterConfig,
    ) -> Result<Self, WriterError> {
        let mut writer = Self {
            pvs,
            names,
            config,
            dac_full_scale: 0.0,
            current: Vec::new(),
        };
        writer.read_current()?;
        debug!(
            device = writer.names.prefix(),
            full_scale = writer.dac_full_scale,
            samples = writer.current.len(),
            "AWG connected"
        );
        Ok(writer)
    }

    /// Read the device buffer and full scale afresh
    pub fn read_current(&mut self) -> Result<WaveformSample, WriterError> {
        let dac = self.pvs.get_scalar(&self.names.dac())?;
        if !dac.is_finite() || dac <= 0.0 {
            return Err(DeviceError::InvalidFullScale(dac).into());
        }
        let raw = self.pvs.get_array(&self.names.read_waveform())?;
        if raw.len() < self.config.pulse_size {
            return Err(WriterError::ShapeMismatch {
                expected: self.config.pulse_size,
                actual: raw.len(),
            });
        }
        self.dac_full_scale = dac;
        self.current = raw.clone();
        Ok(WaveformSample::new(dac, raw))
    }

    pub fn names(&self) -> &PvNames {
        &self.names
    }

    /// Static settings for this device
    pub fn config(&self) -> &WriterConfig {
        &self.config
    }

    /// Full scale read at the last refresh
    pub fn dac_full_scale(&self) -> f64 {
        self.dac_full_scale
    }

    /// Last known device buffer in device units
    pub fn current_raw(&self) -> &[f64] {
        &self.current
    }

    /// Write one sample, clamping the step to `max_percent_change`
    ///
    /// The clamp moves the value exactly `max_percent_change` percent of full
    /// scale towards the proposal, never past it.
    pub fn modify_point(&mut self, index: usize, proposed: f64) -> Result<PointWrite, WriterError> {
        let Some(&now) = self.current.get(index) else {
            return Err(WriterError::IndexOutOfRange {
                index,
                len: self.current.len(),
            });
        };
        if !proposed.is_finite() {
            return Err(WriterError::InvalidValue {
                index,
                value: proposed,
            });
        }

        let dac = self.dac_full_scale;
        let max = self.config.max_percent_change;
        let change = 100.0 * (proposed - now).abs() / dac;

        let write = if change >= max {
            let step = max / 100.0 * dac;
            let value = if proposed > now { now + step } else { now - step };
            warn!(
                index,
                change_percent = change,
                max_percent = max,
                "Step too large, clamping"
            );
            PointWrite {
                value,
                clamped: true,
            }
        } else {
            PointWrite {
                value: proposed,
                clamped: false,
            }
        };

        trace!(index, from = now, to = write.value, "Writing sample");
        self.pvs.put(&self.names.set_sample(index), write.value)?;
        self.current[index] = write.value;
        Ok(write)
    }

    /// Write a normalized waveform point by point
    ///
    /// Samples whose device value would exceed full scale are skipped
    /// without being written. With `zero_to_end`, every non-zero device
    /// sample beyond the pulse is reset to zero afterwards.
    pub fn apply_curve(&mut self, points: &[f64], zero_to_end: bool) -> Result<ApplyReport, WriterError> {
        self.check_shape(points)?;
        let dac = self.dac_full_scale;
        let mut report = ApplyReport::default();

        for (i, &point) in points.iter().enumerate() {
            let value = point * dac;
            if value > dac {
                warn!(index = i, value, full_scale = dac, "Sample above full scale, not written");
                report.skipped.push(i);
                continue;
            }
            let write = self.modify_point(i, value)?;
            report.written += 1;
            if write.clamped {
                report.clamped += 1;
            }
            self.pace();
        }

        if zero_to_end {
            for i in self.config.pulse_size..self.current.len() {
                if self.current[i] != 0.0 {
                    self.pvs.put(&self.names.set_sample(i), 0.0)?;
                    self.current[i] = 0.0;
                    report.zeroed += 1;
                    self.pace();
                }
            }
        }

        Ok(report)
    }

    /// Stage every sample into the holding registers and commit at once
    pub fn write_bulk(&mut self, points: &[f64], zero_to_end: bool) -> Result<ApplyReport, WriterError> {
        self.check_shape(points)?;
        let dac = self.dac_full_scale;
        let mut report = ApplyReport::default();
        let mut staged = Vec::with_capacity(self.current.len());

        for (i, &point) in points.iter().enumerate() {
            let value = point * dac;
            if !value.is_finite() {
                return Err(WriterError::InvalidValue { index: i, value });
            }
            if value > dac {
                warn!(index = i, value, full_scale = dac, "Sample above full scale, not staged");
                report.skipped.push(i);
                continue;
            }
            self.pvs.put(&self.names.hold_sample(i), value)?;
            staged.push((i, value));
            report.written += 1;
        }

        if zero_to_end {
            for i in self.config.pulse_size..self.current.len() {
                if self.current[i] != 0.0 {
                    self.pvs.put(&self.names.hold_sample(i), 0.0)?;
                    staged.push((i, 0.0));
                    report.zeroed += 1;
                }
            }
        }

        self.pvs.put(&self.names.commit(), 1.0)?;
        self.wait_until_idle()?;

        for (i, value) in staged {
            self.current[i] = value;
        }
        Ok(report)
    }

    /// Write a waveform with the configured method, with the self-scan paused
    ///
    /// A shape mismatch is rejected before anything is sent to the device.
    pub fn write(&mut self, points: &[f64], zero_to_end: bool) -> Result<ApplyReport, WriterError> {
        self.check_shape(points)?;
        self.pause_scanning()?;

        let result = match self.config.method {
            WriteMethod::PointByPoint => self.apply_curve(points, zero_to_end),
            WriteMethod::Bulk => self.write_bulk(points, zero_to_end),
        };

        let resumed = self.resume_scanning();
        if let (Err(write_err), Err(resume_err)) = (&result, &resumed) {
            error!(write = %write_err, resume = %resume_err, "Write failed and scanning could not be resumed");
        }
        let report = result?;
        resumed?;
        Ok(report)
    }

    /// Stop the device polling its own samples
    pub fn pause_scanning(&mut self) -> Result<(), WriterError> {
        self.pvs.put(&self.names.scan_disable(), 1.0)?;
        if !self.config.scan_settle.is_zero() {
            std::thread::sleep(self.config.scan_settle);
        }
        Ok(())
    }

    /// Restart the device's periodic self-scan
    pub fn resume_scanning(&mut self) -> Result<(), WriterError> {
        self.pvs.put(&self.names.scan_disable(), 0.0)?;
        Ok(())
    }

    fn check_shape(&self, points: &[f64]) -> Result<(), WriterError> {
        if points.len() != self.config.pulse_size {
            return Err(WriterError::ShapeMismatch {
                expected: self.config.pulse_size,
                actual: points.len(),
            });
        }
        Ok(())
    }

    fn wait_until_idle(&mut self) -> Result<(), WriterError> {
        let busy_pv = self.names.busy();
        let start = Instant::now();
        loop {
            if self.pvs.get_scalar(&busy_pv)? == 0.0 {
                return Ok(());
            }
            let waited = start.elapsed();
            if waited >= self.config.busy_timeout {
                return Err(DeviceError::BusyTimeout {
                    pv: busy_pv,
                    waited,
                }
                .into());
            }
            std::thread::sleep(self.config.busy_poll_interval);
        }
    }

    fn pace(&self) {
        if !self.config.write_pacing.is_zero() {
            std::thread::sleep(self.config.write_pacing);
        }
    }
}
