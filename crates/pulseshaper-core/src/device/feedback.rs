//! Feedback acquisition
//!
//! Reads the detector, averages several records and reduces them to a
//! normalized trace of `pulse_size` points through the fixed pipeline
//! `bkg -> crop -> resample -> clip -> norm`.

use super::DeviceError;
use crate::trace::{ProcessRequest, Trace, TraceError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error};

/// Detector that produces raw traces
pub trait FeedbackSource: Send {
    /// Identifier used in error reports
    fn name(&self) -> &str;

    fn is_connected(&self) -> bool;

    /// One raw record, detector units
    fn read_one_trace(&mut self) -> Result<Vec<f64>, DeviceError>;

    /// Time resolution of a record; must not change during a session
    fn resolution(&mut self) -> Result<f64, DeviceError>;
}

/// Errors raised while measuring
#[derive(Error, Debug)]
pub enum AcquisitionError {
    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("failed to process feedback trace: {0}")]
    Trace(#[from] TraceError),
}

/// How each measurement is taken
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionSettings {
    /// Records averaged per measurement
    pub averages: usize,
    /// Delay after each record
    pub wait: Duration,
    /// `(start, length)` of the pulse inside a record
    pub crop: Option<(usize, usize)>,
    /// Points in the processed trace
    pub pulse_size: usize,
}

/// Averages and reprocesses detector records
pub struct FeedbackAcquisition {
    source: Box<dyn FeedbackSource>,
    /// Subtracted from every record when present
    background: Option<Trace>,
    settings: AcquisitionSettings,
    /// Resolution captured at session start
    resolution: f64,
}

impl FeedbackAcquisition {
    /// Capture the source's resolution for the rest of the session
    pub fn new(
        mut source: Box<dyn FeedbackSource>,
        background: Option<Trace>,
        settings: AcquisitionSettings,
    ) -> Result<Self, AcquisitionError> {
        if !source.is_connected() {
            return Err(DeviceError::Disconnected(source.name().to_string()).into());
        }
        let resolution = source.resolution()?;
        debug!(source = source.name(), resolution, "Feedback source ready");
        Ok(Self {
            source,
            background,
            settings,
            resolution,
        })
    }

    /// Background record, if one was supplied
    pub fn background(&self) -> Option<&Trace> {
        self.background.as_ref()
    }

    /// Averaging and reduction settings
    pub fn settings(&self) -> &AcquisitionSettings {
        &self.settings
    }

    /// Seconds per sample captured at session start
    pub fn resolution(&self) -> f64 {
        self.resolution
    }

    /// Take one averaged measurement and reduce it to a normalized trace
    pub fn measure(&mut self) -> Result<Trace, AcquisitionError> {
        let actual = self.source.resolution()?;
        if actual != self.resolution {
            error!(expected = self.resolution, actual, "Feedback resolution changed");
            return Err(DeviceError::ResolutionChanged {
                expected: self.resolution,
                actual,
            }
            .into());
        }
        if !self.source.is_connected() {
            return Err(DeviceError::Disconnected(self.source.name().to_string()).into());
        }

        let averaged = self.read_averaged()?;

        let mut trace = Trace::measurement("Current", averaged);
        trace.process(&ProcessRequest {
            background: self.background.as_ref(),
            crop: self.settings.crop,
            resample_to: Some(self.settings.pulse_size),
            clip: true,
            normalize: true,
        })?;
        Ok(trace)
    }

    fn read_averaged(&mut self) -> Result<Vec<f64>, DeviceError> {
        let count = self.settings.averages.max(1);
        let mut sum: Vec<f64> = Vec::new();

        for i in 0..count {
            let record = self.source.read_one_trace()?;
            if i == 0 {
                sum = record;
            } else if record.len() != sum.len() {
                return Err(DeviceError::InconsistentTrace {
                    expected: sum.len(),
                    actual: record.len(),
                });
            } else {
                for (acc, v) in sum.iter_mut().zip(&record) {
                    *acc += v;
                }
            }
            if !self.settings.wait.is_zero() {
                std::thread::sleep(self.settings.wait);
            }
        }

        let n = count as f64;
        sum.iter_mut().for_each(|v| *v /= n);
        debug!(records = count, points = sum.len(), "Feedback averaged");
        Ok(sum)
    }
}
