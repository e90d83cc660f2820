//! Device-facing side of the loop
//!
//! This module contains:
//! - Process variable access and AWG naming ([`pv`])
//! - The safety-gated waveform writer ([`writer`])
//! - Feedback acquisition from the detector ([`feedback`])
//! - One-session-per-device locking ([`lock`])

pub mod feedback;
pub mod lock;
pub mod pv;
pub mod writer;

pub use feedback::{AcquisitionError, AcquisitionSettings, FeedbackAcquisition, FeedbackSource};
pub use lock::{DeviceLock, DeviceLockGuard};
pub use pv::{ProcessVariables, PvNames};
pub use writer::{
    ApplyReport, SafetyGatedWriter, WaveformSample, WriteMethod, WriterConfig, WriterError,
};

use std::time::Duration;
use thiserror::Error;

/// Errors reported by the AWG or the feedback source
///
/// All of these end the session.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DeviceError {
    #[error("feedback source {0} is not connected")]
    Disconnected(String),

    #[error("{pv} still busy after {waited:?}")]
    BusyTimeout { pv: String, waited: Duration },

    #[error("feedback resolution changed from {expected} to {actual} since the session started")]
    ResolutionChanged { expected: f64, actual: f64 },

    #[error("feedback trace length changed between reads: expected {expected}, got {actual}")]
    InconsistentTrace { expected: usize, actual: usize },

    #[error("invalid DAC full scale: {0}")]
    InvalidFullScale(f64),

    #[error("PV {pv}: {reason}")]
    Pv { pv: String, reason: String },
}
