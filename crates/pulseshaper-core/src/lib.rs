//! Pulseshaper Core - Feedback correction engine for AWG pulse shaping
//!
//! This library closes the loop between a programmable waveform generator and
//! a detector: it reduces detector records to normalized traces, computes a
//! bounded correction towards a target shape, and writes the result back to
//! the AWG under per-sample and peak-power safety limits.

pub mod correction;
pub mod device;
pub mod session;
pub mod sim;
pub mod trace;

pub use correction::{CorrectionEngine, CorrectionStrategy, PluginError, SmoothingFilter};
pub use device::{DeviceError, DeviceLock, FeedbackSource, ProcessVariables, SafetyGatedWriter};
pub use session::{
    Backend, Decision, FeedbackLoopController, Operator, SessionConfig, SessionError, SessionState,
};
pub use trace::{Trace, TraceError, TraceProcessor};

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date, set by build.rs
pub const BUILD_DATE: &str = env!("BUILD_DATE");
