//! Correction computation
//!
//! - Pluggable correction strategies ([`strategy`])
//! - Pluggable smoothing filters ([`filter`])
//! - The per-iteration numeric pipeline ([`pipeline`])

pub mod filter;
pub mod pipeline;
pub mod strategy;

pub use filter::{
    FilterRegistry, GaussianFilter, IdentityFilter, MedianFilter, SmoothingFilter, NO_FILTER,
};
pub use pipeline::{
    clamp_factor, peak_power, rms_error, CorrectionEngine, IterationPlan, PlanInputs, StepLimits,
    RMS_UNDEFINED,
};
pub use strategy::{
    CorrectionStrategy, DefaultCorrection, FnStrategy, StrategyRegistry, DEFAULT_STRATEGY,
};

use thiserror::Error;

/// Recoverable errors from strategy and filter plugins
///
/// These never end a session: the caller falls back to the default
/// strategy or the identity filter and reports the error once.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PluginError {
    #[error("no correction strategy registered as {0:?}")]
    UnknownStrategy(String),

    #[error("no smoothing filter registered as {0:?}")]
    UnknownFilter(String),

    #[error("{plugin} failed: {reason}")]
    Failed { plugin: String, reason: String },

    #[error("{plugin} returned {actual} samples, expected {expected}")]
    BadLength {
        plugin: String,
        expected: usize,
        actual: usize,
    },
}
