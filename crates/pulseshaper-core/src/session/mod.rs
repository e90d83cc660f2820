//! Control-loop sessions
//!
//! This module contains:
//! - The session configuration ([`config`])
//! - Operator decisions and cooperative abort ([`operator`])
//! - The per-iteration history ([`history`]) and diagnostic files ([`diagnostics`])
//! - The loop controller and its state machine ([`controller`])

pub mod config;
pub mod controller;
pub mod diagnostics;
pub mod history;
pub mod operator;

pub use config::{ConfigError, SessionConfig};
pub use controller::{Backend, FeedbackLoopController};
pub use diagnostics::{DiagnosticWriter, DiagnosticsError, IterationFiles};
pub use history::{IterationRecord, SessionHistory};
pub use operator::{
    AbortHandle, AlwaysProceed, ChannelOperator, Decision, DecisionRequest, Operator, OperatorLink,
    ScriptedOperator,
};

use crate::device::{AcquisitionError, DeviceError, WriterError};
use crate::trace::TraceError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Where a session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Built, not started
    Idle,
    Running,
    AwaitingDecision,
    /// Stopped by the operator; can be resumed
    Paused,
    Aborted,
    /// Proposed waveform exceeded the peak-power limit
    SafetyStop,
    /// RMS error fell below tolerance
    Converged,
    /// Automatic session used all its iterations
    IterationLimit,
    /// A device error ended the session
    Faulted,
}

impl SessionState {
    /// No further iterations can run
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Aborted | Self::SafetyStop | Self::Converged | Self::IterationLimit | Self::Faulted
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::AwaitingDecision => "awaiting decision",
            Self::Paused => "paused",
            Self::Aborted => "aborted",
            Self::SafetyStop => "safety stop",
            Self::Converged => "converged",
            Self::IterationLimit => "iteration limit",
            Self::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Errors that end or refuse a session
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("a session is already active on {0}")]
    AlreadyActive(String),

    #[error("peak power {peak_power:.3} exceeds limit {limit:.3}, waveform not applied")]
    PeakPowerExceeded { peak_power: f64, limit: f64 },

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("AWG write failed: {0}")]
    Writer(#[from] WriterError),

    #[error("trace error: {0}")]
    Trace(#[from] TraceError),

    #[error("feedback measurement failed: {0}")]
    Acquisition(#[from] AcquisitionError),

    #[error(transparent)]
    Diagnostics(#[from] DiagnosticsError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot {operation} a session that is {state}")]
    InvalidState {
        state: SessionState,
        operation: &'static str,
    },
}
