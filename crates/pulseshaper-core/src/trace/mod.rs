//! Detector and reference traces
//!
//! This module contains everything needed to turn raw samples into a
//! comparable normalized curve:
//! - Trace storage with immutable raw data ([`curve`])
//! - The fixed-order transform pipeline ([`processor`])
//! - Reference shapes for building targets ([`shapes`])

pub mod curve;
pub mod processor;
pub mod shapes;

pub use curve::{
    read_column, write_column, LoadOptions, Trace, TraceKind, TrimMethod, DEFAULT_PULSE_POINTS,
};
pub use processor::{ProcessRequest, Stage, StageKind, TraceProcessor};

use thiserror::Error;

/// Errors raised while loading or processing a trace
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("{kind} traces do not support the {stage} stage")]
    UnsupportedOperation { stage: StageKind, kind: TraceKind },

    #[error("crop [{start}..{end}) exceeds buffer of {available} samples", end = .start + .length)]
    Range {
        start: usize,
        length: usize,
        available: usize,
    },

    #[error("cannot apply {0} to an empty buffer")]
    EmptyInput(StageKind),

    #[error("length mismatch: expected {expected} samples, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("unrecognised stage: {0}")]
    UnknownStage(String),

    #[error("stage requested more than once: {0}")]
    DuplicateStage(StageKind),

    #[error("invalid value on line {line}: {value:?}")]
    Parse { line: usize, value: String },

    #[error("curve file I/O failed: {0}")]
    Io(#[from] std::io::Error),
}
