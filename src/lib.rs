//! Pulseshaper - closed-loop pulse shaping for programmable waveform generators
//!
//! This library re-exports the correction engine, device layer, session
//! controller and simulation backends from `pulseshaper-core`.

pub use pulseshaper_core::{correction, device, session, sim, trace};

pub use pulseshaper_core::{
    Backend, Decision, DeviceLock, FeedbackLoopController, SessionConfig, SessionError,
    SessionState, Trace,
};
pub use pulseshaper_core::{BUILD_DATE, VERSION};
