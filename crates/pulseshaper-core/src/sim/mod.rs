//! Simulation backends
//!
//! Stand-ins for the instruments so the loop can run without hardware:
//! - [`SimulatedAwg`]: in-memory AWG serving the real PV names
//! - [`SimulatedScope`]: detector reading the simulated AWG
//! - [`AmplifierModel`]: optional gain-saturation stage between the two

pub mod awg;
pub mod model;
pub mod scope;

pub use awg::{PvWrite, SimulatedAwg};
pub use model::{AmplifierModel, AmplifierParams};
pub use scope::{ScopeHandle, ScopeSettings, SimulatedScope};
