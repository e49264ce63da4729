//! Debounced alarm: pure transitions in [`state`], timers and fan-out in
//! [`controller`].

pub mod controller;
pub mod state;

pub use controller::{AlarmCallback, AlarmController, AlarmSnapshot};
pub use state::{AlarmPhase, AlarmState, AlarmTimings, Observation};
