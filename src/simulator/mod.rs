//! Simulator subsystem for the thermostat temperature signal
//!
//! 1. [`model`] - pure state-and-transition temperature model
//! 2. [`simulator_handle`] - actor task owning the model, plus its cloneable handle
//!
//! # Architecture
//!
//! ```text
//! ConnectionDriver ──[ApplyHeaterCommand]──┐
//!                                          ▼
//!                               SimulatorActor (owns SimulatorState)
//!                                          ▲
//! Supervisor ───────[NextReading]──────────┘──► Reading
//! ```
//!
//! All state mutation happens on the actor task, so heater commands from the
//! MQTT event loop and ticks from the timer are serialized without locks.

pub mod model;
pub mod simulator_handle;

pub use model::{
    Direction, DriftSource, HeaterCommand, RandomDrift, Reading, Simulator, SimulatorState,
    UNIT_CELSIUS,
};
pub use simulator_handle::{SimulatorAction, SimulatorError, SimulatorHandle, SimulatorTick};
