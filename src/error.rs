//! Error taxonomy shared by the simulator, the MQTT session and the supervisor.
//!
//! Every module returns its own `thiserror` enum. [`ThermostatError`] aggregates
//! them so the supervisor can make a single retry-or-shutdown decision via
//! [`ThermostatError::severity`].

use thiserror::Error;

use crate::config::ConfigError;
use crate::mqtt::mqtt_handler::SessionError;
use crate::simulator::SimulatorError;

/// How the supervisor reacts to a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Logged; the system keeps running (reconnect, next tick, drop message)
    Recoverable,
    /// The session is in an unknown state; drain and shut down
    Fatal,
}

#[derive(Debug, Error)]
pub enum ThermostatError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Simulator error: {0}")]
    Simulator(#[from] SimulatorError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

impl ThermostatError {
    pub fn severity(&self) -> Severity {
        match self {
            ThermostatError::Session(e) => e.severity(),
            // A bad config or a dead simulator actor cannot be fixed by waiting
            ThermostatError::Config(_) | ThermostatError::Simulator(_) => Severity::Fatal,
        }
    }
}
