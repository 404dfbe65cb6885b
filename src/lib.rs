//! # thermostat-sim
//!
//! Simulated thermostat sensor/actuator pair speaking MQTT.
//!
//! ```text
//!                 heater command                     reading
//! Broker ──► ConnectionDriver ──► SimulatorHandle ──► Supervisor ──► MqttSession ──► Broker
//!            (event loop task)    (actor task)        (tick timer)   (publish)
//! ```
//!
//! - [`simulator`] - temperature model and the actor that owns its state
//! - [`mqtt`] - session lifecycle, reconnect backoff, payload codecs
//! - [`supervisor`] - periodic driver loop and failure classification
//! - [`config`] - TOML configuration with environment overrides

pub mod config;
pub mod error;
pub mod mqtt;
pub mod simulator;
pub mod supervisor;
