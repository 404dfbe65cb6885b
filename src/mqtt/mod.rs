//! # MQTT Integration Module
//!
//! Keeps one MQTT session to the broker alive, routes heater commands from the
//! command topic into the simulator and publishes one reading per tick.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs           - Broker, topic and reconnect settings
//! ├── backoff.rs          - Bounded doubling reconnect delay
//! ├── message_manager.rs  - Inbound messages, reading and status JSON codecs
//! └── mqtt_handler.rs     - Session lifecycle and connection state machine
//! ```
//!
//! ## Delivery Policy
//!
//! Readings go out with QoS 1 (at-least-once hand-off to the transport) and are
//! not retained. With `publish_status` enabled every delivered reading is
//! followed by a status report on the status topic. A reading that cannot be
//! handed off is logged and dropped; the next tick supersedes it. Fresh data
//! wins over a complete history.
//!
//! ## Failure Handling
//!
//! - Connection failures move the session to `Reconnecting` and retry after a
//!   backoff of 1s doubling up to 120s
//! - Malformed inbound payloads are logged and dropped without touching the
//!   connection state
//! - A closed request channel or a dead event loop is reported to the
//!   supervisor as fatal, a panicked event loop together with its panic message

pub mod backoff;
pub mod config;
pub mod message_manager;
pub mod mqtt_handler;

pub use backoff::ReconnectBackoff;
pub use config::{MqttConfig, ReconnectConfig};
pub use message_manager::SystemStatus;
pub use mqtt_handler::{
    ConnectionState, MqttSession, PublishOutcome, SessionError, SessionStats,
};
