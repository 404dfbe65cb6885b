use rumqttc::{MqttOptions, Transport};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

const REDACTED: &str = "********";

/// Broker connection, topics and publish behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    /// Empty username disables credentials
    pub username: String,
    pub password: String,
    /// A random suffix is appended so every process gets its own client id
    pub client_id_prefix: String,
    pub keep_alive_secs: u64,
    pub use_tls: bool,
    /// Outbound readings
    pub temperature_topic: String,
    /// Inbound heater commands
    pub heater_topic: String,
    /// Also publish a status report after every delivered reading
    pub publish_status: bool,
    pub status_topic: String,
    /// Upper bound for handing one reading to the transport
    pub publish_timeout_secs: u64,
    /// Capacity of the request queue between client and event loop
    pub request_channel_capacity: usize,
    pub reconnect: ReconnectConfig,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8883,
            username: String::new(),
            password: String::new(),
            client_id_prefix: "thermostat-simulator".to_string(),
            keep_alive_secs: 60,
            use_tls: true,
            temperature_topic: "thermostat/temperature".to_string(),
            heater_topic: "thermostat/heaterStatus".to_string(),
            publish_status: false,
            status_topic: "thermostat/status".to_string(),
            publish_timeout_secs: 5,
            request_channel_capacity: 32,
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// Bounds of the reconnect backoff in seconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub min_delay_secs: u64,
    pub max_delay_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            min_delay_secs: 1,
            max_delay_secs: 120,
        }
    }
}

impl MqttConfig {
    /// `<prefix>-<8 hex chars>`, fresh on every call
    pub fn client_id(&self) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{}-{}", self.client_id_prefix, &suffix[..8])
    }

    pub fn mqtt_options(&self, client_id: &str) -> MqttOptions {
        let mut options = MqttOptions::new(client_id, self.host.clone(), self.port);
        options
            .set_keep_alive(Duration::from_secs(self.keep_alive_secs))
            .set_clean_session(true);

        if !self.username.is_empty() {
            options.set_credentials(self.username.clone(), self.password.clone());
        }
        if self.use_tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        options
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }

    pub fn redacted(&self) -> Self {
        let password = if self.password.is_empty() {
            String::new()
        } else {
            REDACTED.to_string()
        };
        Self {
            password,
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.host.trim().is_empty() {
            return Err("mqtt.host must not be empty".to_string());
        }
        if self.port == 0 {
            return Err("mqtt.port must not be 0".to_string());
        }
        if self.keep_alive_secs < 5 {
            return Err(format!(
                "mqtt.keep_alive_secs must be at least 5, got {}",
                self.keep_alive_secs
            ));
        }
        if self.temperature_topic.is_empty() || self.heater_topic.is_empty() {
            return Err("mqtt topics must not be empty".to_string());
        }
        if self.temperature_topic == self.heater_topic {
            return Err("mqtt.temperature_topic and mqtt.heater_topic must differ".to_string());
        }
        if self.publish_status
            && (self.status_topic.is_empty()
                || self.status_topic == self.temperature_topic
                || self.status_topic == self.heater_topic)
        {
            return Err(format!(
                "mqtt.status_topic must be set and differ from the other topics, got {:?}",
                self.status_topic
            ));
        }
        if self.publish_timeout_secs == 0 {
            return Err("mqtt.publish_timeout_secs must be at least 1".to_string());
        }
        if self.request_channel_capacity == 0 {
            return Err("mqtt.request_channel_capacity must be at least 1".to_string());
        }
        if self.reconnect.min_delay_secs == 0 {
            return Err("mqtt.reconnect.min_delay_secs must be at least 1".to_string());
        }
        if self.reconnect.min_delay_secs > self.reconnect.max_delay_secs {
            return Err(format!(
                "mqtt.reconnect.min_delay_secs ({}) is above max_delay_secs ({})",
                self.reconnect.min_delay_secs, self.reconnect.max_delay_secs
            ));
        }
        Ok(())
    }
}
