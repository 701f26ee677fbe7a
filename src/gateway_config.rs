//! Public, transport-agnostic connection configuration.
//!
//! This type intentionally contains no transport-specific concepts
//! (e.g. rumqttc client options). Transport layers are responsible for
//! interpreting this config into concrete connection settings.

use crate::QosLevel;

/// Broker connection parameters for the gateway client.
///
/// # Example
///
/// ```
/// use mqtt_gateway::GatewayConfig;
///
/// let config = GatewayConfig::new("mqtt://localhost:1883", "dashboard-server")
///     .with_credentials("iot", "secret")
///     .with_keep_alive(30);
/// ```
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    // ---
    /// Broker URL (e.g. `"mqtt://localhost:1883"`). `tcp://` and bare
    /// `host:port` forms are accepted by the rumqttc transport.
    pub broker_url: String,

    /// MQTT client identifier presented to the broker.
    pub client_id: String,

    /// Optional broker username.
    pub username: Option<String>,

    /// Optional broker password.
    pub password: Option<String>,

    /// Broker keep-alive interval in seconds.
    pub keep_alive_secs: Option<u16>,

    /// QoS applied to publishes that do not specify one.
    pub default_qos: QosLevel,
}

impl GatewayConfig {
    // ---
    /// Create a config for the given broker URL and client identifier.
    pub fn new(broker_url: impl Into<String>, client_id: impl Into<String>) -> Self {
        // ---
        Self {
            broker_url: broker_url.into(),
            client_id: client_id.into(),
            username: None,
            password: None,
            keep_alive_secs: None,
            default_qos: QosLevel::AtMostOnce,
        }
    }

    /// Set broker credentials.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        // ---
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set the broker keep-alive interval.
    pub fn with_keep_alive(mut self, secs: u16) -> Self {
        // ---
        self.keep_alive_secs = Some(secs);
        self
    }

    /// Set the default publish QoS.
    pub fn with_default_qos(mut self, qos: QosLevel) -> Self {
        // ---
        self.default_qos = qos;
        self
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn defaults_are_anonymous_qos0() {
        // ---
        let config = GatewayConfig::new("mqtt://broker:1883", "c1");

        assert!(config.username.is_none());
        assert!(config.password.is_none());
        assert!(config.keep_alive_secs.is_none());
        assert_eq!(config.default_qos, QosLevel::AtMostOnce);
    }

    #[test]
    fn builder_setters_apply() {
        // ---
        let config = GatewayConfig::new("mqtt://broker:1883", "c1")
            .with_credentials("user", "pass")
            .with_keep_alive(45)
            .with_default_qos(QosLevel::AtLeastOnce);

        assert_eq!(config.username.as_deref(), Some("user"));
        assert_eq!(config.password.as_deref(), Some("pass"));
        assert_eq!(config.keep_alive_secs, Some(45));
        assert_eq!(config.default_qos, QosLevel::AtLeastOnce);
    }
}
