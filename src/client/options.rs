//! Client connection options

use std::time::Duration;

use bytes::Bytes;

use crate::config::{ConfigError, Timings, DEFAULT_MAX_PACKET_SIZE};
use crate::protocol::{Connect, LastWill, QoS};

/// Settings for [`Client`](super::Client)
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub client_id: String,
    /// Zero disables keep-alive
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub last_will: Option<LastWill>,
    /// Subscribed after every successful connect
    pub subscriptions: Vec<(String, QoS)>,
    pub max_packet_size: usize,
    pub timings: Timings,
}

impl ClientOptions {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into().trim().to_string(),
            keep_alive: Duration::from_secs(60),
            clean_session: true,
            username: None,
            password: None,
            last_will: None,
            subscriptions: Vec::new(),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            timings: Timings::default(),
        }
    }

    /// Options with a client identifier built from `prefix`, the host name
    /// and the process id
    pub fn generated(prefix: &str) -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        Self::new(format!("{}-{}-{}", prefix, hostname, std::process::id()))
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_clean_session(mut self, clean_session: bool) -> Self {
        self.clean_session = clean_session;
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_last_will(
        mut self,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
    ) -> Self {
        self.last_will = Some(LastWill {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
        });
        self
    }

    /// Subscribe to `filter` as soon as the connection is up
    pub fn with_subscription(mut self, filter: impl Into<String>, qos: QoS) -> Self {
        self.subscriptions.push((filter.into(), qos));
        self
    }

    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.timings = timings;
        self
    }

    pub fn with_max_packet_size(mut self, max_packet_size: usize) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }

    /// Topic used by [`Client::publish_json`](super::Client::publish_json)
    /// when none is given
    pub fn default_topic(&self) -> String {
        format!("client/{}", self.client_id)
    }

    pub(crate) fn to_connect(&self) -> Result<Connect, ConfigError> {
        let keep_alive = u16::try_from(self.keep_alive.as_secs()).map_err(|_| {
            ConfigError::InvalidValue("keep_alive", format!("{:?}", self.keep_alive))
        })?;
        if self.password.is_some() && self.username.is_none() {
            return Err(ConfigError::InvalidValue(
                "password",
                "password requires a username".to_string(),
            ));
        }

        let mut connect = Connect::new(self.client_id.clone(), keep_alive);
        connect.clean_session = self.clean_session;
        connect.username = self.username.clone();
        connect.password = self.password.clone().map(Bytes::from);
        connect.will = self.last_will.clone();
        Ok(connect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_packet_from_options() {
        let options = ClientOptions::new(" sensor-1 ")
            .with_keep_alive(Duration::from_secs(30))
            .with_clean_session(false)
            .with_credentials("user", "pass")
            .with_last_will("status/sensor-1", "offline", QoS::AtLeastOnce, true);

        let connect = options.to_connect().unwrap();
        assert_eq!(connect.client_id, "sensor-1");
        assert_eq!(connect.keep_alive, 30);
        assert!(!connect.clean_session);
        assert_eq!(connect.password, Some(Bytes::from_static(b"pass")));
        assert_eq!(connect.will.unwrap().topic, "status/sensor-1");
    }

    #[test]
    fn test_keep_alive_out_of_range() {
        let options = ClientOptions::new("c").with_keep_alive(Duration::from_secs(70_000));
        assert!(options.to_connect().is_err());
    }

    #[test]
    fn test_generated_id_and_default_topic() {
        let options = ClientOptions::generated("mqttd");
        assert!(options.client_id.starts_with("mqttd-"));
        assert!(options
            .client_id
            .ends_with(&format!("-{}", std::process::id())));
        assert_eq!(options.default_topic(), format!("client/{}", options.client_id));
    }
}
