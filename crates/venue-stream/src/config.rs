/*
[INPUT]:  YAML settings file or string for one venue stream
[OUTPUT]: Parsed StreamSettings plus stream-wide default constants
[POS]:    Configuration layer - per-venue stream settings
[UPDATE]: When adding new settings or changing defaults
*/

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Default capacity of the inbound and outbound event queues
pub const DEFAULT_JOB_BUFFER: usize = 5000;
/// Connection monitor tick used when none is configured
pub const DEFAULT_CONNECTION_MONITOR_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_TRAFFIC_TIMEOUT: Duration = Duration::from_secs(30);
pub const MIN_TRAFFIC_TIMEOUT: Duration = Duration::from_secs(1);
/// Pause between traffic checks while connected, limits work under bursty traffic
pub const TRAFFIC_CHECK_PERIOD: Duration = Duration::from_secs(1);
pub const DEFAULT_RESPONSE_MAX_LIMIT: Duration = Duration::from_secs(7);
/// Placeholder URL in settings meaning "use the venue default"
pub const WEBSOCKET_URL_NON_DEFAULT_MESSAGE: &str = "NON_DEFAULT_HTTP_LINK_TO_WEBSOCKET_EXCHANGE";

/// Settings for one venue's streaming connection
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamSettings {
    /// Exchange name, used in every log line and error
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Running (unauthenticated) websocket URL
    #[serde(default)]
    pub websocket_url: String,
    #[serde(default)]
    pub websocket_auth_url: String,
    /// HTTP proxy used to tunnel websocket connections
    #[serde(default)]
    pub proxy: String,
    #[serde(
        default = "default_traffic_timeout",
        rename = "traffic_timeout_ms",
        with = "duration_ms"
    )]
    pub traffic_timeout: Duration,
    #[serde(default, rename = "connection_monitor_delay_ms", with = "duration_ms")]
    pub connection_monitor_delay: Duration,
    #[serde(default)]
    pub authenticated_support: bool,
    #[serde(default)]
    pub trade_feed: bool,
    #[serde(default)]
    pub fill_feed: bool,
    #[serde(default)]
    pub orderbook: OrderbookBufferConfig,
}

/// Local order book buffer behaviour, passed through to the buffer collaborator
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct OrderbookBufferConfig {
    #[serde(default)]
    pub buffer_enabled: bool,
    #[serde(default)]
    pub sort_buffer: bool,
    #[serde(default)]
    pub sort_buffer_by_update_ids: bool,
    #[serde(default)]
    pub update_entries_by_id: bool,
}

impl StreamSettings {
    /// Settings with defaults for everything but the exchange name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: default_enabled(),
            websocket_url: String::new(),
            websocket_auth_url: String::new(),
            proxy: String::new(),
            traffic_timeout: default_traffic_timeout(),
            connection_monitor_delay: Duration::ZERO,
            authenticated_support: false,
            trade_feed: false,
            fill_feed: false,
            orderbook: OrderbookBufferConfig::default(),
        }
    }

    /// Load settings from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::from)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let settings: Self = serde_yaml::from_str(content).map_err(ConfigError::from)?;
        Ok(settings)
    }
}

fn default_enabled() -> bool {
    true
}

fn default_traffic_timeout() -> Duration {
    DEFAULT_TRAFFIC_TIMEOUT
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let settings = StreamSettings::from_yaml_str("name: bitfinex\n").unwrap();
        assert_eq!(settings.name, "bitfinex");
        assert!(settings.enabled);
        assert_eq!(settings.traffic_timeout, DEFAULT_TRAFFIC_TIMEOUT);
        assert_eq!(settings.connection_monitor_delay, Duration::ZERO);
        assert!(settings.proxy.is_empty());
        assert_eq!(settings.orderbook, OrderbookBufferConfig::default());
    }

    #[test]
    fn test_full_yaml() {
        let yaml = r#"
name: btse
enabled: false
websocket_url: wss://ws.btse.com/ws/spot
websocket_auth_url: wss://ws.btse.com/ws/spot/auth
proxy: http://127.0.0.1:8080
traffic_timeout_ms: 45000
connection_monitor_delay_ms: 500
authenticated_support: true
trade_feed: true
orderbook:
  buffer_enabled: true
  sort_buffer: true
"#;
        let settings = StreamSettings::from_yaml_str(yaml).unwrap();
        assert!(!settings.enabled);
        assert_eq!(settings.websocket_url, "wss://ws.btse.com/ws/spot");
        assert_eq!(settings.traffic_timeout, Duration::from_secs(45));
        assert_eq!(settings.connection_monitor_delay, Duration::from_millis(500));
        assert!(settings.authenticated_support);
        assert!(settings.trade_feed);
        assert!(!settings.fill_feed);
        assert!(settings.orderbook.buffer_enabled);
        assert!(settings.orderbook.sort_buffer);
        assert!(!settings.orderbook.update_entries_by_id);
    }

    #[test]
    fn test_missing_name_is_parse_error() {
        let err = StreamSettings::from_yaml_str("enabled: true\n").unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = StreamSettings::from_file("/nonexistent/venue-stream.yaml").unwrap_err();
        assert!(matches!(
            err,
            crate::error::StreamError::Config(ConfigError::Read(_))
        ));
    }
}
