//! Client configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::{Result, SdcpError};

/// UDP port for discovery and broker registration.
pub const DEFAULT_UDP_PORT: u16 = 3000;

/// A push-upload endpoint: request path plus the query parameter naming the target directory.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PushEndpoint {
    /// Request path, e.g. `/upload`.
    pub path: String,
    /// Query parameter carrying the destination directory.
    #[serde(default = "default_dir_param")]
    pub dir_param: String,
}

impl PushEndpoint {
    /// Create an endpoint.
    pub fn new(path: impl Into<String>, dir_param: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            dir_param: dir_param.into(),
        }
    }
}

fn default_dir_param() -> String {
    "path".into()
}

/// Connection and upload settings for [`crate::SdcpClient`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// WebSocket ports to probe, in order.
    pub ws_ports: Vec<u16>,
    /// WebSocket paths to probe on every port, in order.
    pub ws_paths: Vec<String>,
    /// Printer UDP port.
    pub udp_port: u16,
    /// Per-candidate WebSocket handshake timeout.
    #[serde(deserialize_with = "secs")]
    pub handshake_timeout: Duration,
    /// Default command response timeout.
    #[serde(deserialize_with = "secs")]
    pub command_timeout: Duration,
    /// Response timeout for the pull-upload command.
    #[serde(deserialize_with = "secs")]
    pub upload_command_timeout: Duration,
    /// Overall time allowed for the printer to finish pulling a file.
    #[serde(deserialize_with = "secs")]
    pub transfer_timeout: Duration,
    /// Ports tried by the push fallback.
    pub push_ports: Vec<u16>,
    /// Endpoints tried on every push port.
    pub push_endpoints: Vec<PushEndpoint>,
    /// Timeout of one push attempt.
    #[serde(deserialize_with = "secs")]
    pub push_attempt_timeout: Duration,
    /// Time allowed for the broker CONNACK.
    #[serde(deserialize_with = "secs")]
    pub mqtt_connect_timeout: Duration,
    /// MQTT keep-alive interval.
    #[serde(deserialize_with = "secs")]
    pub mqtt_keep_alive: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            ws_ports: vec![3031, 3030],
            ws_paths: vec!["/websocket".into(), "/ws".into(), "/".into()],
            udp_port: DEFAULT_UDP_PORT,
            handshake_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(5),
            upload_command_timeout: Duration::from_secs(10),
            transfer_timeout: Duration::from_secs(120),
            push_ports: vec![80, 3031, 3030],
            push_endpoints: default_push_endpoints(),
            push_attempt_timeout: Duration::from_secs(5),
            mqtt_connect_timeout: Duration::from_secs(5),
            mqtt_keep_alive: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| SdcpError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.ws_ports.is_empty() || self.ws_paths.is_empty() {
            return Err(SdcpError::Config(
                "ws_ports and ws_paths must not be empty".into(),
            ));
        }
        if self.transfer_timeout.is_zero() || self.command_timeout.is_zero() {
            return Err(SdcpError::Config("timeouts must be positive".into()));
        }
        Ok(())
    }
}

/// Upload endpoints seen across firmware revisions. None is known to be authoritative.
pub fn default_push_endpoints() -> Vec<PushEndpoint> {
    [
        ("/upload", "path"),
        ("/upload", "dir"),
        ("/upload", "folder"),
        ("/upload_gcode", "path"),
        ("/upload_gcode", "dir"),
        ("/file/upload", "path"),
        ("/files/upload", "path"),
        ("/api/upload", "path"),
        ("/api/files", "path"),
        ("/local/upload", "path"),
        ("/api/local/upload", "path"),
        ("/gcode/upload", "path"),
    ]
    .into_iter()
    .map(|(path, param)| PushEndpoint::new(path, param))
    .collect()
}

fn secs<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let value = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(value).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.ws_ports, vec![3031, 3030]);
        assert_eq!(config.ws_paths.len(), 3);
        assert_eq!(config.push_endpoints.len(), 12);
        assert_eq!(config.transfer_timeout, Duration::from_secs(120));
    }

    #[test]
    fn test_partial_toml() {
        let config = ClientConfig::from_toml_str(
            r#"
            ws_ports = [3030]
            command_timeout = 2.5

            [[push_endpoints]]
            path = "/upload"
            "#,
        )
        .unwrap();

        assert_eq!(config.ws_ports, vec![3030]);
        assert_eq!(config.ws_paths.len(), 3);
        assert_eq!(config.command_timeout, Duration::from_millis(2500));
        assert_eq!(config.push_endpoints, vec![PushEndpoint::new("/upload", "path")]);
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(ClientConfig::from_toml_str("ws_ports = []").is_err());
        assert!(ClientConfig::from_toml_str("command_timeout = -1.0").is_err());
        assert!(ClientConfig::from_toml_str("udp_port = \"x\"").is_err());
    }
}
