//! Configuration for Sealink clients and servers.

use std::time::Duration;

use crate::types::DEFAULT_COMPRESSION_THRESHOLD;

/// Configuration for a [`SecureClient`](crate::client::SecureClient).
///
/// All options have working defaults; chain the `with_*` setters for the
/// ones that matter:
///
/// ```
/// use sealink::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig::default()
///     .with_auto_reconnect(true)
///     .with_ping_interval(Duration::from_secs(10))
///     .with_client_identifier("smp");
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Reconnect automatically after an unexpected close.
    pub auto_reconnect: bool,
    /// Upper bound on reconnect attempts, -1 for unlimited.
    pub max_reconnect_attempts: i32,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Run the ping task while connected.
    pub enable_ping: bool,
    /// Period of the ping task.
    pub ping_interval: Duration,
    /// Upper bound on the transport-level connect.
    pub connection_timeout: Duration,
    /// Compress unencrypted frames larger than this many bytes, -1 to
    /// disable.
    pub compression_threshold: i32,
    /// Protocol version reported in the version exchange.
    pub protocol_version: String,
    /// Application name reported in the version exchange.
    pub client_name: String,
    /// Application version reported in the version exchange.
    pub client_version: String,
    /// Identifier to register after authentication, if any.
    pub client_identifier: Option<String>,
    /// Metadata sent with the identification.
    pub identification_metadata: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: false,
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_secs(3),
            enable_ping: true,
            ping_interval: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(10),
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            protocol_version: "1.0".to_string(),
            client_name: "Sealink-Client".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            client_identifier: None,
            identification_metadata: None,
        }
    }
}

impl ClientConfig {
    pub fn with_auto_reconnect(mut self, auto_reconnect: bool) -> Self {
        self.auto_reconnect = auto_reconnect;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: i32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_enable_ping(mut self, enable: bool) -> Self {
        self.enable_ping = enable;
        self
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_compression_threshold(mut self, threshold: i32) -> Self {
        self.compression_threshold = threshold;
        self
    }

    pub fn with_protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = version.into();
        self
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    pub fn with_client_version(mut self, version: impl Into<String>) -> Self {
        self.client_version = version.into();
        self
    }

    /// Identifier registered with the server after authentication (e.g.
    /// "smp"). When set, `PacketIdentification` is sent automatically.
    pub fn with_client_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.client_identifier = Some(identifier.into());
        self
    }

    pub fn with_identification_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.identification_metadata = Some(metadata.into());
        self
    }

    /// Whether an identifier is configured and non-empty.
    pub fn has_identification(&self) -> bool {
        self.client_identifier
            .as_deref()
            .is_some_and(|id| !id.is_empty())
    }
}

/// Configuration for a [`SecureServer`](crate::server::SecureServer).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Protocol version reported in the version exchange.
    pub protocol_version: String,
    /// Server name reported in the version exchange.
    pub server_name: String,
    /// Server version reported in the version exchange.
    pub server_version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            protocol_version: "1.0".to_string(),
            server_name: "Sealink-Server".to_string(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert!(!config.auto_reconnect);
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.reconnect_delay, Duration::from_secs(3));
        assert!(config.enable_ping);
        assert_eq!(config.ping_interval, Duration::from_secs(30));
        assert_eq!(config.connection_timeout, Duration::from_secs(10));
        assert_eq!(config.compression_threshold, 512);
        assert!(!config.has_identification());
    }

    #[test]
    fn test_setters_chain() {
        let config = ClientConfig::default()
            .with_auto_reconnect(true)
            .with_max_reconnect_attempts(-1)
            .with_client_identifier("smp")
            .with_identification_metadata("region:eu");
        assert!(config.auto_reconnect);
        assert_eq!(config.max_reconnect_attempts, -1);
        assert!(config.has_identification());
        assert_eq!(config.identification_metadata.as_deref(), Some("region:eu"));
    }

    #[test]
    fn test_empty_identifier_does_not_identify() {
        let config = ClientConfig::default().with_client_identifier("");
        assert!(!config.has_identification());
    }
}
