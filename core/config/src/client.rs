// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use duration_string::DurationString;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::Configuration;
use crate::compression::CompressionConfig;
use crate::connection::ConnectionConfig;
use crate::errors::ConfigError;
use crate::limits::LimitsConfig;

fn default_request_timeout() -> DurationString {
    Duration::from_secs(0).into()
}

fn default_use_binary_format() -> bool {
    true
}

fn default_use_http_get() -> bool {
    false
}

/// Struct for the client configuration.
/// This struct contains the endpoint, the wire format and HTTP verb
/// selection, compression and byte-limit settings, per-request headers, and
/// the lifecycle parameters of the shared HTTP/2 session.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, JsonSchema)]
pub struct ClientConfig {
    /// The target the client will connect to, e.g. "http://host:port".
    pub endpoint: String,

    /// Serialize messages as binary (true) or JSON (false).
    #[serde(default = "default_use_binary_format")]
    pub use_binary_format: bool,

    /// Use GET for eligible (no-side-effect) unary calls (Connect only).
    #[serde(default = "default_use_http_get")]
    pub use_http_get: bool,

    /// Timeout per request. Zero means no timeout.
    #[serde(default = "default_request_timeout")]
    #[schemars(with = "String")]
    pub request_timeout: DurationString,

    /// The headers attached to every request.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Compression negotiation settings.
    #[serde(default)]
    pub compression: CompressionConfig,

    /// Read/write byte ceilings.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Lifecycle parameters for the shared HTTP/2 session.
    #[serde(default)]
    pub connection: ConnectionConfig,
}

/// Defaults for ClientConfig
impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            endpoint: String::new(),
            use_binary_format: default_use_binary_format(),
            use_http_get: default_use_http_get(),
            request_timeout: default_request_timeout(),
            headers: HashMap::new(),
            compression: CompressionConfig::default(),
            limits: LimitsConfig::default(),
            connection: ConnectionConfig::default(),
        }
    }
}

impl std::fmt::Display for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ClientConfig {{ endpoint: {}, use_binary_format: {}, use_http_get: {}, request_timeout: {:?}, headers: {:?}, compression: {:?}, limits: {:?}, connection: {:?} }}",
            self.endpoint,
            self.use_binary_format,
            self.use_http_get,
            self.request_timeout,
            self.headers,
            self.compression,
            self.limits,
            self.connection,
        )
    }
}

impl Configuration for ClientConfig {
    type Error = ConfigError;

    fn validate(&self) -> Result<(), Self::Error> {
        if self.endpoint.is_empty() {
            return Err(ConfigError::MissingEndpoint);
        }
        if !self.endpoint.starts_with("http://") && !self.endpoint.starts_with("https://") {
            return Err(ConfigError::InvalidEndpointScheme(self.endpoint.clone()));
        }
        self.limits.validate()?;
        self.connection.validate()?;
        if self.compression.compress_min_bytes > self.limits.write_max_bytes {
            return Err(ConfigError::InvalidCompressThreshold(
                self.compression.compress_min_bytes,
                self.limits.write_max_bytes,
            ));
        }
        Ok(())
    }
}

impl ClientConfig {
    /// Creates a new client configuration with the given endpoint.
    /// This function will return a ClientConfig with the endpoint set
    /// and all other fields set to default.
    pub fn with_endpoint(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            ..Self::default()
        }
    }

    pub fn with_use_binary_format(self, use_binary_format: bool) -> Self {
        Self {
            use_binary_format,
            ..self
        }
    }

    pub fn with_use_http_get(self, use_http_get: bool) -> Self {
        Self {
            use_http_get,
            ..self
        }
    }

    pub fn with_request_timeout(self, request_timeout: Duration) -> Self {
        Self {
            request_timeout: request_timeout.into(),
            ..self
        }
    }

    pub fn with_headers(self, headers: HashMap<String, String>) -> Self {
        Self { headers, ..self }
    }

    pub fn with_compression(self, compression: CompressionConfig) -> Self {
        Self {
            compression,
            ..self
        }
    }

    pub fn with_limits(self, limits: LimitsConfig) -> Self {
        Self { limits, ..self }
    }

    pub fn with_connection(self, connection: ConnectionConfig) -> Self {
        Self { connection, ..self }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_default_client_config() {
        let client = ClientConfig::default();
        assert_eq!(client.endpoint, String::new());
        assert!(client.use_binary_format);
        assert!(!client.use_http_get);
        assert_eq!(Duration::from(client.request_timeout), Duration::ZERO);
        assert!(client.headers.is_empty());
        assert!(matches!(client.validate(), Err(ConfigError::MissingEndpoint)));
    }

    #[test]
    fn test_endpoint_scheme_validation() {
        let client = ClientConfig::with_endpoint("http://localhost:8080");
        assert!(client.validate().is_ok());

        let client = ClientConfig::with_endpoint("unix:///tmp/trirpc.sock");
        assert!(matches!(
            client.validate(),
            Err(ConfigError::InvalidEndpointScheme(_))
        ));
    }

    #[test]
    fn test_client_config_roundtrip_json() {
        let mut headers = HashMap::new();
        headers.insert("x-trace".to_string(), "abc".to_string());

        let config = ClientConfig::with_endpoint("http://localhost:1234")
            .with_request_timeout(Duration::from_millis(750))
            .with_headers(headers.clone());

        let s = serde_json::to_string(&config).expect("serialize");
        let deser: ClientConfig = serde_json::from_str(&s).expect("deserialize");
        assert_eq!(deser.endpoint, "http://localhost:1234");
        assert_eq!(Duration::from(deser.request_timeout), Duration::from_millis(750));
        assert_eq!(deser.headers, headers);
    }

    #[test]
    fn test_compress_threshold_above_write_limit_rejected() {
        let client = ClientConfig::with_endpoint("http://localhost:1")
            .with_limits(LimitsConfig::default().with_write_max_bytes(100))
            .with_compression(CompressionConfig::default().with_compress_min_bytes(200));
        assert!(matches!(
            client.validate(),
            Err(ConfigError::InvalidCompressThreshold(200, 100))
        ));
    }
}
