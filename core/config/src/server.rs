// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use duration_string::DurationString;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::Configuration;
use crate::compression::CompressionConfig;
use crate::errors::ConfigError;
use crate::limits::LimitsConfig;

fn default_max_timeout() -> DurationString {
    // Callers asking for more than this are rejected outright.
    Duration::from_secs(10 * 60).into()
}

fn default_require_protocol_header() -> bool {
    false
}

fn default_enable_get() -> bool {
    false
}

fn default_drain_timeout() -> DurationString {
    Duration::from_secs(10).into()
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, JsonSchema)]
pub struct ServerConfig {
    /// Endpoint is the address to listen on, e.g. "127.0.0.1:50051".
    pub endpoint: String,

    /// Upper bound accepted from timeout headers; larger values are rejected.
    #[serde(default = "default_max_timeout")]
    #[schemars(with = "String")]
    pub max_timeout: DurationString,

    /// Reject Connect/Triple requests without the protocol-version header.
    #[serde(default = "default_require_protocol_header")]
    pub require_protocol_header: bool,

    /// Accept GET for no-side-effect unary methods (Connect only).
    #[serde(default = "default_enable_get")]
    pub enable_get: bool,

    /// Compression negotiation settings.
    #[serde(default)]
    pub compression: CompressionConfig,

    /// Read/write byte ceilings.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// How long shutdown waits for in-flight calls before aborting them.
    #[serde(default = "default_drain_timeout")]
    #[schemars(with = "String")]
    pub drain_timeout: DurationString,
}

/// Defaults for ServerConfig
impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            max_timeout: default_max_timeout(),
            require_protocol_header: default_require_protocol_header(),
            enable_get: default_enable_get(),
            compression: CompressionConfig::default(),
            limits: LimitsConfig::default(),
            drain_timeout: default_drain_timeout(),
        }
    }
}

impl std::fmt::Display for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ServerConfig {{ endpoint: {}, max_timeout: {:?}, require_protocol_header: {}, enable_get: {}, compression: {:?}, limits: {:?}, drain_timeout: {:?} }}",
            self.endpoint,
            self.max_timeout,
            self.require_protocol_header,
            self.enable_get,
            self.compression,
            self.limits,
            self.drain_timeout,
        )
    }
}

impl Configuration for ServerConfig {
    type Error = ConfigError;

    fn validate(&self) -> Result<(), Self::Error> {
        if self.endpoint.is_empty() {
            return Err(ConfigError::MissingEndpoint);
        }
        if Duration::from(self.max_timeout).is_zero() {
            return Err(ConfigError::InvalidMaxTimeout);
        }
        self.limits.validate()?;
        Ok(())
    }
}

impl ServerConfig {
    /// Creates a new server configuration with the given listen endpoint.
    pub fn with_endpoint(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            ..Self::default()
        }
    }

    pub fn with_max_timeout(self, max_timeout: Duration) -> Self {
        Self {
            max_timeout: max_timeout.into(),
            ..self
        }
    }

    pub fn with_require_protocol_header(self, require_protocol_header: bool) -> Self {
        Self {
            require_protocol_header,
            ..self
        }
    }

    pub fn with_enable_get(self, enable_get: bool) -> Self {
        Self { enable_get, ..self }
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

    pub fn with_drain_timeout(self, drain_timeout: Duration) -> Self {
        Self {
            drain_timeout: drain_timeout.into(),
            ..self
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_default_server_config() {
        let server = ServerConfig::default();
        assert_eq!(server.endpoint, String::new());
        assert_eq!(Duration::from(server.max_timeout), Duration::from_secs(600));
        assert!(!server.require_protocol_header);
        assert!(!server.enable_get);
        assert!(matches!(server.validate(), Err(ConfigError::MissingEndpoint)));
    }

    #[test]
    fn test_server_config_validation() {
        let server = ServerConfig::with_endpoint("127.0.0.1:50051");
        assert!(server.validate().is_ok());

        let server = server.with_max_timeout(Duration::ZERO);
        assert!(matches!(
            server.validate(),
            Err(ConfigError::InvalidMaxTimeout)
        ));
    }

    #[test]
    fn test_server_config_deserialize_durations() {
        let json = r#"{
            "endpoint": "0.0.0.0:8080",
            "max_timeout": "30s",
            "drain_timeout": "2s"
        }"#;
        let server: ServerConfig = serde_json::from_str(json).expect("deserialize");
        assert_eq!(Duration::from(server.max_timeout), Duration::from_secs(30));
        assert_eq!(Duration::from(server.drain_timeout), Duration::from_secs(2));
    }
}
