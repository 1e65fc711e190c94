// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use duration_string::DurationString;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::Configuration;
use crate::backoff::BackoffConfig;
use crate::errors::ConfigError;

fn default_ping_interval() -> DurationString {
    Duration::from_secs(60).into()
}

fn default_ping_timeout() -> DurationString {
    Duration::from_secs(10).into()
}

fn default_ping_idle_connection() -> bool {
    false
}

fn default_backoff_cap() -> u32 {
    10
}

fn default_connect_timeout() -> DurationString {
    Duration::from_secs(0).into()
}

/// Lifecycle parameters for one shared HTTP/2 session per remote authority.
///
/// `ping_interval` doubles as the verification threshold: a session that has
/// been idle for longer than the interval is PING-verified before it is
/// handed out again. A GOAWAY carrying ENHANCE_YOUR_CALM doubles the interval
/// used by the *next* session, compounding up to `ping_interval_backoff_cap`
/// times the configured value.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone, JsonSchema)]
pub struct ConnectionConfig {
    /// Frequency of keep-alive pings on an open session, and the idle age
    /// beyond which a session is verified before reuse.
    #[serde(default = "default_ping_interval")]
    #[schemars(with = "String")]
    pub ping_interval: DurationString,

    /// How long to wait for a PING ack before declaring the session dead.
    #[serde(default = "default_ping_timeout")]
    #[schemars(with = "String")]
    pub ping_timeout: DurationString,

    /// If set, a session that stays idle this long is closed proactively.
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub idle_timeout: Option<DurationString>,

    /// Whether to keep sending keep-alive pings while no streams are open.
    #[serde(default = "default_ping_idle_connection")]
    pub ping_idle_connection: bool,

    /// Upper bound on the GOAWAY-driven ping interval multiplier.
    #[serde(default = "default_backoff_cap")]
    pub ping_interval_backoff_cap: u32,

    /// Timeout for a single connect attempt. Zero means no timeout.
    #[serde(default = "default_connect_timeout")]
    #[schemars(with = "String")]
    pub connect_timeout: DurationString,

    /// Backoff applied between connect attempts.
    #[serde(default)]
    pub backoff: BackoffConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            ping_interval: default_ping_interval(),
            ping_timeout: default_ping_timeout(),
            idle_timeout: None,
            ping_idle_connection: default_ping_idle_connection(),
            ping_interval_backoff_cap: default_backoff_cap(),
            connect_timeout: default_connect_timeout(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl ConnectionConfig {
    pub fn with_ping_interval(self, ping_interval: Duration) -> Self {
        Self {
            ping_interval: ping_interval.into(),
            ..self
        }
    }

    pub fn with_ping_timeout(self, ping_timeout: Duration) -> Self {
        Self {
            ping_timeout: ping_timeout.into(),
            ..self
        }
    }

    pub fn with_idle_timeout(self, idle_timeout: Duration) -> Self {
        Self {
            idle_timeout: Some(idle_timeout.into()),
            ..self
        }
    }

    pub fn with_ping_idle_connection(self, ping_idle_connection: bool) -> Self {
        Self {
            ping_idle_connection,
            ..self
        }
    }

    pub fn with_ping_interval_backoff_cap(self, ping_interval_backoff_cap: u32) -> Self {
        Self {
            ping_interval_backoff_cap,
            ..self
        }
    }

    pub fn with_connect_timeout(self, connect_timeout: Duration) -> Self {
        Self {
            connect_timeout: connect_timeout.into(),
            ..self
        }
    }

    pub fn with_backoff(self, backoff: BackoffConfig) -> Self {
        Self { backoff, ..self }
    }
}

impl Configuration for ConnectionConfig {
    type Error = ConfigError;

    fn validate(&self) -> Result<(), Self::Error> {
        if Duration::from(self.ping_interval).is_zero() {
            return Err(ConfigError::InvalidPingInterval);
        }
        if self.ping_interval_backoff_cap == 0 {
            return Err(ConfigError::InvalidBackoffCap);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_default_connection_config() {
        let config = ConnectionConfig::default();
        assert_eq!(Duration::from(config.ping_interval), Duration::from_secs(60));
        assert_eq!(Duration::from(config.ping_timeout), Duration::from_secs(10));
        assert_eq!(config.idle_timeout, None);
        assert!(!config.ping_idle_connection);
        assert_eq!(config.ping_interval_backoff_cap, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duration_strings_deserialize() {
        let json = r#"{
            "ping_interval": "15s",
            "ping_timeout": "250ms",
            "idle_timeout": "5m"
        }"#;
        let config: ConnectionConfig = serde_json::from_str(json).expect("deserialize");
        assert_eq!(Duration::from(config.ping_interval), Duration::from_secs(15));
        assert_eq!(Duration::from(config.ping_timeout), Duration::from_millis(250));
        assert_eq!(
            config.idle_timeout.map(Duration::from),
            Some(Duration::from_secs(300))
        );
    }

    #[test]
    fn test_zero_ping_interval_rejected() {
        let config = ConnectionConfig::default().with_ping_interval(Duration::ZERO);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPingInterval)
        ));
    }
}
