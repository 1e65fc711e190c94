// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    // Endpoint validation
    #[error("missing endpoint")]
    MissingEndpoint,
    #[error("invalid endpoint scheme, expected http or https: {0}")]
    InvalidEndpointScheme(String),
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    // Header validation
    #[error("invalid header name: {0}")]
    InvalidHeaderName(String),
    #[error("invalid header value: {0}")]
    InvalidHeaderValue(String),

    // Limits
    #[error("read_max_bytes must be greater than zero")]
    InvalidReadLimit,
    #[error("write_max_bytes must be greater than zero")]
    InvalidWriteLimit,
    #[error("compress_min_bytes {0} exceeds write_max_bytes {1}")]
    InvalidCompressThreshold(usize, usize),

    // Connection manager
    #[error("ping_interval must be greater than zero")]
    InvalidPingInterval,
    #[error("ping_interval_backoff_cap must be at least 1")]
    InvalidBackoffCap,
    #[error("max_timeout must be greater than zero")]
    InvalidMaxTimeout,
}
