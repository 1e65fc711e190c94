// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

use trirpc_config::errors::ConfigError;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: String,
        source: std::io::Error,
    },

    #[error("server is already shut down")]
    AlreadyClosed,
}
