// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::Configuration;
use crate::errors::ConfigError;

fn default_read_max_bytes() -> usize {
    u32::MAX as usize
}

fn default_write_max_bytes() -> usize {
    u32::MAX as usize
}

/// Byte ceilings applied by the serialization layer and the envelope codec.
/// `read_max_bytes` bounds a single decoded message (after decompression);
/// `write_max_bytes` bounds a single encoded message (before compression).
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, JsonSchema)]
pub struct LimitsConfig {
    #[serde(default = "default_read_max_bytes")]
    pub read_max_bytes: usize,

    #[serde(default = "default_write_max_bytes")]
    pub write_max_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig {
            read_max_bytes: default_read_max_bytes(),
            write_max_bytes: default_write_max_bytes(),
        }
    }
}

impl LimitsConfig {
    pub fn with_read_max_bytes(self, read_max_bytes: usize) -> Self {
        Self {
            read_max_bytes,
            ..self
        }
    }

    pub fn with_write_max_bytes(self, write_max_bytes: usize) -> Self {
        Self {
            write_max_bytes,
            ..self
        }
    }
}

impl Configuration for LimitsConfig {
    type Error = ConfigError;

    fn validate(&self) -> Result<(), Self::Error> {
        if self.read_max_bytes == 0 {
            return Err(ConfigError::InvalidReadLimit);
        }
        if self.write_max_bytes == 0 {
            return Err(ConfigError::InvalidWriteLimit);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = LimitsConfig::default();
        assert_eq!(limits.read_max_bytes, u32::MAX as usize);
        assert_eq!(limits.write_max_bytes, u32::MAX as usize);
        assert!(limits.validate().is_ok());
    }

    #[test]
    fn test_zero_limits_rejected() {
        let limits = LimitsConfig::default().with_read_max_bytes(0);
        assert!(matches!(limits.validate(), Err(ConfigError::InvalidReadLimit)));

        let limits = LimitsConfig::default().with_write_max_bytes(0);
        assert!(matches!(limits.validate(), Err(ConfigError::InvalidWriteLimit)));
    }
}
