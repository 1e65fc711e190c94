// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// CompressionType represents the message compression algorithms understood
/// by the envelope codec. `Identity` means no compression.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Default, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    Gzip,
    #[serde(alias = "br")]
    Brotli,
    #[default]
    Identity,
}

impl CompressionType {
    /// Determines if the compression type actually transforms the payload.
    pub fn is_compressed(&self) -> bool {
        *self != CompressionType::Identity
    }

    /// Wire token used in `content-encoding` style headers.
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionType::Gzip => "gzip",
            CompressionType::Brotli => "br",
            CompressionType::Identity => "identity",
        }
    }
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Implement the FromStr trait to handle string conversion and parsing
impl FromStr for CompressionType {
    type Err = CompressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gzip" => Ok(CompressionType::Gzip),
            "br" | "brotli" => Ok(CompressionType::Brotli),
            "identity" | "" => Ok(CompressionType::Identity),
            _ => Err(CompressionError::UnsupportedType(s.to_string())),
        }
    }
}

/// Custom error type for handling unsupported compression types
#[derive(Error, Debug)]
pub enum CompressionError {
    // Parsing / unsupported compression type
    #[error("unsupported compression type {0}")]
    UnsupportedType(String),
}

fn default_accept() -> Vec<CompressionType> {
    vec![CompressionType::Gzip, CompressionType::Brotli]
}

fn default_compress_min_bytes() -> usize {
    1024
}

/// Compression settings shared by clients and servers: the ordered list of
/// algorithms offered/accepted during negotiation, and the minimum payload
/// size below which compression is skipped entirely.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, JsonSchema)]
pub struct CompressionConfig {
    /// Accepted compression algorithms, in preference order.
    #[serde(default = "default_accept")]
    pub accept: Vec<CompressionType>,

    /// Payloads smaller than this are sent uncompressed even when a
    /// compression algorithm was negotiated.
    #[serde(default = "default_compress_min_bytes")]
    pub compress_min_bytes: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        CompressionConfig {
            accept: default_accept(),
            compress_min_bytes: default_compress_min_bytes(),
        }
    }
}

impl CompressionConfig {
    pub fn with_accept(self, accept: Vec<CompressionType>) -> Self {
        Self { accept, ..self }
    }

    pub fn with_compress_min_bytes(self, compress_min_bytes: usize) -> Self {
        Self {
            compress_min_bytes,
            ..self
        }
    }

    /// Value advertised in accept-encoding style headers, e.g. "gzip, br".
    pub fn accept_header_value(&self) -> String {
        self.accept
            .iter()
            .map(|c| c.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_compression_type_parsing() {
        assert_eq!("gzip".parse::<CompressionType>().unwrap(), CompressionType::Gzip);
        assert_eq!("br".parse::<CompressionType>().unwrap(), CompressionType::Brotli);
        assert_eq!("brotli".parse::<CompressionType>().unwrap(), CompressionType::Brotli);
        assert_eq!("identity".parse::<CompressionType>().unwrap(), CompressionType::Identity);
        assert_eq!("".parse::<CompressionType>().unwrap(), CompressionType::Identity);
        assert!("zstd".parse::<CompressionType>().is_err());
    }

    #[test]
    fn test_default_compression_config() {
        let config = CompressionConfig::default();
        assert_eq!(config.accept, vec![CompressionType::Gzip, CompressionType::Brotli]);
        assert_eq!(config.compress_min_bytes, 1024);
        assert_eq!(config.accept_header_value(), "gzip, br");
    }

    #[test]
    fn test_compression_config_deserialize() {
        let json = r#"{ "accept": ["br"], "compress_min_bytes": 512 }"#;
        let config: CompressionConfig = serde_json::from_str(json).expect("deserialize");
        assert_eq!(config.accept, vec![CompressionType::Brotli]);
        assert_eq!(config.compress_min_bytes, 512);
    }
}
