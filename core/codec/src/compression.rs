// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use std::io::{Read, Write};

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use trirpc_config::compression::CompressionType;

use crate::errors::CodecError;

/// A concrete compression algorithm. `Identity` never appears here; absence
/// of compression is modeled as `Option<Compression>::None` throughout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Brotli,
}

impl Compression {
    /// Wire token as it appears in content-encoding style headers.
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::Gzip => "gzip",
            Compression::Brotli => "br",
        }
    }

    /// Parses a single wire token. Returns `None` for identity and for
    /// anything unrecognized; callers distinguish the two by inspecting the
    /// token themselves.
    pub fn parse(token: &str) -> Option<Compression> {
        match token.trim() {
            "gzip" => Some(Compression::Gzip),
            "br" => Some(Compression::Brotli),
            _ => None,
        }
    }

    /// Maps a configured compression type onto an algorithm.
    pub fn from_type(compression_type: CompressionType) -> Option<Compression> {
        match compression_type {
            CompressionType::Gzip => Some(Compression::Gzip),
            CompressionType::Brotli => Some(Compression::Brotli),
            CompressionType::Identity => None,
        }
    }

    /// Picks the first locally supported algorithm that the peer accepts.
    /// `accept` is a comma-separated header value ("gzip, br;q=0.8");
    /// `supported` is the local preference order. `None` means identity.
    pub fn negotiate(accept: Option<&str>, supported: &[CompressionType]) -> Option<Compression> {
        let accept = accept?;
        let offered: Vec<&str> = accept
            .split(',')
            .map(|token| token.split(';').next().unwrap_or("").trim())
            .collect();

        supported
            .iter()
            .filter_map(|t| Compression::from_type(*t))
            .find(|c| offered.contains(&c.as_str()))
    }

    pub fn compress(&self, data: &[u8]) -> Result<Bytes, CodecError> {
        match self {
            Compression::Gzip => {
                let mut encoder =
                    GzEncoder::new(Vec::with_capacity(data.len() / 2), flate2::Compression::default());
                encoder
                    .write_all(data)
                    .map_err(|e| CodecError::Compress(e.to_string()))?;
                let out = encoder
                    .finish()
                    .map_err(|e| CodecError::Compress(e.to_string()))?;
                Ok(Bytes::from(out))
            }
            Compression::Brotli => {
                let mut out = Vec::with_capacity(data.len() / 2);
                {
                    let mut writer = brotli::CompressorWriter::new(&mut out, 4096, 5, 22);
                    writer
                        .write_all(data)
                        .map_err(|e| CodecError::Compress(e.to_string()))?;
                    writer
                        .flush()
                        .map_err(|e| CodecError::Compress(e.to_string()))?;
                }
                Ok(Bytes::from(out))
            }
        }
    }

    /// Inflates `data`, refusing to materialize more than `limit` bytes.
    pub fn decompress(&self, data: &[u8], limit: usize) -> Result<Bytes, CodecError> {
        let mut out = Vec::new();
        let budget = limit as u64 + 1;
        match self {
            Compression::Gzip => {
                let mut reader = GzDecoder::new(data).take(budget);
                reader
                    .read_to_end(&mut out)
                    .map_err(|e| CodecError::Decompress(e.to_string()))?;
            }
            Compression::Brotli => {
                let mut reader = brotli::Decompressor::new(data, 4096).take(budget);
                reader
                    .read_to_end(&mut out)
                    .map_err(|e| CodecError::Decompress(e.to_string()))?;
            }
        }

        if out.len() > limit {
            return Err(CodecError::ReadLimitExceeded {
                size: out.len(),
                limit,
            });
        }
        Ok(Bytes::from(out))
    }
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_gzip_roundtrip() {
        let payload = b"hello hello hello hello hello".repeat(64);
        let compressed = Compression::Gzip.compress(&payload).unwrap();
        assert!(compressed.len() < payload.len());
        let inflated = Compression::Gzip.decompress(&compressed, 1 << 20).unwrap();
        assert_eq!(&inflated[..], &payload[..]);
    }

    #[test]
    fn test_brotli_roundtrip() {
        let payload = b"the quick brown fox jumps over the lazy dog ".repeat(64);
        let compressed = Compression::Brotli.compress(&payload).unwrap();
        assert!(compressed.len() < payload.len());
        let inflated = Compression::Brotli.decompress(&compressed, 1 << 20).unwrap();
        assert_eq!(&inflated[..], &payload[..]);
    }

    #[test]
    fn test_decompress_enforces_limit() {
        let payload = vec![0u8; 4096];
        let compressed = Compression::Gzip.compress(&payload).unwrap();
        let err = Compression::Gzip.decompress(&compressed, 1024).unwrap_err();
        assert!(matches!(err, CodecError::ReadLimitExceeded { limit: 1024, .. }));
    }

    #[test]
    fn test_decompress_malformed_input() {
        let err = Compression::Gzip.decompress(b"not gzip at all", 1024).unwrap_err();
        assert!(matches!(err, CodecError::Decompress(_)));
    }

    #[test]
    fn test_negotiate_prefers_local_order() {
        let supported = [CompressionType::Brotli, CompressionType::Gzip];
        let picked = Compression::negotiate(Some("gzip, br"), &supported);
        assert_eq!(picked, Some(Compression::Brotli));
    }

    #[test]
    fn test_negotiate_no_overlap_is_identity() {
        let supported = [CompressionType::Gzip];
        assert_eq!(Compression::negotiate(Some("zstd, snappy"), &supported), None);
        assert_eq!(Compression::negotiate(None, &supported), None);
    }

    #[test]
    fn test_negotiate_ignores_quality_values() {
        let supported = [CompressionType::Gzip];
        let picked = Compression::negotiate(Some("br;q=1.0, gzip;q=0.5"), &supported);
        assert_eq!(picked, Some(Compression::Gzip));
    }
}
