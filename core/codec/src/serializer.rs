// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use trirpc_config::limits::LimitsConfig;

use crate::errors::CodecError;

/// Wire format of a single message payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// Schema-based binary (protobuf).
    Binary,
    /// JSON. `strict` rejects unknown fields instead of ignoring them.
    Json { strict: bool },
}

impl WireFormat {
    pub fn is_binary(&self) -> bool {
        matches!(self, WireFormat::Binary)
    }
}

/// Converts domain messages to and from their wire encoding, enforcing the
/// configured byte ceilings before anything is surfaced.
#[derive(Debug, Clone, Copy)]
pub struct Serializer {
    format: WireFormat,
    read_max_bytes: usize,
    write_max_bytes: usize,
}

impl Serializer {
    pub fn new(format: WireFormat, limits: &LimitsConfig) -> Self {
        Self {
            format,
            read_max_bytes: limits.read_max_bytes,
            write_max_bytes: limits.write_max_bytes,
        }
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    pub fn read_max_bytes(&self) -> usize {
        self.read_max_bytes
    }

    pub fn serialize<T>(&self, message: &T) -> Result<Bytes, CodecError>
    where
        T: prost::Message + Serialize,
    {
        match self.format {
            WireFormat::Binary => {
                // encoded_len is exact for protobuf, so the ceiling is
                // checked before a single byte is produced.
                let size = message.encoded_len();
                if size > self.write_max_bytes {
                    return Err(CodecError::WriteLimitExceeded {
                        size,
                        limit: self.write_max_bytes,
                    });
                }
                Ok(Bytes::from(message.encode_to_vec()))
            }
            WireFormat::Json { .. } => {
                let encoded =
                    serde_json::to_vec(message).map_err(|e| CodecError::Encode(e.to_string()))?;
                if encoded.len() > self.write_max_bytes {
                    return Err(CodecError::WriteLimitExceeded {
                        size: encoded.len(),
                        limit: self.write_max_bytes,
                    });
                }
                Ok(Bytes::from(encoded))
            }
        }
    }

    pub fn parse<T>(&self, data: &[u8]) -> Result<T, CodecError>
    where
        T: prost::Message + DeserializeOwned + Default,
    {
        if data.len() > self.read_max_bytes {
            return Err(CodecError::ReadLimitExceeded {
                size: data.len(),
                limit: self.read_max_bytes,
            });
        }

        match self.format {
            WireFormat::Binary => T::decode(data).map_err(|e| CodecError::Decode {
                type_name: std::any::type_name::<T>(),
                reason: e.to_string(),
            }),
            WireFormat::Json { strict: false } => {
                serde_json::from_slice(data).map_err(|e| CodecError::Decode {
                    type_name: std::any::type_name::<T>(),
                    reason: e.to_string(),
                })
            }
            WireFormat::Json { strict: true } => {
                let mut deserializer = serde_json::Deserializer::from_slice(data);
                let mut unknown: Option<String> = None;
                let message = serde_ignored::deserialize(&mut deserializer, |path| {
                    unknown.get_or_insert_with(|| path.to_string());
                })
                .map_err(|e: serde_json::Error| CodecError::Decode {
                    type_name: std::any::type_name::<T>(),
                    reason: e.to_string(),
                })?;

                if let Some(field) = unknown {
                    return Err(CodecError::Decode {
                        type_name: std::any::type_name::<T>(),
                        reason: format!("unknown field \"{}\"", field),
                    });
                }
                Ok(message)
            }
        }
    }
}
