// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

/// Errors raised by the envelope codec and the serialization layer. They are
/// wrapped into the canonical status shape at the protocol boundary; nothing
/// below that boundary surfaces raw I/O or serde errors.
#[derive(Error, Debug)]
pub enum CodecError {
    // Byte ceilings
    #[error("message of {size} bytes exceeds read limit of {limit} bytes")]
    ReadLimitExceeded { size: usize, limit: usize },
    #[error("message of {size} bytes exceeds write limit of {limit} bytes")]
    WriteLimitExceeded { size: usize, limit: usize },

    // Envelope framing
    #[error("malformed envelope: {0}")]
    MalformedFrame(String),
    #[error("unknown compression: frame is compressed but no algorithm was negotiated")]
    UnknownCompression,

    // Serialization
    #[error("failed to decode {type_name}: {reason}")]
    Decode { type_name: &'static str, reason: String },
    #[error("failed to encode message: {0}")]
    Encode(String),

    // Compression codecs
    #[error("decompression failed: {0}")]
    Decompress(String),
    #[error("compression failed: {0}")]
    Compress(String),
}
