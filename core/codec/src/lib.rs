// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

pub mod compression;
pub mod envelope;
pub mod errors;
pub mod serializer;

pub use compression::Compression;
pub use envelope::{ENVELOPE_HEADER_SIZE, EnvelopeReader, EnvelopedMessage, flags};
pub use errors::CodecError;
pub use serializer::{Serializer, WireFormat};
