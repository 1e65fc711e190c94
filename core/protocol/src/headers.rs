// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Header names, content types and value codecs shared by the adapters.

use base64::Engine;
use base64::prelude::{BASE64_STANDARD, BASE64_STANDARD_NO_PAD};
use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};

// gRPC / gRPC-web
pub const HEADER_GRPC_STATUS: &str = "grpc-status";
pub const HEADER_GRPC_MESSAGE: &str = "grpc-message";
pub const HEADER_GRPC_TIMEOUT: &str = "grpc-timeout";
pub const HEADER_GRPC_ENCODING: &str = "grpc-encoding";
pub const HEADER_GRPC_ACCEPT_ENCODING: &str = "grpc-accept-encoding";
pub const HEADER_GRPC_STATUS_DETAILS_BIN: &str = "grpc-status-details-bin";
pub const HEADER_X_GRPC_WEB: &str = "x-grpc-web";

// Connect
pub const HEADER_CONNECT_PROTOCOL_VERSION: &str = "connect-protocol-version";
pub const CONNECT_PROTOCOL_VERSION: &str = "1";
pub const HEADER_CONNECT_TIMEOUT: &str = "connect-timeout-ms";
pub const HEADER_CONNECT_CONTENT_ENCODING: &str = "connect-content-encoding";
pub const HEADER_CONNECT_ACCEPT_ENCODING: &str = "connect-accept-encoding";

// Triple (Dubbo)
pub const HEADER_TRI_PROTOCOL_VERSION: &str = "tri-protocol-version";
pub const TRI_PROTOCOL_VERSION: &str = "1.0.0";
pub const HEADER_TRI_SERVICE_VERSION: &str = "tri-service-version";
pub const HEADER_TRI_SERVICE_GROUP: &str = "tri-service-group";
pub const HEADER_TRI_TIMEOUT: &str = "tri-timeout-ms";

// Content types
pub const CONTENT_TYPE_GRPC: &str = "application/grpc";
pub const CONTENT_TYPE_GRPC_PROTO: &str = "application/grpc+proto";
pub const CONTENT_TYPE_GRPC_JSON: &str = "application/grpc+json";
pub const CONTENT_TYPE_GRPC_WEB: &str = "application/grpc-web";
pub const CONTENT_TYPE_GRPC_WEB_PROTO: &str = "application/grpc-web+proto";
pub const CONTENT_TYPE_GRPC_WEB_JSON: &str = "application/grpc-web+json";
pub const CONTENT_TYPE_CONNECT_UNARY_PROTO: &str = "application/proto";
pub const CONTENT_TYPE_CONNECT_UNARY_JSON: &str = "application/json";
pub const CONTENT_TYPE_CONNECT_STREAM_PROTO: &str = "application/connect+proto";
pub const CONTENT_TYPE_CONNECT_STREAM_JSON: &str = "application/connect+json";
pub const CONTENT_TYPE_TRIPLE_PROTO: &str = "application/triple+proto";
pub const CONTENT_TYPE_TRIPLE_JSON: &str = "application/triple+json";

/// Per the gRPC spec, grpc-message percent-encodes everything outside the
/// printable ASCII range, plus '%' itself.
const GRPC_MESSAGE_SET: &AsciiSet = &CONTROLS.add(b'%').add(b'\x7f');

pub fn percent_encode_message(message: &str) -> String {
    utf8_percent_encode(message, GRPC_MESSAGE_SET).to_string()
}

pub fn percent_decode_message(value: &str) -> String {
    percent_decode_str(value).decode_utf8_lossy().into_owned()
}

/// Encodes a `-bin` metadata value: standard base64 without padding.
pub fn encode_bin_value(value: &[u8]) -> String {
    BASE64_STANDARD_NO_PAD.encode(value)
}

/// Decodes a `-bin` metadata value, accepting padded and unpadded input.
pub fn decode_bin_value(value: &str) -> Option<Vec<u8>> {
    BASE64_STANDARD_NO_PAD
        .decode(value)
        .or_else(|_| BASE64_STANDARD.decode(value))
        .ok()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_percent_encoding_roundtrip() {
        let message = "deadline exceeded after 5s\nretry: no";
        let encoded = percent_encode_message(message);
        assert!(!encoded.contains('\n'));
        assert_eq!(percent_decode_message(&encoded), message);
    }

    #[test]
    fn test_percent_encoding_leaves_plain_text() {
        assert_eq!(percent_encode_message("exception"), "exception");
    }

    #[test]
    fn test_bin_value_accepts_both_paddings() {
        let raw = b"\x01\x02\x03\xff";
        let unpadded = encode_bin_value(raw);
        assert!(!unpadded.ends_with('='));
        assert_eq!(decode_bin_value(&unpadded).unwrap(), raw);

        let padded = BASE64_STANDARD.encode(raw);
        assert_eq!(decode_bin_value(&padded).unwrap(), raw);
    }

    #[test]
    fn test_bin_value_rejects_garbage() {
        assert!(decode_bin_value("!!not base64!!").is_none());
    }
}
