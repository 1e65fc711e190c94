// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! The gRPC-web adapter. Same status model as gRPC, but the trailer block
//! travels as a final envelope with the trailer flag (0x80) set, encoded as
//! an HTTP/1-style header block, so that browsers (which cannot read HTTP
//! trailers) can reach it.

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use http::Method;

use trirpc_codec::envelope::{EnvelopedMessage, flags};
use trirpc_codec::{Compression, WireFormat};
use trirpc_config::server::ServerConfig;

use crate::grpc;
use crate::headers::*;
use crate::method::{Negotiated, ProtocolKind, RequestError, UniversalRequest};
use crate::status::Status;
use crate::timeout;

/// Maps a gRPC-web content type to a wire format.
pub fn parse_content_type(content_type: &str) -> Option<WireFormat> {
    match content_type {
        CONTENT_TYPE_GRPC_WEB | CONTENT_TYPE_GRPC_WEB_PROTO => Some(WireFormat::Binary),
        CONTENT_TYPE_GRPC_WEB_JSON => Some(WireFormat::Json { strict: false }),
        _ => None,
    }
}

pub fn content_type_for(format: WireFormat) -> &'static str {
    match format {
        WireFormat::Binary => CONTENT_TYPE_GRPC_WEB_PROTO,
        WireFormat::Json { .. } => CONTENT_TYPE_GRPC_WEB_JSON,
    }
}

/// Server-side request validation and negotiation. Identical to gRPC except
/// for the content type family.
pub fn negotiate_request(
    config: &ServerConfig,
    request: &UniversalRequest,
) -> Result<Negotiated, RequestError> {
    if request.method != Method::POST {
        return Err(RequestError::method_not_allowed(&request.method));
    }

    let content_type = grpc::header_str(&request.headers, CONTENT_TYPE.as_str()).unwrap_or("");
    let Some(format) = parse_content_type(content_type) else {
        return Err(RequestError::unsupported_media_type(content_type));
    };

    let timeout = match grpc::header_str(&request.headers, HEADER_GRPC_TIMEOUT) {
        Some(value) => {
            let parsed = timeout::parse_grpc_timeout(value)?;
            timeout::enforce_max_timeout(parsed, config.max_timeout.into())?;
            Some(parsed)
        }
        None => None,
    };

    let request_compression =
        match grpc::header_str(&request.headers, HEADER_GRPC_ENCODING).unwrap_or("identity") {
            "identity" => None,
            token => match Compression::parse(token) {
                Some(algorithm) => Some(algorithm),
                None => {
                    return Err(Status::unimplemented(format!(
                        "unsupported encoding \"{}\"",
                        token
                    ))
                    .into());
                }
            },
        };

    let response_compression = Compression::negotiate(
        grpc::header_str(&request.headers, HEADER_GRPC_ACCEPT_ENCODING),
        &config.compression.accept,
    );

    Ok(Negotiated {
        protocol: ProtocolKind::GrpcWeb,
        format,
        request_compression,
        response_compression,
        timeout,
        get_message: None,
    })
}

/// Client-side request headers: the gRPC set plus `x-grpc-web: 1`.
pub fn request_headers(params: &grpc::RequestParams<'_>) -> HeaderMap {
    let mut headers = grpc::request_headers(params);
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type_for(params.format)),
    );
    headers.insert(
        HeaderName::from_static(HEADER_X_GRPC_WEB),
        HeaderValue::from_static("1"),
    );
    headers
}

/// Serializes a trailer block into the body of a trailer envelope:
/// `name: value\r\n` pairs, lowercase names, binary values base64-encoded
/// upstream of this call.
pub fn encode_trailer_frame(trailers: &HeaderMap) -> EnvelopedMessage {
    let mut body = Vec::new();
    for (name, value) in trailers.iter() {
        body.extend_from_slice(name.as_str().as_bytes());
        body.extend_from_slice(b": ");
        body.extend_from_slice(value.as_bytes());
        body.extend_from_slice(b"\r\n");
    }
    EnvelopedMessage::new(flags::TRAILER, Bytes::from(body))
}

/// Parses the body of a trailer envelope back into a header block.
pub fn parse_trailer_frame(data: &[u8]) -> Result<HeaderMap, Status> {
    let text = std::str::from_utf8(data)
        .map_err(|_| Status::internal("protocol error: trailer frame is not valid UTF-8"))?;

    let mut trailers = HeaderMap::new();
    for line in text.split("\r\n").filter(|line| !line.is_empty()) {
        let Some((name, value)) = line.split_once(':') else {
            return Err(Status::internal(format!(
                "protocol error: malformed trailer line \"{}\"",
                line
            )));
        };
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim();
        let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::from_str(value),
        ) else {
            return Err(Status::internal(format!(
                "protocol error: invalid trailer \"{}\"",
                line
            )));
        };
        trailers.append(name, value);
    }
    Ok(trailers)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::status::Code;
    use futures::stream;

    #[test]
    fn test_trailer_frame_roundtrip() {
        let status = Status::new(Code::Internal, "exception");
        let trailers = grpc::trailers_for(&Err(status), &HeaderMap::new());

        let frame = encode_trailer_frame(&trailers);
        assert!(frame.is_set(flags::TRAILER));

        let parsed = parse_trailer_frame(&frame.data).unwrap();
        let outcome = grpc::find_status(&parsed).unwrap().unwrap_err();
        assert_eq!(outcome.code, Code::Internal);
        assert_eq!(outcome.message, "exception");
    }

    #[test]
    fn test_trailer_frame_ok_roundtrip() {
        let trailers = grpc::trailers_for(&Ok(()), &HeaderMap::new());
        let frame = encode_trailer_frame(&trailers);
        let parsed = parse_trailer_frame(&frame.data).unwrap();
        assert!(grpc::find_status(&parsed).unwrap().is_ok());
    }

    #[test]
    fn test_parse_trailer_frame_rejects_garbage() {
        let err = parse_trailer_frame(b"no-colon-here\r\n").unwrap_err();
        assert_eq!(err.code, Code::Internal);
    }

    #[test]
    fn test_negotiate_content_types() {
        let config = ServerConfig::with_endpoint("127.0.0.1:0");
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/grpc-web+proto"),
        );
        let request = UniversalRequest {
            method: Method::POST,
            path: "/svc/Method".into(),
            query: None,
            headers,
            body: Box::pin(stream::empty()),
        };
        let negotiated = negotiate_request(&config, &request).unwrap();
        assert_eq!(negotiated.protocol, ProtocolKind::GrpcWeb);
        assert_eq!(negotiated.format, WireFormat::Binary);
    }

    #[test]
    fn test_request_headers_carry_web_marker() {
        let params = grpc::RequestParams {
            format: WireFormat::Binary,
            compression: None,
            accept_compression: "gzip, br",
            timeout: None,
            service_version: None,
            service_group: None,
        };
        let headers = request_headers(&params);
        assert_eq!(headers.get(HEADER_X_GRPC_WEB).unwrap(), "1");
        assert_eq!(
            headers.get(CONTENT_TYPE).unwrap(),
            CONTENT_TYPE_GRPC_WEB_PROTO
        );
    }
}
