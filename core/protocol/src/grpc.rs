// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! The gRPC adapter. Status is conveyed through trailers (or, for
//! trailers-only responses, through the response headers); HTTP status is
//! consulted only when no explicit grpc-status is present.

use std::time::Duration;

use http::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode};
use prost::Message;

use trirpc_codec::{Compression, WireFormat};
use trirpc_config::server::ServerConfig;

use crate::headers::*;
use crate::method::{Negotiated, ProtocolKind, RequestError, UniversalRequest};
use crate::status::{Code, Status, StatusDetail, StatusProto};
use crate::timeout;

/// Maps a gRPC content type to a wire format.
pub fn parse_content_type(content_type: &str) -> Option<WireFormat> {
    match content_type {
        CONTENT_TYPE_GRPC | CONTENT_TYPE_GRPC_PROTO => Some(WireFormat::Binary),
        CONTENT_TYPE_GRPC_JSON => Some(WireFormat::Json { strict: false }),
        _ => None,
    }
}

pub fn content_type_for(format: WireFormat) -> &'static str {
    match format {
        WireFormat::Binary => CONTENT_TYPE_GRPC_PROTO,
        WireFormat::Json { .. } => CONTENT_TYPE_GRPC_JSON,
    }
}

/// Server-side request validation and negotiation.
pub fn negotiate_request(
    config: &ServerConfig,
    request: &UniversalRequest,
) -> Result<Negotiated, RequestError> {
    if request.method != Method::POST {
        return Err(RequestError::method_not_allowed(&request.method));
    }

    let content_type = header_str(&request.headers, CONTENT_TYPE.as_str()).unwrap_or("");
    let Some(format) = parse_content_type(content_type) else {
        return Err(RequestError::unsupported_media_type(content_type));
    };

    let timeout = match header_str(&request.headers, HEADER_GRPC_TIMEOUT) {
        Some(value) => {
            let parsed = timeout::parse_grpc_timeout(value)?;
            timeout::enforce_max_timeout(parsed, config.max_timeout.into())?;
            Some(parsed)
        }
        None => None,
    };

    let request_compression =
        match header_str(&request.headers, HEADER_GRPC_ENCODING).unwrap_or("identity") {
            "identity" => None,
            token => match Compression::parse(token) {
                Some(algorithm) => Some(algorithm),
                // Per gRPC convention an unsupported message encoding is
                // answered with Unimplemented, not InvalidArgument.
                None => {
                    return Err(Status::new(
                        Code::Unimplemented,
                        format!("unsupported encoding \"{}\"", token),
                    )
                    .into());
                }
            },
        };

    let response_compression = Compression::negotiate(
        header_str(&request.headers, HEADER_GRPC_ACCEPT_ENCODING),
        &config.compression.accept,
    );

    Ok(Negotiated {
        protocol: ProtocolKind::Grpc,
        format,
        request_compression,
        response_compression,
        timeout,
        get_message: None,
    })
}

/// Headers sent ahead of the first response message.
pub fn response_headers(negotiated: &Negotiated, accept: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(match negotiated.protocol {
            ProtocolKind::GrpcWeb => grpcweb_content_type_for(negotiated.format),
            _ => content_type_for(negotiated.format),
        }),
    );
    if let Some(algorithm) = negotiated.response_compression {
        headers.insert(
            HeaderName::from_static(HEADER_GRPC_ENCODING),
            HeaderValue::from_static(algorithm.as_str()),
        );
    }
    if let Ok(value) = HeaderValue::from_str(accept) {
        headers.insert(HeaderName::from_static(HEADER_GRPC_ACCEPT_ENCODING), value);
    }
    headers
}

fn grpcweb_content_type_for(format: WireFormat) -> &'static str {
    match format {
        WireFormat::Binary => CONTENT_TYPE_GRPC_WEB_PROTO,
        WireFormat::Json { .. } => CONTENT_TYPE_GRPC_WEB_JSON,
    }
}

/// Builds the terminal trailer block for a call outcome, merging in any
/// application-set trailer metadata.
pub fn trailers_for(result: &Result<(), Status>, extra: &HeaderMap) -> HeaderMap {
    let mut trailers = extra.clone();
    match result {
        Ok(()) => {
            trailers.insert(
                HeaderName::from_static(HEADER_GRPC_STATUS),
                HeaderValue::from_static("0"),
            );
        }
        Err(status) => {
            for (name, value) in status.metadata.iter() {
                trailers.insert(name.clone(), value.clone());
            }
            trailers.insert(
                HeaderName::from_static(HEADER_GRPC_STATUS),
                HeaderValue::from_str(&(status.code as i32).to_string())
                    .unwrap_or(HeaderValue::from_static("2")),
            );
            if !status.message.is_empty()
                && let Ok(value) =
                    HeaderValue::from_str(&percent_encode_message(&status.message))
            {
                trailers.insert(HeaderName::from_static(HEADER_GRPC_MESSAGE), value);
            }
            if !status.details.is_empty() {
                let encoded = encode_bin_value(&status.to_proto().encode_to_vec());
                if let Ok(value) = HeaderValue::from_str(&encoded) {
                    trailers.insert(
                        HeaderName::from_static(HEADER_GRPC_STATUS_DETAILS_BIN),
                        value,
                    );
                }
            }
        }
    }
    trailers
}

/// Client-side request headers.
pub struct RequestParams<'a> {
    pub format: WireFormat,
    pub compression: Option<Compression>,
    pub accept_compression: &'a str,
    pub timeout: Option<Duration>,
    pub service_version: Option<&'a str>,
    pub service_group: Option<&'a str>,
}

pub fn request_headers(params: &RequestParams<'_>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(content_type_for(params.format)),
    );
    headers.insert(
        HeaderName::from_static("te"),
        HeaderValue::from_static("trailers"),
    );
    if let Some(algorithm) = params.compression {
        headers.insert(
            HeaderName::from_static(HEADER_GRPC_ENCODING),
            HeaderValue::from_static(algorithm.as_str()),
        );
    }
    if let Ok(value) = HeaderValue::from_str(params.accept_compression) {
        headers.insert(HeaderName::from_static(HEADER_GRPC_ACCEPT_ENCODING), value);
    }
    if let Some(timeout) = params.timeout
        && let Ok(value) = HeaderValue::from_str(&timeout::format_grpc_timeout(timeout))
    {
        headers.insert(HeaderName::from_static(HEADER_GRPC_TIMEOUT), value);
    }
    insert_routing_headers(&mut headers, params.service_version, params.service_group);
    headers
}

pub(crate) fn insert_routing_headers(
    headers: &mut HeaderMap,
    service_version: Option<&str>,
    service_group: Option<&str>,
) {
    if let Some(version) = service_version
        && let Ok(value) = HeaderValue::from_str(version)
    {
        headers.insert(HeaderName::from_static(HEADER_TRI_SERVICE_VERSION), value);
    }
    if let Some(group) = service_group
        && let Ok(value) = HeaderValue::from_str(group)
    {
        headers.insert(HeaderName::from_static(HEADER_TRI_SERVICE_GROUP), value);
    }
}

/// Extracts an explicit grpc-status from a header block, if present.
pub fn find_status(headers: &HeaderMap) -> Option<Result<(), Status>> {
    let raw = header_str(headers, HEADER_GRPC_STATUS)?;
    let Ok(code_value) = raw.parse::<i32>() else {
        return Some(Err(Status::internal(format!(
            "protocol error: invalid grpc-status value \"{}\"",
            raw
        ))));
    };
    let Some(code) = Code::from_i32(code_value) else {
        return Some(Err(Status::internal(format!(
            "protocol error: unknown grpc-status value {}",
            code_value
        ))));
    };
    if code == Code::Ok {
        return Some(Ok(()));
    }

    let message = header_str(headers, HEADER_GRPC_MESSAGE)
        .map(percent_decode_message)
        .unwrap_or_default();
    let details = header_str(headers, HEADER_GRPC_STATUS_DETAILS_BIN)
        .and_then(decode_bin_value)
        .and_then(|raw| StatusProto::decode(raw.as_slice()).ok())
        .map(|proto| {
            proto
                .details
                .into_iter()
                .map(|d| StatusDetail::new(d.type_url, d.value))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let mut metadata = headers.clone();
    for protocol_header in [
        HEADER_GRPC_STATUS,
        HEADER_GRPC_MESSAGE,
        HEADER_GRPC_STATUS_DETAILS_BIN,
    ] {
        metadata.remove(protocol_header);
    }

    Some(Err(Status::new(code, message)
        .with_details(details)
        .with_metadata(metadata)))
}

/// Resolves the outcome of a gRPC response. An explicit grpc-status (in
/// trailers, or in the headers of a trailers-only response) always wins;
/// the HTTP status code is only consulted when neither carries one.
pub fn resolve_response(
    http_status: StatusCode,
    headers: &HeaderMap,
    trailers: Option<&HeaderMap>,
) -> Result<(), Status> {
    if let Some(trailers) = trailers
        && let Some(outcome) = find_status(trailers)
    {
        return outcome;
    }
    if let Some(outcome) = find_status(headers) {
        return outcome;
    }
    if http_status != StatusCode::OK {
        return Err(Status::new(
            Code::from_http_status(http_status.as_u16()),
            format!("HTTP {}", http_status.as_u16()),
        ));
    }
    Err(Status::internal(
        "protocol error: missing grpc-status in response",
    ))
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

#[cfg(test)]
mod test {
    use super::*;
    use futures::stream;

    fn request_with(headers: Vec<(&'static str, &str)>) -> UniversalRequest {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.insert(
                HeaderName::from_static(name),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        UniversalRequest {
            method: Method::POST,
            path: "/greet.GreetService/SayHello".to_string(),
            query: None,
            headers: map,
            body: Box::pin(stream::empty()),
        }
    }

    #[test]
    fn test_negotiate_happy_path() {
        let config = ServerConfig::with_endpoint("127.0.0.1:0");
        let request = request_with(vec![
            ("content-type", "application/grpc+proto"),
            ("grpc-timeout", "5S"),
            ("grpc-encoding", "gzip"),
            ("grpc-accept-encoding", "gzip, br"),
        ]);

        let negotiated = negotiate_request(&config, &request).unwrap();
        assert_eq!(negotiated.format, WireFormat::Binary);
        assert_eq!(negotiated.timeout, Some(Duration::from_secs(5)));
        assert_eq!(negotiated.request_compression, Some(Compression::Gzip));
        assert_eq!(negotiated.response_compression, Some(Compression::Gzip));
    }

    #[test]
    fn test_negotiate_rejects_get() {
        let config = ServerConfig::with_endpoint("127.0.0.1:0");
        let mut request = request_with(vec![("content-type", "application/grpc")]);
        request.method = Method::GET;
        match negotiate_request(&config, &request) {
            Err(RequestError::Http { status, .. }) => {
                assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED)
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_negotiate_rejects_wrong_content_type() {
        let config = ServerConfig::with_endpoint("127.0.0.1:0");
        let request = request_with(vec![("content-type", "text/html")]);
        match negotiate_request(&config, &request) {
            Err(RequestError::Http { status, .. }) => {
                assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE)
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_negotiate_unknown_encoding_is_unimplemented() {
        let config = ServerConfig::with_endpoint("127.0.0.1:0");
        let request = request_with(vec![
            ("content-type", "application/grpc"),
            ("grpc-encoding", "zstd"),
        ]);
        match negotiate_request(&config, &request) {
            Err(RequestError::Status(status)) => {
                assert_eq!(status.code, Code::Unimplemented);
                assert!(status.message.contains("unsupported encoding"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_negotiate_timeout_over_max_rejected() {
        let config =
            ServerConfig::with_endpoint("127.0.0.1:0").with_max_timeout(Duration::from_secs(1));
        let request = request_with(vec![
            ("content-type", "application/grpc"),
            ("grpc-timeout", "10S"),
        ]);
        match negotiate_request(&config, &request) {
            Err(RequestError::Status(status)) => assert_eq!(status.code, Code::InvalidArgument),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_trailers_roundtrip_error() {
        let status = Status::new(Code::NotFound, "no such row: id=42")
            .with_details(vec![StatusDetail::new("type.example/RowError", &b"\x01"[..])]);
        let trailers = trailers_for(&Err(status.clone()), &HeaderMap::new());

        let parsed = find_status(&trailers).unwrap().unwrap_err();
        assert_eq!(parsed.code, Code::NotFound);
        assert_eq!(parsed.message, "no such row: id=42");
        assert_eq!(parsed.details, status.details);
    }

    #[test]
    fn test_trailers_ok() {
        let trailers = trailers_for(&Ok(()), &HeaderMap::new());
        assert_eq!(trailers.get(HEADER_GRPC_STATUS).unwrap(), "0");
        assert!(find_status(&trailers).unwrap().is_ok());
    }

    #[test]
    fn test_resolve_prefers_trailer_status_over_http() {
        let mut trailers = HeaderMap::new();
        trailers.insert(
            HeaderName::from_static(HEADER_GRPC_STATUS),
            HeaderValue::from_static("5"),
        );
        // HTTP says 503 but the in-band status says NotFound: in-band wins.
        let err = resolve_response(
            StatusCode::SERVICE_UNAVAILABLE,
            &HeaderMap::new(),
            Some(&trailers),
        )
        .unwrap_err();
        assert_eq!(err.code, Code::NotFound);
    }

    #[test]
    fn test_resolve_trailers_only_response() {
        let mut headers = HeaderMap::new();
        headers.insert(
            HeaderName::from_static(HEADER_GRPC_STATUS),
            HeaderValue::from_static("12"),
        );
        let err = resolve_response(StatusCode::OK, &headers, None).unwrap_err();
        assert_eq!(err.code, Code::Unimplemented);
    }

    #[test]
    fn test_resolve_falls_back_to_http_status() {
        let err =
            resolve_response(StatusCode::TOO_MANY_REQUESTS, &HeaderMap::new(), None).unwrap_err();
        assert_eq!(err.code, Code::Unavailable);
        assert!(err.message.contains("429"));
    }

    #[test]
    fn test_resolve_missing_status_is_protocol_error() {
        let err = resolve_response(StatusCode::OK, &HeaderMap::new(), None).unwrap_err();
        assert_eq!(err.code, Code::Internal);
        assert!(err.message.contains("missing grpc-status"));
    }
}
