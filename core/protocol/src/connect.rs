// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! The Connect adapter, covering both plain Connect and the Dubbo Triple
//! dialect (same framing, `tri-*` header names and a different protocol
//! version token). Unary failures ride a JSON error body on a mapped HTTP
//! status; streaming failures ride the end-stream envelope.

use std::collections::HashMap;
use std::time::Duration;

use base64::Engine;
use base64::prelude::{BASE64_URL_SAFE, BASE64_URL_SAFE_NO_PAD};
use bytes::Bytes;
use http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode};
use serde::{Deserialize, Serialize};

use trirpc_codec::envelope::{EnvelopedMessage, flags};
use trirpc_codec::{Compression, WireFormat};
use trirpc_config::server::ServerConfig;

use crate::grpc::{header_str, insert_routing_headers};
use crate::headers::*;
use crate::method::{
    Idempotency, MethodKind, MethodSpec, Negotiated, ProtocolKind, RequestError, UniversalRequest,
};
use crate::status::{Code, Status, StatusDetail};
use crate::timeout;

/// The two dialects served by this adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Connect,
    Triple,
}

impl Variant {
    pub fn protocol(&self) -> ProtocolKind {
        match self {
            Variant::Connect => ProtocolKind::Connect,
            Variant::Triple => ProtocolKind::Triple,
        }
    }

    pub fn version_header(&self) -> &'static str {
        match self {
            Variant::Connect => HEADER_CONNECT_PROTOCOL_VERSION,
            Variant::Triple => HEADER_TRI_PROTOCOL_VERSION,
        }
    }

    pub fn expected_version(&self) -> &'static str {
        match self {
            Variant::Connect => CONNECT_PROTOCOL_VERSION,
            Variant::Triple => TRI_PROTOCOL_VERSION,
        }
    }

    pub fn timeout_header(&self) -> &'static str {
        match self {
            Variant::Connect => HEADER_CONNECT_TIMEOUT,
            Variant::Triple => HEADER_TRI_TIMEOUT,
        }
    }

    pub fn unary_content_type(&self, format: WireFormat) -> &'static str {
        match (self, format) {
            (Variant::Triple, WireFormat::Binary) => CONTENT_TYPE_TRIPLE_PROTO,
            (Variant::Triple, WireFormat::Json { .. }) => CONTENT_TYPE_TRIPLE_JSON,
            (Variant::Connect, WireFormat::Binary) => CONTENT_TYPE_CONNECT_UNARY_PROTO,
            (Variant::Connect, WireFormat::Json { .. }) => CONTENT_TYPE_CONNECT_UNARY_JSON,
        }
    }

    pub fn stream_content_type(&self, format: WireFormat) -> &'static str {
        match (self, format) {
            (Variant::Triple, WireFormat::Binary) => CONTENT_TYPE_TRIPLE_PROTO,
            (Variant::Triple, WireFormat::Json { .. }) => CONTENT_TYPE_TRIPLE_JSON,
            (Variant::Connect, WireFormat::Binary) => CONTENT_TYPE_CONNECT_STREAM_PROTO,
            (Variant::Connect, WireFormat::Json { .. }) => CONTENT_TYPE_CONNECT_STREAM_JSON,
        }
    }
}

/// Classifies a Connect/Triple content type. Returns the variant, the wire
/// format, and whether it is the streaming shape.
pub fn parse_content_type(content_type: &str) -> Option<(Variant, WireFormat, bool)> {
    match content_type {
        CONTENT_TYPE_CONNECT_UNARY_PROTO => Some((Variant::Connect, WireFormat::Binary, false)),
        CONTENT_TYPE_CONNECT_UNARY_JSON => {
            Some((Variant::Connect, WireFormat::Json { strict: false }, false))
        }
        CONTENT_TYPE_CONNECT_STREAM_PROTO => Some((Variant::Connect, WireFormat::Binary, true)),
        CONTENT_TYPE_CONNECT_STREAM_JSON => {
            Some((Variant::Connect, WireFormat::Json { strict: false }, true))
        }
        // Triple uses one content type for both shapes; the method spec
        // decides how the body is interpreted.
        CONTENT_TYPE_TRIPLE_PROTO => Some((Variant::Triple, WireFormat::Binary, false)),
        CONTENT_TYPE_TRIPLE_JSON => Some((Variant::Triple, WireFormat::Json { strict: false }, false)),
        _ => None,
    }
}

/// Server-side request validation and negotiation.
pub fn negotiate_request(
    config: &ServerConfig,
    spec: &MethodSpec,
    request: &UniversalRequest,
) -> Result<Negotiated, RequestError> {
    let is_get = request.method == Method::GET;
    if is_get {
        if !config.enable_get
            || spec.kind != MethodKind::Unary
            || spec.idempotency != Idempotency::NoSideEffects
        {
            return Err(RequestError::method_not_allowed(&request.method));
        }
        return negotiate_get_request(config, request);
    }
    if request.method != Method::POST {
        return Err(RequestError::method_not_allowed(&request.method));
    }

    let content_type = header_str(&request.headers, CONTENT_TYPE.as_str()).unwrap_or("");
    let Some((variant, format, stream_shape)) = parse_content_type(content_type) else {
        return Err(RequestError::unsupported_media_type(content_type));
    };
    let streaming = stream_shape || spec.kind != MethodKind::Unary;

    check_protocol_version(config, variant, &request.headers)?;

    let timeout = match header_str(&request.headers, variant.timeout_header()) {
        Some(value) => {
            let parsed = timeout::parse_connect_timeout(value)?;
            timeout::enforce_max_timeout(parsed, config.max_timeout.into())?;
            Some(parsed)
        }
        None => None,
    };

    // Unary calls use the standard HTTP encoding headers; streaming calls
    // use the connect-* pair so intermediaries do not transcode frames.
    let (encoding_header, accept_header) = if streaming {
        (HEADER_CONNECT_CONTENT_ENCODING, HEADER_CONNECT_ACCEPT_ENCODING)
    } else {
        (CONTENT_ENCODING.as_str(), ACCEPT_ENCODING.as_str())
    };

    let request_compression = match header_str(&request.headers, encoding_header)
        .unwrap_or("identity")
    {
        "identity" => None,
        token => match Compression::parse(token) {
            Some(algorithm) => Some(algorithm),
            None => {
                return Err(Status::invalid_argument(format!(
                    "unsupported encoding \"{}\": supported encodings are {}",
                    token,
                    config.compression.accept_header_value()
                ))
                .into());
            }
        },
    };

    let response_compression = Compression::negotiate(
        header_str(&request.headers, accept_header),
        &config.compression.accept,
    );

    Ok(Negotiated {
        protocol: variant.protocol(),
        format,
        request_compression,
        response_compression,
        timeout,
        get_message: None,
    })
}

fn check_protocol_version(
    config: &ServerConfig,
    variant: Variant,
    headers: &HeaderMap,
) -> Result<(), Status> {
    if !config.require_protocol_header {
        return Ok(());
    }
    match header_str(headers, variant.version_header()) {
        Some(version) if version == variant.expected_version() => Ok(()),
        Some(version) => Err(Status::invalid_argument(format!(
            "{}: expected \"{}\", got \"{}\"",
            variant.version_header(),
            variant.expected_version(),
            version
        ))),
        None => Err(Status::invalid_argument(format!(
            "missing required header {}: expected \"{}\"",
            variant.version_header(),
            variant.expected_version()
        ))),
    }
}

/// Negotiates a Connect GET request: the message rides the query string.
fn negotiate_get_request(
    config: &ServerConfig,
    request: &UniversalRequest,
) -> Result<Negotiated, RequestError> {
    let query = parse_query(request.query.as_deref().unwrap_or(""));

    if config.require_protocol_header {
        match query.get("connect").map(String::as_str) {
            Some("v1") => {}
            Some(other) => {
                return Err(Status::invalid_argument(format!(
                    "connect protocol version: expected \"v1\", got \"{}\"",
                    other
                ))
                .into());
            }
            None => {
                return Err(Status::invalid_argument(
                    "missing required query parameter connect: expected \"v1\"",
                )
                .into());
            }
        }
    }

    let format = match query.get("encoding").map(String::as_str) {
        Some("proto") => WireFormat::Binary,
        Some("json") => WireFormat::Json { strict: false },
        Some(other) => {
            return Err(
                Status::invalid_argument(format!("unknown encoding \"{}\"", other)).into(),
            );
        }
        None => return Err(Status::invalid_argument("missing query parameter encoding").into()),
    };

    let raw_message = query
        .get("message")
        .ok_or_else(|| Status::invalid_argument("missing query parameter message"))?;
    let decoded = if query.get("base64").map(String::as_str) == Some("1") {
        BASE64_URL_SAFE_NO_PAD
            .decode(raw_message.as_bytes())
            .or_else(|_| BASE64_URL_SAFE.decode(raw_message.as_bytes()))
            .map_err(|_| Status::invalid_argument("query parameter message is not valid base64"))?
    } else {
        raw_message.clone().into_bytes()
    };

    let request_compression = match query.get("compression").map(String::as_str) {
        None | Some("identity") => None,
        Some(token) => match Compression::parse(token) {
            Some(algorithm) => Some(algorithm),
            None => {
                return Err(Status::invalid_argument(format!(
                    "unsupported compression \"{}\"",
                    token
                ))
                .into());
            }
        },
    };

    let timeout = match header_str(&request.headers, HEADER_CONNECT_TIMEOUT) {
        Some(value) => {
            let parsed = timeout::parse_connect_timeout(value)?;
            timeout::enforce_max_timeout(parsed, config.max_timeout.into())?;
            Some(parsed)
        }
        None => None,
    };

    let response_compression = Compression::negotiate(
        header_str(&request.headers, ACCEPT_ENCODING.as_str()),
        &config.compression.accept,
    );

    Ok(Negotiated {
        protocol: ProtocolKind::Connect,
        format,
        request_compression,
        response_compression,
        timeout,
        get_message: Some(Bytes::from(decoded)),
    })
}

/// Content-encoding/accept-encoding header names for the given shape.
/// Streaming calls use the connect-* pair so intermediaries leave the
/// frames alone.
fn encoding_header_names(streaming: bool) -> (HeaderName, HeaderName) {
    if streaming {
        (
            HeaderName::from_static(HEADER_CONNECT_CONTENT_ENCODING),
            HeaderName::from_static(HEADER_CONNECT_ACCEPT_ENCODING),
        )
    } else {
        (CONTENT_ENCODING, ACCEPT_ENCODING)
    }
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let value = percent_encoding::percent_decode_str(value)
                .decode_utf8()
                .ok()?
                .into_owned();
            Some((name.to_string(), value))
        })
        .collect()
}

/// Client-side parameters for building request headers.
pub struct RequestParams<'a> {
    pub variant: Variant,
    pub format: WireFormat,
    pub streaming: bool,
    pub compression: Option<Compression>,
    pub accept_compression: &'a str,
    pub timeout: Option<Duration>,
    pub service_version: Option<&'a str>,
    pub service_group: Option<&'a str>,
}

pub fn request_headers(params: &RequestParams<'_>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let content_type = if params.streaming {
        params.variant.stream_content_type(params.format)
    } else {
        params.variant.unary_content_type(params.format)
    };
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(
        HeaderName::from_static(params.variant.version_header()),
        HeaderValue::from_static(params.variant.expected_version()),
    );

    let (encoding_header, accept_header) = encoding_header_names(params.streaming);
    if let Some(algorithm) = params.compression {
        headers.insert(encoding_header, HeaderValue::from_static(algorithm.as_str()));
    }
    if let Ok(value) = HeaderValue::from_str(params.accept_compression) {
        headers.insert(accept_header, value);
    }
    if let Some(timeout) = params.timeout
        && let Ok(value) = HeaderValue::from_str(&timeout::format_connect_timeout(timeout))
    {
        headers.insert(
            HeaderName::from_static(params.variant.timeout_header()),
            value,
        );
    }
    insert_routing_headers(&mut headers, params.service_version, params.service_group);
    headers
}

/// Builds the query string for a Connect GET call.
pub fn build_get_query(
    message: &[u8],
    format: WireFormat,
    compression: Option<Compression>,
) -> String {
    let encoding = match format {
        WireFormat::Binary => "proto",
        WireFormat::Json { .. } => "json",
    };
    let mut query = format!(
        "connect=v1&encoding={}&base64=1&message={}",
        encoding,
        BASE64_URL_SAFE_NO_PAD.encode(message)
    );
    if let Some(algorithm) = compression {
        query.push_str("&compression=");
        query.push_str(algorithm.as_str());
    }
    query
}

// Wire shape of the Connect error object and end-stream payload.

#[derive(Serialize, Deserialize)]
struct WireDetail {
    #[serde(rename = "type")]
    type_url: String,
    #[serde(default)]
    value: String,
}

#[derive(Serialize, Deserialize)]
struct WireError {
    code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    details: Vec<WireDetail>,
}

#[derive(Serialize, Deserialize, Default)]
struct WireEndStream {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<WireError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<HashMap<String, Vec<String>>>,
}

fn status_to_wire(status: &Status) -> WireError {
    WireError {
        code: status.code.as_str().to_string(),
        message: (!status.message.is_empty()).then(|| status.message.clone()),
        details: status
            .details
            .iter()
            .map(|d| WireDetail {
                type_url: d.type_url.clone(),
                value: base64::prelude::BASE64_STANDARD_NO_PAD.encode(&d.value),
            })
            .collect(),
    }
}

fn status_from_wire(error: WireError, fallback: Code) -> Status {
    let code = Code::from_name(&error.code).unwrap_or(fallback);
    let mut status = Status::new(code, error.message.unwrap_or_default());
    status.details = error
        .details
        .into_iter()
        .filter_map(|d| {
            let value = decode_bin_value(&d.value)?;
            Some(StatusDetail::new(d.type_url, value))
        })
        .collect();
    status
}

fn metadata_to_wire(metadata: &HeaderMap) -> Option<HashMap<String, Vec<String>>> {
    if metadata.is_empty() {
        return None;
    }
    let mut wire: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in metadata.iter() {
        if let Ok(value) = value.to_str() {
            wire.entry(name.as_str().to_string())
                .or_default()
                .push(value.to_string());
        }
    }
    Some(wire)
}

fn metadata_from_wire(wire: HashMap<String, Vec<String>>) -> HeaderMap {
    let mut metadata = HeaderMap::new();
    for (name, values) in wire {
        if let Ok(name) = HeaderName::try_from(name.as_str()) {
            for value in values {
                if let Ok(value) = HeaderValue::from_str(&value) {
                    metadata.append(name.clone(), value);
                }
            }
        }
    }
    metadata
}

/// Serializes the end-stream envelope terminating a streaming response.
pub fn end_stream_frame(result: &Result<(), Status>, trailers: &HeaderMap) -> EnvelopedMessage {
    let payload = WireEndStream {
        error: result.as_ref().err().map(status_to_wire),
        metadata: metadata_to_wire(trailers),
    };
    let body = serde_json::to_vec(&payload).unwrap_or_else(|_| b"{}".to_vec());
    EnvelopedMessage::new(flags::END_STREAM, Bytes::from(body))
}

/// Parses an end-stream envelope into `(outcome, trailer metadata)`.
pub fn parse_end_stream(data: &[u8]) -> Result<(Result<(), Status>, HeaderMap), Status> {
    if data.is_empty() {
        return Ok((Ok(()), HeaderMap::new()));
    }
    let payload: WireEndStream = serde_json::from_slice(data).map_err(|e| {
        Status::internal(format!("protocol error: invalid end-stream frame: {}", e))
    })?;

    let metadata = payload.metadata.map(metadata_from_wire).unwrap_or_default();
    let outcome = match payload.error {
        Some(error) => Err(status_from_wire(error, Code::Unknown).with_metadata(metadata.clone())),
        None => Ok(()),
    };
    Ok((outcome, metadata))
}

/// Serializes the JSON error body of a failed unary call.
pub fn error_body(status: &Status) -> Bytes {
    let body = serde_json::to_vec(&status_to_wire(status)).unwrap_or_else(|_| b"{}".to_vec());
    Bytes::from(body)
}

/// HTTP status carrying a unary error.
pub fn error_http_status(status: &Status) -> StatusCode {
    StatusCode::from_u16(status.code.to_http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// Resolves a failed unary response body. The body's declared code wins;
/// the HTTP status is the fallback when the body is not a Connect error.
pub fn resolve_unary_error(http_status: StatusCode, body: &[u8]) -> Status {
    let fallback = Code::from_http_status(http_status.as_u16());
    match serde_json::from_slice::<WireError>(body) {
        Ok(error) => status_from_wire(error, fallback),
        Err(_) => Status::new(fallback, format!("HTTP {}", http_status.as_u16())),
    }
}

/// Headers sent ahead of the first response message.
pub fn response_headers(negotiated: &Negotiated, streaming: bool, accept: &str) -> HeaderMap {
    let variant = match negotiated.protocol {
        ProtocolKind::Triple => Variant::Triple,
        _ => Variant::Connect,
    };
    let mut headers = HeaderMap::new();
    let content_type = if streaming {
        variant.stream_content_type(negotiated.format)
    } else {
        variant.unary_content_type(negotiated.format)
    };
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));

    let (encoding_header, accept_header) = encoding_header_names(streaming);
    if let Some(algorithm) = negotiated.response_compression {
        headers.insert(encoding_header, HeaderValue::from_static(algorithm.as_str()));
    }
    if let Ok(value) = HeaderValue::from_str(accept) {
        headers.insert(accept_header, value);
    }
    headers
}
