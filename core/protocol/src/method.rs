// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Transport-agnostic request/response shapes and method descriptors. The
//! server binding lowers HTTP requests into [`UniversalRequest`] and lifts
//! [`UniversalResponse`] back out; the adapters only ever see these.

use bytes::Bytes;
use futures::stream::BoxStream;
use http::{HeaderMap, Method, StatusCode};

use crate::status::Status;

/// A stream of raw body bytes.
pub type ByteStream = BoxStream<'static, Result<Bytes, Status>>;

/// One element of a response body: data, or the trailer block that
/// terminates a gRPC response.
#[derive(Debug)]
pub enum BodyChunk {
    Data(Bytes),
    Trailers(HeaderMap),
}

/// A stream of response body elements.
pub type BodyStream = BoxStream<'static, Result<BodyChunk, Status>>;

/// The wire protocol negotiated for a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    Grpc,
    GrpcWeb,
    Connect,
    Triple,
}

impl ProtocolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::Grpc => "grpc",
            ProtocolKind::GrpcWeb => "grpc-web",
            ProtocolKind::Connect => "connect",
            ProtocolKind::Triple => "triple",
        }
    }
}

impl std::fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The streaming shape of an RPC method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    Unary,
    ServerStreaming,
    ClientStreaming,
    BiDiStreaming,
}

impl MethodKind {
    /// Whether the client sends more than one message.
    pub fn client_streams(&self) -> bool {
        matches!(self, MethodKind::ClientStreaming | MethodKind::BiDiStreaming)
    }

    /// Whether the server sends more than one message.
    pub fn server_streams(&self) -> bool {
        matches!(self, MethodKind::ServerStreaming | MethodKind::BiDiStreaming)
    }
}

/// Side-effect classification; only `NoSideEffects` methods are eligible
/// for GET-based invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Idempotency {
    #[default]
    Unknown,
    NoSideEffects,
}

/// Describes one RPC method: fully-qualified service, method name, shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSpec {
    pub service: String,
    pub method: String,
    pub kind: MethodKind,
    pub idempotency: Idempotency,
}

impl MethodSpec {
    pub fn new(service: impl Into<String>, method: impl Into<String>, kind: MethodKind) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            kind,
            idempotency: Idempotency::default(),
        }
    }

    pub fn with_idempotency(mut self, idempotency: Idempotency) -> Self {
        self.idempotency = idempotency;
        self
    }

    /// URL path of the method: `/package.Service/Method`.
    pub fn path(&self) -> String {
        format!("/{}/{}", self.service, self.method)
    }
}

/// A transport-agnostic inbound request.
pub struct UniversalRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

/// A transport-agnostic outbound response.
pub struct UniversalResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl UniversalResponse {
    /// A response with no body at all, used for pre-protocol rejections.
    pub fn empty(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Box::pin(futures::stream::empty()),
        }
    }
}

/// Everything an adapter establishes about a request before the handler
/// runs: wire format, compression in both directions, and the deadline.
/// Request and response compression are negotiated independently and may
/// differ.
#[derive(Debug, Clone)]
pub struct Negotiated {
    pub protocol: ProtocolKind,
    pub format: trirpc_codec::WireFormat,
    pub request_compression: Option<trirpc_codec::Compression>,
    pub response_compression: Option<trirpc_codec::Compression>,
    pub timeout: Option<std::time::Duration>,
    /// Connect GET: the request message decoded from the query string.
    pub get_message: Option<Bytes>,
}

/// How a request was rejected before a handler ran.
#[derive(Debug)]
pub enum RequestError {
    /// Reject at the HTTP layer, before any protocol is established
    /// (unsupported media type, bad verb).
    Http { status: StatusCode, message: String },
    /// Reject inside the protocol, with a proper error payload.
    Status(Status),
}

impl RequestError {
    pub fn unsupported_media_type(content_type: &str) -> Self {
        RequestError::Http {
            status: StatusCode::UNSUPPORTED_MEDIA_TYPE,
            message: format!("unsupported content-type \"{}\"", content_type),
        }
    }

    pub fn method_not_allowed(method: &Method) -> Self {
        RequestError::Http {
            status: StatusCode::METHOD_NOT_ALLOWED,
            message: format!("unsupported HTTP method \"{}\"", method),
        }
    }
}

impl From<Status> for RequestError {
    fn from(status: Status) -> Self {
        RequestError::Status(status)
    }
}
