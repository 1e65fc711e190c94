// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! The universal handler pipeline. Every transport lowers its requests into
//! [`UniversalRequest`]; the pipeline detects the wire protocol, negotiates
//! format/compression/deadline through the matching adapter, pipes inbound
//! frames through decompress→parse and outbound messages through
//! serialize→compress→frame, and terminates the response with the
//! protocol's trailer form. Handler failures become canonical statuses:
//! a thrown `Status` is preserved as-is, anything else is `Internal`.

use std::sync::Arc;

use bytes::Bytes;
use futures::{FutureExt, StreamExt, stream};
use http::header::CONTENT_TYPE;
use http::{HeaderMap, Method, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use trirpc_codec::envelope::{self, EnvelopeReader, flags};
use trirpc_codec::{Compression, Serializer};
use trirpc_config::server::ServerConfig;
use trirpc_protocol::{
    BodyChunk, BodyStream, ByteStream, CallContext, MethodKind, Negotiated, ProtocolKind,
    RequestError, Status, UniversalRequest, UniversalResponse, connect, grpc, grpcweb,
};

use crate::handler::MethodHandler;
use crate::router::Router;

pub struct ServicePipeline {
    router: Arc<Router>,
    config: Arc<ServerConfig>,
    shutdown: CancellationToken,
}

impl ServicePipeline {
    pub fn new(router: Arc<Router>, config: Arc<ServerConfig>, shutdown: CancellationToken) -> Self {
        Self {
            router,
            config,
            shutdown,
        }
    }

    /// Handles one transport-agnostic request, never failing: every error
    /// becomes a well-formed protocol response.
    pub async fn handle(&self, request: UniversalRequest) -> UniversalResponse {
        let content_type = request
            .headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();

        let Some(family) = detect_protocol(&content_type, &request.method) else {
            debug!(%content_type, "rejecting request with unsupported content type");
            return UniversalResponse::empty(StatusCode::UNSUPPORTED_MEDIA_TYPE);
        };

        let route = match self.router.dispatch(&request.path, &request.headers) {
            Ok(route) => route,
            Err(status) => {
                debug!(path = %request.path, "no matching route");
                return error_response(family.protocol, family.wire_streaming(None), &status);
            }
        };

        let negotiated = match family.negotiate(&self.config, &route.spec, &request) {
            Ok(negotiated) => negotiated,
            Err(RequestError::Http { status, message }) => {
                debug!(%message, "rejecting request at the HTTP layer");
                return UniversalResponse::empty(status);
            }
            Err(RequestError::Status(status)) => {
                return error_response(
                    family.protocol,
                    family.wire_streaming(Some(&route.spec)),
                    &status,
                );
            }
        };

        let wire_streaming = match negotiated.protocol {
            ProtocolKind::Grpc | ProtocolKind::GrpcWeb => true,
            ProtocolKind::Connect | ProtocolKind::Triple => {
                route.spec.kind != MethodKind::Unary && negotiated.get_message.is_none()
            }
        };

        let ctx = CallContext::builder(negotiated.protocol)
            .request_headers(request.headers.clone())
            .request_compression(negotiated.request_compression)
            .response_compression(negotiated.response_compression)
            .service_version(optional_header(&request.headers, trirpc_protocol::headers::HEADER_TRI_SERVICE_VERSION))
            .service_group(optional_header(&request.headers, trirpc_protocol::headers::HEADER_TRI_SERVICE_GROUP))
            .build();
        if let Some(timeout) = negotiated.timeout {
            ctx.set_timeout(timeout);
        }
        ctx.link_signal(
            self.shutdown.clone(),
            Status::unavailable("server is shutting down"),
        );

        let serializer = Serializer::new(negotiated.format, &self.config.limits);
        let read_max_bytes = self.config.limits.read_max_bytes;

        let inbound: ByteStream = if let Some(message) = negotiated.get_message.clone() {
            match inflate_get_message(message, negotiated.request_compression, read_max_bytes) {
                Ok(message) => Box::pin(stream::iter([Ok(message)])),
                Err(status) => {
                    return error_response(negotiated.protocol, wire_streaming, &status);
                }
            }
        } else if wire_streaming {
            decode_inbound(
                request.body,
                negotiated.request_compression,
                read_max_bytes,
            )
        } else {
            collect_unary_body(
                request.body,
                negotiated.request_compression,
                read_max_bytes,
            )
        };

        self.invoke(route, negotiated, ctx, serializer, inbound).await
    }

    async fn invoke(
        &self,
        route: Arc<crate::router::Route>,
        negotiated: Negotiated,
        ctx: Arc<CallContext>,
        serializer: Serializer,
        mut inbound: ByteStream,
    ) -> UniversalResponse {
        let compress_min_bytes = self.config.compression.compress_min_bytes;
        let accept = self.config.compression.accept_header_value();
        let protocol = negotiated.protocol;

        match &route.handler {
            MethodHandler::Unary(handler) => {
                let message = match single_message(&mut inbound).await {
                    Ok(message) => message,
                    Err(status) => return error_response(protocol, false, &status),
                };
                let outcome =
                    run_guarded(&ctx, handler(Arc::clone(&ctx), serializer, message)).await;
                ctx.finish();
                self.unary_response(&negotiated, &ctx, &accept, compress_min_bytes, outcome)
            }
            MethodHandler::ClientStreaming(handler) => {
                let outcome =
                    run_guarded(&ctx, handler(Arc::clone(&ctx), serializer, inbound)).await;
                ctx.finish();
                self.unary_response(&negotiated, &ctx, &accept, compress_min_bytes, outcome)
            }
            MethodHandler::ServerStreaming(handler) => {
                let message = match single_message(&mut inbound).await {
                    Ok(message) => message,
                    Err(status) => return error_response(protocol, true, &status),
                };
                let outcome =
                    run_guarded(&ctx, handler(Arc::clone(&ctx), serializer, message)).await;
                self.streaming_response(&negotiated, &ctx, &accept, compress_min_bytes, outcome)
            }
            MethodHandler::Duplex(handler) => {
                let outcome =
                    run_guarded(&ctx, handler(Arc::clone(&ctx), serializer, inbound)).await;
                self.streaming_response(&negotiated, &ctx, &accept, compress_min_bytes, outcome)
            }
        }
    }

    fn unary_response(
        &self,
        negotiated: &Negotiated,
        ctx: &Arc<CallContext>,
        accept: &str,
        compress_min_bytes: usize,
        outcome: Result<Bytes, Status>,
    ) -> UniversalResponse {
        let protocol = negotiated.protocol;
        match protocol {
            ProtocolKind::Grpc | ProtocolKind::GrpcWeb => {
                let mut headers = grpc::response_headers(negotiated, accept);
                headers.extend(ctx.response_headers());
                let trailers = ctx.response_trailers();

                let chunks: Vec<Result<BodyChunk, Status>> = match outcome {
                    Ok(message) => {
                        match envelope::frame_message(
                            message,
                            0,
                            negotiated.response_compression,
                            compress_min_bytes,
                        ) {
                            Ok(frame) => vec![
                                Ok(BodyChunk::Data(frame)),
                                Ok(terminal_chunk(protocol, &Ok(()), &trailers)),
                            ],
                            Err(e) => {
                                vec![Ok(terminal_chunk(protocol, &Err(e.into()), &trailers))]
                            }
                        }
                    }
                    Err(status) => vec![Ok(terminal_chunk(protocol, &Err(status), &trailers))],
                };

                UniversalResponse {
                    status: StatusCode::OK,
                    headers,
                    body: Box::pin(stream::iter(chunks)),
                }
            }
            ProtocolKind::Connect | ProtocolKind::Triple => match outcome {
                Ok(message) => {
                    let compression = negotiated
                        .response_compression
                        .filter(|_| message.len() >= compress_min_bytes);
                    let body = match compression {
                        Some(algorithm) => match algorithm.compress(&message) {
                            Ok(compressed) => compressed,
                            Err(e) => {
                                return error_response(protocol, false, &Status::from(e));
                            }
                        },
                        None => message,
                    };
                    let effective = Negotiated {
                        response_compression: compression,
                        ..negotiated.clone()
                    };
                    let mut headers = connect::response_headers(&effective, false, accept);
                    headers.extend(ctx.response_headers());
                    // TODO: surface ctx trailers as `trailer-` prefixed
                    // response headers for Connect unary calls.
                    UniversalResponse {
                        status: StatusCode::OK,
                        headers,
                        body: Box::pin(stream::iter([Ok(BodyChunk::Data(body))])),
                    }
                }
                Err(status) => error_response(protocol, false, &status),
            },
        }
    }

    fn streaming_response(
        &self,
        negotiated: &Negotiated,
        ctx: &Arc<CallContext>,
        accept: &str,
        compress_min_bytes: usize,
        outcome: Result<ByteStream, Status>,
    ) -> UniversalResponse {
        let protocol = negotiated.protocol;
        let messages = match outcome {
            Ok(messages) => messages,
            Err(status) => {
                ctx.finish();
                return error_response(protocol, true, &status);
            }
        };

        let mut headers = match protocol {
            ProtocolKind::Grpc | ProtocolKind::GrpcWeb => grpc::response_headers(negotiated, accept),
            ProtocolKind::Connect | ProtocolKind::Triple => {
                connect::response_headers(negotiated, true, accept)
            }
        };
        headers.extend(ctx.response_headers());

        UniversalResponse {
            status: StatusCode::OK,
            headers,
            body: streaming_body(
                protocol,
                messages,
                negotiated.response_compression,
                compress_min_bytes,
                Arc::clone(ctx),
            ),
        }
    }
}

/// Runs a handler future, racing it against the composed cancellation
/// signal and capturing panics as `Internal`.
async fn run_guarded<T>(
    ctx: &Arc<CallContext>,
    future: impl std::future::Future<Output = Result<T, Status>>,
) -> Result<T, Status> {
    tokio::select! {
        biased;
        _ = ctx.token().cancelled() => {
            Err(ctx
                .abort_reason()
                .unwrap_or_else(|| Status::canceled("This operation was aborted")))
        }
        result = std::panic::AssertUnwindSafe(future).catch_unwind() => match result {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!("handler panicked");
                Err(Status::internal("handler panicked"))
            }
        }
    }
}

struct Family {
    protocol: ProtocolKind,
    stream_content_type: bool,
}

impl Family {
    fn wire_streaming(&self, spec: Option<&trirpc_protocol::MethodSpec>) -> bool {
        match self.protocol {
            ProtocolKind::Grpc | ProtocolKind::GrpcWeb => true,
            ProtocolKind::Connect | ProtocolKind::Triple => {
                self.stream_content_type
                    || spec.is_some_and(|spec| spec.kind != MethodKind::Unary)
            }
        }
    }

    fn negotiate(
        &self,
        config: &ServerConfig,
        spec: &trirpc_protocol::MethodSpec,
        request: &UniversalRequest,
    ) -> Result<Negotiated, RequestError> {
        match self.protocol {
            ProtocolKind::Grpc => grpc::negotiate_request(config, request),
            ProtocolKind::GrpcWeb => grpcweb::negotiate_request(config, request),
            ProtocolKind::Connect | ProtocolKind::Triple => {
                connect::negotiate_request(config, spec, request)
            }
        }
    }
}

fn detect_protocol(content_type: &str, method: &Method) -> Option<Family> {
    if method == Method::GET {
        // Only Connect defines GET-based unary calls.
        return Some(Family {
            protocol: ProtocolKind::Connect,
            stream_content_type: false,
        });
    }
    if grpc::parse_content_type(content_type).is_some() {
        return Some(Family {
            protocol: ProtocolKind::Grpc,
            stream_content_type: true,
        });
    }
    if grpcweb::parse_content_type(content_type).is_some() {
        return Some(Family {
            protocol: ProtocolKind::GrpcWeb,
            stream_content_type: true,
        });
    }
    connect::parse_content_type(content_type).map(|(variant, _, stream)| Family {
        protocol: variant.protocol(),
        stream_content_type: stream,
    })
}

fn optional_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn inflate_get_message(
    message: Bytes,
    compression: Option<Compression>,
    read_max_bytes: usize,
) -> Result<Bytes, Status> {
    match compression {
        Some(algorithm) => algorithm
            .decompress(&message, read_max_bytes)
            .map_err(Status::from),
        None => Ok(message),
    }
}

/// Reassembles and decompresses the enveloped inbound frames.
fn decode_inbound(
    body: ByteStream,
    compression: Option<Compression>,
    read_max_bytes: usize,
) -> ByteStream {
    struct State {
        reader: EnvelopeReader<ByteStream, Status>,
        compression: Option<Compression>,
        read_max_bytes: usize,
        done: bool,
    }

    let state = State {
        reader: EnvelopeReader::new(body, read_max_bytes),
        compression,
        read_max_bytes,
        done: false,
    };

    Box::pin(stream::unfold(state, |mut s| async move {
        if s.done {
            return None;
        }
        match s.reader.next().await {
            Some(Ok(env)) => {
                // Clients do not send message frames after their terminal
                // marker; treat one as end of input.
                if env.is_set(flags::END_STREAM) || env.is_set(flags::TRAILER) {
                    s.done = true;
                    return None;
                }
                match envelope::unframe_message(env, s.compression, s.read_max_bytes) {
                    Ok(payload) => Some((Ok(payload), s)),
                    Err(e) => {
                        s.done = true;
                        Some((Err(e.into()), s))
                    }
                }
            }
            Some(Err(status)) => {
                s.done = true;
                Some((Err(status), s))
            }
            None => None,
        }
    }))
}

/// Collects a bare (non-enveloped) unary request body.
fn collect_unary_body(
    body: ByteStream,
    compression: Option<Compression>,
    read_max_bytes: usize,
) -> ByteStream {
    Box::pin(stream::once(async move {
        let mut body = body;
        let mut collected = Vec::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            collected.extend_from_slice(&chunk);
            if collected.len() > read_max_bytes {
                return Err(Status::resource_exhausted(format!(
                    "message of {} bytes exceeds read limit of {} bytes",
                    collected.len(),
                    read_max_bytes
                )));
            }
        }
        match compression {
            Some(algorithm) => algorithm
                .decompress(&collected, read_max_bytes)
                .map_err(Status::from),
            None => Ok(Bytes::from(collected)),
        }
    }))
}

async fn single_message(inbound: &mut ByteStream) -> Result<Bytes, Status> {
    let first = inbound
        .next()
        .await
        .transpose()?
        .ok_or_else(|| Status::invalid_argument("missing request message"))?;
    match inbound.next().await {
        None => Ok(first),
        Some(Err(status)) => Err(status),
        Some(Ok(_)) => Err(Status::invalid_argument(
            "expected exactly one request message",
        )),
    }
}

/// The protocol's terminal element for a finished call.
fn terminal_chunk(
    protocol: ProtocolKind,
    result: &Result<(), Status>,
    trailers: &HeaderMap,
) -> BodyChunk {
    match protocol {
        ProtocolKind::Grpc => BodyChunk::Trailers(grpc::trailers_for(result, trailers)),
        ProtocolKind::GrpcWeb => BodyChunk::Data(envelope::encode_envelope(
            &grpcweb::encode_trailer_frame(&grpc::trailers_for(result, trailers)),
        )),
        ProtocolKind::Connect | ProtocolKind::Triple => BodyChunk::Data(
            envelope::encode_envelope(&connect::end_stream_frame(result, trailers)),
        ),
    }
}

/// Frames outbound messages and appends the terminal element; an error from
/// the handler stream (or an abort of the call context) becomes the
/// terminal status.
fn streaming_body(
    protocol: ProtocolKind,
    messages: ByteStream,
    compression: Option<Compression>,
    compress_min_bytes: usize,
    ctx: Arc<CallContext>,
) -> BodyStream {
    struct State {
        messages: ByteStream,
        protocol: ProtocolKind,
        compression: Option<Compression>,
        compress_min_bytes: usize,
        ctx: Arc<CallContext>,
        done: bool,
    }

    let state = State {
        messages,
        protocol,
        compression,
        compress_min_bytes,
        ctx,
        done: false,
    };

    Box::pin(stream::unfold(state, |mut s| async move {
        if s.done {
            return None;
        }

        let next = tokio::select! {
            biased;
            _ = s.ctx.token().cancelled() => {
                let reason = s
                    .ctx
                    .abort_reason()
                    .unwrap_or_else(|| Status::canceled("This operation was aborted"));
                Some(Err(reason))
            }
            item = s.messages.next() => item,
        };

        match next {
            Some(Ok(payload)) => {
                match envelope::frame_message(payload, 0, s.compression, s.compress_min_bytes) {
                    Ok(frame) => Some((Ok(BodyChunk::Data(frame)), s)),
                    Err(e) => {
                        s.done = true;
                        s.ctx.finish();
                        let trailers = s.ctx.response_trailers();
                        Some((
                            Ok(terminal_chunk(s.protocol, &Err(e.into()), &trailers)),
                            s,
                        ))
                    }
                }
            }
            Some(Err(status)) => {
                s.done = true;
                s.ctx.finish();
                let trailers = s.ctx.response_trailers();
                Some((Ok(terminal_chunk(s.protocol, &Err(status), &trailers)), s))
            }
            None => {
                s.done = true;
                s.ctx.finish();
                let trailers = s.ctx.response_trailers();
                Some((Ok(terminal_chunk(s.protocol, &Ok(()), &trailers)), s))
            }
        }
    }))
}

/// A protocol-correct error response, used for pre-handler rejections and
/// failed unary calls.
pub(crate) fn error_response(
    protocol: ProtocolKind,
    wire_streaming: bool,
    status: &Status,
) -> UniversalResponse {
    use http::HeaderValue;
    use trirpc_protocol::headers::*;

    match protocol {
        ProtocolKind::Grpc | ProtocolKind::GrpcWeb => {
            let mut headers = HeaderMap::new();
            headers.insert(
                CONTENT_TYPE,
                HeaderValue::from_static(match protocol {
                    ProtocolKind::GrpcWeb => CONTENT_TYPE_GRPC_WEB_PROTO,
                    _ => CONTENT_TYPE_GRPC_PROTO,
                }),
            );
            let chunk = terminal_chunk(protocol, &Err(status.clone()), &HeaderMap::new());
            UniversalResponse {
                status: StatusCode::OK,
                headers,
                body: Box::pin(stream::iter([Ok(chunk)])),
            }
        }
        ProtocolKind::Connect | ProtocolKind::Triple if wire_streaming => {
            let mut headers = HeaderMap::new();
            headers.insert(
                CONTENT_TYPE,
                HeaderValue::from_static(match protocol {
                    ProtocolKind::Triple => CONTENT_TYPE_TRIPLE_PROTO,
                    _ => CONTENT_TYPE_CONNECT_STREAM_PROTO,
                }),
            );
            let chunk = terminal_chunk(protocol, &Err(status.clone()), &HeaderMap::new());
            UniversalResponse {
                status: StatusCode::OK,
                headers,
                body: Box::pin(stream::iter([Ok(chunk)])),
            }
        }
        ProtocolKind::Connect | ProtocolKind::Triple => {
            let mut headers = HeaderMap::new();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            UniversalResponse {
                status: connect::error_http_status(status),
                headers,
                body: Box::pin(stream::iter([Ok(BodyChunk::Data(connect::error_body(
                    status,
                )))])),
            }
        }
    }
}
