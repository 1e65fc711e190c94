// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Drives one RPC over a leased HTTP/2 stream: writes enveloped (or, for
//! Connect unary, bare) request bytes, reads the response body back through
//! the envelope pipeline, and resolves the terminal status with the
//! per-protocol precedence rules.

use std::sync::Arc;

use bytes::Bytes;
use futures::{Future, StreamExt, stream};
use http::header::{CONTENT_ENCODING, HeaderMap};
use http::{Method, Request, StatusCode};
use parking_lot::Mutex;
use tracing::trace;

use trirpc_codec::envelope::{self, EnvelopeReader, flags};
use trirpc_codec::Compression;
use trirpc_config::client::ClientConfig;
use trirpc_protocol::{
    ByteStream, CallContext, ProtocolKind, Status, connect, grpc, grpcweb, headers as wire,
};
use trirpc_transport::{H2Dialer, Lease, SessionManager, h2_error_to_status};

/// Trailer metadata slot shared with the caller; filled when the response
/// reaches its terminal state.
pub type TrailerSlot = Arc<Mutex<HeaderMap>>;

/// The wire half of a streaming response.
pub struct IncomingStream {
    pub headers: HeaderMap,
    /// Decoded message payloads. The terminal protocol error, if any, is
    /// the last item.
    pub messages: ByteStream,
    pub trailers: TrailerSlot,
}

#[derive(Clone)]
pub struct CallTransport {
    manager: SessionManager<H2Dialer>,
    base_url: String,
    read_max_bytes: usize,
    compress_min_bytes: usize,
}

impl CallTransport {
    pub fn from_config(config: &ClientConfig) -> Result<Self, Status> {
        let dialer =
            H2Dialer::from_endpoint(&config.endpoint, &config.connection).map_err(Status::from)?;
        let uri: http::Uri = config
            .endpoint
            .parse()
            .map_err(|e| Status::unavailable(format!("invalid endpoint {}: {}", config.endpoint, e)))?;
        let host = uri
            .host()
            .ok_or_else(|| Status::unavailable(format!("missing host in {}", config.endpoint)))?;
        let base_url = format!("http://{}:{}", host, uri.port_u16().unwrap_or(80));

        Ok(Self {
            manager: SessionManager::with_config(dialer, &config.connection),
            base_url,
            read_max_bytes: config.limits.read_max_bytes,
            compress_min_bytes: config.compression.compress_min_bytes,
        })
    }

    pub fn manager(&self) -> &SessionManager<H2Dialer> {
        &self.manager
    }

    /// A unary call over the enveloped protocols (gRPC, gRPC-web, and the
    /// streaming-framed Triple shape degenerates to the same path).
    pub async fn enveloped_unary(
        &self,
        protocol: ProtocolKind,
        ctx: &Arc<CallContext>,
        path: &str,
        headers: HeaderMap,
        message: Bytes,
        request_compression: Option<Compression>,
    ) -> Result<(HeaderMap, Bytes, TrailerSlot), Status> {
        let requests: ByteStream = Box::pin(stream::iter([Ok(message)]));
        let incoming = self
            .enveloped_streaming(protocol, ctx, path, headers, requests, request_compression)
            .await?;

        let mut messages = incoming.messages;
        let mut first: Option<Bytes> = None;
        while let Some(item) = with_ctx(ctx, async { messages.next().await.transpose() }).await? {
            if first.is_some() {
                return Err(Status::internal(
                    "protocol error: received more than one response message",
                ));
            }
            first = Some(item);
        }
        let message = first.ok_or_else(|| {
            Status::internal("protocol error: missing response message")
        })?;
        Ok((incoming.headers, message, incoming.trailers))
    }

    /// A streaming call over any of the enveloped protocols.
    pub async fn enveloped_streaming(
        &self,
        protocol: ProtocolKind,
        ctx: &Arc<CallContext>,
        path: &str,
        headers: HeaderMap,
        requests: ByteStream,
        request_compression: Option<Compression>,
    ) -> Result<IncomingStream, Status> {
        let lease = with_ctx(ctx, self.manager.acquire()).await?;
        let request = self.build_request(Method::POST, path, headers)?;
        let (response_future, send_stream) =
            with_ctx(ctx, lease.open_stream(request, false)).await?;

        self.spawn_writer(ctx, send_stream, requests, request_compression);

        let response = with_ctx(ctx, async {
            response_future.await.map_err(|e| h2_error_to_status(&e))
        })
        .await?;

        let http_status = response.status();
        let response_headers = response.headers().clone();
        let response_compression = response_compression_of(protocol, &response_headers);
        let body = response.into_body();

        trace!(%http_status, protocol = %protocol, "response headers received");

        let h2_trailers: Arc<Mutex<Option<HeaderMap>>> = Arc::new(Mutex::new(None));
        let trailers: TrailerSlot = Arc::new(Mutex::new(HeaderMap::new()));
        let body_stream =
            response_body_stream(body, lease, Arc::clone(ctx), Arc::clone(&h2_trailers));
        let messages = decode_response_stream(DecodeParams {
            protocol,
            http_status,
            response_headers: response_headers.clone(),
            body: body_stream,
            response_compression,
            read_max_bytes: self.read_max_bytes,
            h2_trailers,
            trailers: Arc::clone(&trailers),
        });

        Ok(IncomingStream {
            headers: response_headers,
            messages,
            trailers,
        })
    }

    /// A Connect/Triple unary call: the request message is the whole body
    /// (or the query string for GET), and errors ride a JSON body.
    pub async fn connect_unary(
        &self,
        ctx: &Arc<CallContext>,
        path: &str,
        headers: HeaderMap,
        message: Bytes,
        request_compression: Option<Compression>,
        get_query: Option<String>,
    ) -> Result<(HeaderMap, Bytes, TrailerSlot), Status> {
        let lease = with_ctx(ctx, self.manager.acquire()).await?;

        let (request, body) = match get_query {
            Some(query) => {
                let path_and_query = format!("{}?{}", path, query);
                (
                    self.build_request(Method::GET, &path_and_query, headers)?,
                    None,
                )
            }
            None => {
                let body = match request_compression {
                    Some(algorithm) => algorithm.compress(&message).map_err(Status::from)?,
                    None => message,
                };
                (self.build_request(Method::POST, path, headers)?, Some(body))
            }
        };

        let end_of_stream = body.is_none();
        let (response_future, mut send_stream) =
            with_ctx(ctx, lease.open_stream(request, end_of_stream)).await?;
        if let Some(body) = body {
            send_stream
                .send_data(body, true)
                .map_err(|e| h2_error_to_status(&e))?;
        }

        let response = with_ctx(ctx, async {
            response_future.await.map_err(|e| h2_error_to_status(&e))
        })
        .await?;

        let http_status = response.status();
        let response_headers = response.headers().clone();
        let body = response.into_body();

        let h2_trailers: Arc<Mutex<Option<HeaderMap>>> = Arc::new(Mutex::new(None));
        let mut body_stream =
            response_body_stream(body, lease, Arc::clone(ctx), Arc::clone(&h2_trailers));

        let mut collected = Vec::new();
        while let Some(chunk) = with_ctx(ctx, async { body_stream.next().await.transpose() }).await? {
            collected.extend_from_slice(&chunk);
            if collected.len() > self.read_max_bytes {
                return Err(Status::resource_exhausted(format!(
                    "message of {} bytes exceeds read limit of {} bytes",
                    collected.len(),
                    self.read_max_bytes
                )));
            }
        }

        let encoding = response_headers
            .get(CONTENT_ENCODING)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("identity");
        let collected = match Compression::parse(encoding) {
            Some(algorithm) => algorithm
                .decompress(&collected, self.read_max_bytes)
                .map_err(Status::from)?,
            None => Bytes::from(collected),
        };

        if http_status != StatusCode::OK {
            return Err(connect::resolve_unary_error(http_status, &collected));
        }
        Ok((
            response_headers,
            collected,
            Arc::new(Mutex::new(HeaderMap::new())),
        ))
    }

    fn build_request(
        &self,
        method: Method,
        path_and_query: &str,
        headers: HeaderMap,
    ) -> Result<Request<()>, Status> {
        let uri = format!("{}{}", self.base_url, path_and_query);
        let mut request = Request::builder()
            .method(method)
            .uri(uri)
            .body(())
            .map_err(|e| Status::internal(format!("failed to build request: {}", e)))?;
        request.headers_mut().extend(headers);
        Ok(request)
    }

    /// Pumps the request payload stream onto the wire, one envelope per
    /// message, ending the stream cleanly or resetting it on cancellation.
    fn spawn_writer(
        &self,
        ctx: &Arc<CallContext>,
        mut send_stream: h2::SendStream<Bytes>,
        mut requests: ByteStream,
        request_compression: Option<Compression>,
    ) {
        let ctx = Arc::clone(ctx);
        let compress_min_bytes = self.compress_min_bytes;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = ctx.token().cancelled() => {
                        send_stream.send_reset(h2::Reason::CANCEL);
                        return;
                    }
                    item = requests.next() => match item {
                        Some(Ok(payload)) => {
                            let frame = match envelope::frame_message(
                                payload,
                                0,
                                request_compression,
                                compress_min_bytes,
                            ) {
                                Ok(frame) => frame,
                                Err(_) => {
                                    send_stream.send_reset(h2::Reason::INTERNAL_ERROR);
                                    return;
                                }
                            };
                            if send_stream.send_data(frame, false).is_err() {
                                return;
                            }
                        }
                        Some(Err(_)) => {
                            send_stream.send_reset(h2::Reason::CANCEL);
                            return;
                        }
                        None => {
                            let _ = send_stream.send_data(Bytes::new(), true);
                            return;
                        }
                    }
                }
            }
        });
    }
}

/// Races a transport future against the call's cancellation signal.
async fn with_ctx<T>(
    ctx: &CallContext,
    future: impl Future<Output = Result<T, Status>>,
) -> Result<T, Status> {
    tokio::select! {
        biased;
        _ = ctx.token().cancelled() => Err(ctx
            .abort_reason()
            .unwrap_or_else(|| Status::canceled("This operation was aborted"))),
        result = future => result,
    }
}

fn response_compression_of(protocol: ProtocolKind, headers: &HeaderMap) -> Option<Compression> {
    let name = match protocol {
        ProtocolKind::Grpc | ProtocolKind::GrpcWeb => wire::HEADER_GRPC_ENCODING,
        ProtocolKind::Connect | ProtocolKind::Triple => wire::HEADER_CONNECT_CONTENT_ENCODING,
    };
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(Compression::parse)
}

/// Lowers an h2 response body into a byte stream. Flow-control capacity is
/// released as chunks arrive, the session's activity clock is reset (so
/// keep-alive pings stay quiet during active reads), HTTP trailers are
/// captured into `h2_trailers`, and the lease rides along until the body is
/// fully consumed.
fn response_body_stream(
    body: h2::RecvStream,
    lease: Lease<H2Dialer>,
    ctx: Arc<CallContext>,
    h2_trailers: Arc<Mutex<Option<HeaderMap>>>,
) -> ByteStream {
    struct State {
        body: h2::RecvStream,
        lease: Option<Lease<H2Dialer>>,
        ctx: Arc<CallContext>,
        h2_trailers: Arc<Mutex<Option<HeaderMap>>>,
        done: bool,
    }

    let state = State {
        body,
        lease: Some(lease),
        ctx,
        h2_trailers,
        done: false,
    };

    Box::pin(stream::unfold(state, |mut s| async move {
        if s.done {
            return None;
        }
        tokio::select! {
            biased;
            _ = s.ctx.token().cancelled() => {
                s.done = true;
                let reason = s
                    .ctx
                    .abort_reason()
                    .unwrap_or_else(|| Status::canceled("This operation was aborted"));
                Some((Err(reason), s))
            }
            chunk = s.body.data() => match chunk {
                Some(Ok(bytes)) => {
                    let _ = s.body.flow_control().release_capacity(bytes.len());
                    if let Some(lease) = &s.lease {
                        lease.record_activity();
                    }
                    Some((Ok(bytes), s))
                }
                Some(Err(e)) => {
                    s.done = true;
                    Some((Err(h2_error_to_status(&e)), s))
                }
                None => {
                    s.done = true;
                    match s.body.trailers().await {
                        Ok(trailers) => {
                            *s.h2_trailers.lock() = trailers;
                            s.lease.take();
                            None
                        }
                        Err(e) => Some((Err(h2_error_to_status(&e)), s)),
                    }
                }
            }
        }
    }))
}

struct DecodeParams {
    protocol: ProtocolKind,
    http_status: StatusCode,
    response_headers: HeaderMap,
    body: ByteStream,
    response_compression: Option<Compression>,
    read_max_bytes: usize,
    h2_trailers: Arc<Mutex<Option<HeaderMap>>>,
    trailers: TrailerSlot,
}

/// Turns the raw body into decoded message payloads, consuming the
/// protocol's terminal frame (gRPC-web trailer envelope, Connect end-stream
/// envelope, or HTTP trailers) and emitting the terminal error, if any, as
/// the stream's last item.
fn decode_response_stream(params: DecodeParams) -> ByteStream {
    struct State {
        reader: EnvelopeReader<ByteStream, Status>,
        protocol: ProtocolKind,
        http_status: StatusCode,
        response_headers: HeaderMap,
        response_compression: Option<Compression>,
        read_max_bytes: usize,
        h2_trailers: Arc<Mutex<Option<HeaderMap>>>,
        trailers: TrailerSlot,
        in_band: Option<HeaderMap>,
        outcome: Option<Result<(), Status>>,
        done: bool,
    }

    let state = State {
        reader: EnvelopeReader::new(params.body, params.read_max_bytes),
        protocol: params.protocol,
        http_status: params.http_status,
        response_headers: params.response_headers,
        response_compression: params.response_compression,
        read_max_bytes: params.read_max_bytes,
        h2_trailers: params.h2_trailers,
        trailers: params.trailers,
        in_band: None,
        outcome: None,
        done: false,
    };

    Box::pin(stream::unfold(state, |mut s| async move {
        if s.done {
            return None;
        }
        loop {
            match s.reader.next().await {
                Some(Ok(env)) => {
                    if s.protocol == ProtocolKind::GrpcWeb && env.is_set(flags::TRAILER) {
                        match grpcweb::parse_trailer_frame(&env.data) {
                            Ok(map) => {
                                *s.trailers.lock() = map.clone();
                                s.in_band = Some(map);
                                continue;
                            }
                            Err(status) => {
                                s.done = true;
                                return Some((Err(status), s));
                            }
                        }
                    }
                    if matches!(s.protocol, ProtocolKind::Connect | ProtocolKind::Triple)
                        && env.is_set(flags::END_STREAM)
                    {
                        match connect::parse_end_stream(&env.data) {
                            Ok((outcome, metadata)) => {
                                *s.trailers.lock() = metadata;
                                s.outcome = Some(outcome);
                                continue;
                            }
                            Err(status) => {
                                s.done = true;
                                return Some((Err(status), s));
                            }
                        }
                    }
                    if s.outcome.is_some() || s.in_band.is_some() {
                        s.done = true;
                        return Some((
                            Err(Status::internal(
                                "protocol error: message after the terminal frame",
                            )),
                            s,
                        ));
                    }
                    match envelope::unframe_message(env, s.response_compression, s.read_max_bytes)
                    {
                        Ok(payload) => return Some((Ok(payload), s)),
                        Err(e) => {
                            s.done = true;
                            return Some((Err(e.into()), s));
                        }
                    }
                }
                Some(Err(status)) => {
                    s.done = true;
                    return Some((Err(status), s));
                }
                None => {
                    s.done = true;
                    let outcome = match s.protocol {
                        ProtocolKind::Grpc => {
                            let trailers = s.h2_trailers.lock().clone();
                            if let Some(map) = &trailers {
                                *s.trailers.lock() = map.clone();
                            }
                            grpc::resolve_response(
                                s.http_status,
                                &s.response_headers,
                                trailers.as_ref(),
                            )
                        }
                        ProtocolKind::GrpcWeb => grpc::resolve_response(
                            s.http_status,
                            &s.response_headers,
                            s.in_band.as_ref(),
                        ),
                        ProtocolKind::Connect | ProtocolKind::Triple => {
                            s.outcome.take().unwrap_or_else(|| {
                                Err(Status::internal(
                                    "protocol error: stream ended without an end-stream frame",
                                ))
                            })
                        }
                    };
                    return match outcome {
                        Ok(()) => None,
                        Err(status) => Some((Err(status), s)),
                    };
                }
            }
        }
    }))
}
