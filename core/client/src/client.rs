// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! The typed client facade. One `Client` serves one endpoint over one
//! negotiated protocol; every call flows through the invocation runner and
//! the shared session manager, so concurrent calls multiplex over a single
//! HTTP/2 connection.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt, stream};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use trirpc_codec::{Compression, Serializer, WireFormat};
use trirpc_config::Configuration;
use trirpc_config::client::ClientConfig;
use trirpc_protocol::{
    ByteStream, CallContext, Idempotency, MethodKind, MethodSpec, ProtocolKind, Status, connect,
    grpc, grpcweb,
};

use crate::interceptor::{CallRequest, CallResponse, Interceptor, Payload};
use crate::runner::{CallOptions, build_context, run_streaming, run_unary};
use crate::transport::CallTransport;

/// The result of a unary call.
#[derive(Debug)]
pub struct Response<Res> {
    pub message: Res,
    pub headers: HeaderMap,
    pub trailers: HeaderMap,
}

pub struct ClientBuilder {
    config: ClientConfig,
    protocol: ProtocolKind,
    interceptors: Vec<Arc<dyn Interceptor>>,
    service_version: Option<String>,
    service_group: Option<String>,
}

impl ClientBuilder {
    pub fn new(endpoint: &str) -> Self {
        Self {
            config: ClientConfig::with_endpoint(endpoint),
            protocol: ProtocolKind::Triple,
            interceptors: Vec::new(),
            service_version: None,
            service_group: None,
        }
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn protocol(mut self, protocol: ProtocolKind) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn service_version(mut self, version: &str) -> Self {
        self.service_version = Some(version.to_string());
        self
    }

    pub fn service_group(mut self, group: &str) -> Self {
        self.service_group = Some(group.to_string());
        self
    }

    pub fn build(self) -> Result<Client, Status> {
        self.config
            .validate()
            .map_err(|e| Status::invalid_argument(e.to_string()))?;

        let mut default_headers = HeaderMap::new();
        for (name, value) in &self.config.headers {
            let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::from_str(value),
            ) else {
                return Err(Status::invalid_argument(format!(
                    "invalid configured header \"{}\"",
                    name
                )));
            };
            default_headers.insert(name, value);
        }

        let format = if self.config.use_binary_format {
            WireFormat::Binary
        } else {
            WireFormat::Json { strict: false }
        };
        let request_timeout =
            Some(Duration::from(self.config.request_timeout)).filter(|t| !t.is_zero());

        debug!(endpoint = %self.config.endpoint, protocol = %self.protocol, "building client");

        Ok(Client {
            transport: CallTransport::from_config(&self.config)?,
            protocol: self.protocol,
            serializer: Serializer::new(format, &self.config.limits),
            format,
            accept_compression: self.config.compression.accept_header_value(),
            preferred_compression: self
                .config
                .compression
                .accept
                .first()
                .copied()
                .and_then(Compression::from_type),
            compress_min_bytes: self.config.compression.compress_min_bytes,
            use_http_get: self.config.use_http_get,
            request_timeout,
            default_headers,
            interceptors: self.interceptors,
            service_version: self.service_version,
            service_group: self.service_group,
        })
    }
}

pub struct Client {
    transport: CallTransport,
    protocol: ProtocolKind,
    serializer: Serializer,
    format: WireFormat,
    accept_compression: String,
    preferred_compression: Option<Compression>,
    compress_min_bytes: usize,
    use_http_get: bool,
    request_timeout: Option<Duration>,
    default_headers: HeaderMap,
    interceptors: Vec<Arc<dyn Interceptor>>,
    service_version: Option<String>,
    service_group: Option<String>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("protocol", &self.protocol)
            .field("serializer", &self.serializer)
            .field("format", &self.format)
            .field("accept_compression", &self.accept_compression)
            .field("preferred_compression", &self.preferred_compression)
            .field("compress_min_bytes", &self.compress_min_bytes)
            .field("use_http_get", &self.use_http_get)
            .field("request_timeout", &self.request_timeout)
            .field("default_headers", &self.default_headers)
            .field("interceptors", &self.interceptors.len())
            .field("service_version", &self.service_version)
            .field("service_group", &self.service_group)
            .finish()
    }
}

impl Client {
    pub fn builder(endpoint: &str) -> ClientBuilder {
        ClientBuilder::new(endpoint)
    }

    /// The session manager owning this client's shared connection; exposed
    /// so callers can abort it or observe its state.
    pub fn session_manager(&self) -> &trirpc_transport::SessionManager<trirpc_transport::H2Dialer> {
        self.transport.manager()
    }

    fn effective_timeout(&self, options: &CallOptions) -> Option<Duration> {
        options.timeout.or(self.request_timeout)
    }

    fn request_headers(
        &self,
        streaming: bool,
        timeout: Option<Duration>,
        compression: Option<Compression>,
        extra: &HeaderMap,
    ) -> HeaderMap {
        let mut headers = match self.protocol {
            ProtocolKind::Grpc => grpc::request_headers(&grpc::RequestParams {
                format: self.format,
                compression,
                accept_compression: &self.accept_compression,
                timeout,
                service_version: self.service_version.as_deref(),
                service_group: self.service_group.as_deref(),
            }),
            ProtocolKind::GrpcWeb => grpcweb::request_headers(&grpc::RequestParams {
                format: self.format,
                compression,
                accept_compression: &self.accept_compression,
                timeout,
                service_version: self.service_version.as_deref(),
                service_group: self.service_group.as_deref(),
            }),
            ProtocolKind::Connect | ProtocolKind::Triple => {
                connect::request_headers(&connect::RequestParams {
                    variant: if self.protocol == ProtocolKind::Triple {
                        connect::Variant::Triple
                    } else {
                        connect::Variant::Connect
                    },
                    format: self.format,
                    streaming,
                    compression,
                    accept_compression: &self.accept_compression,
                    timeout,
                    service_version: self.service_version.as_deref(),
                    service_group: self.service_group.as_deref(),
                })
            }
        };
        for (name, value) in self.default_headers.iter() {
            headers.insert(name.clone(), value.clone());
        }
        for (name, value) in extra.iter() {
            headers.insert(name.clone(), value.clone());
        }
        headers
    }

    /// Issues a unary call.
    pub async fn unary<Req, Res>(
        &self,
        spec: &MethodSpec,
        message: Req,
        options: CallOptions,
    ) -> Result<Response<Res>, Status>
    where
        Req: prost::Message + Serialize,
        Res: prost::Message + DeserializeOwned + Default,
    {
        if spec.kind != MethodKind::Unary {
            return Err(Status::internal(format!(
                "{} is not a unary method",
                spec.path()
            )));
        }

        let payload = self.serializer.serialize(&message).map_err(Status::from)?;
        let timeout = self.effective_timeout(&options);
        let use_get = self.use_http_get
            && self.protocol == ProtocolKind::Connect
            && spec.idempotency == Idempotency::NoSideEffects;
        let compression = self
            .preferred_compression
            .filter(|_| !use_get && payload.len() >= self.compress_min_bytes);

        let headers = self.request_headers(false, timeout, compression, &options.headers);
        let ctx = build_context(self.protocol, headers.clone(), timeout, options.signal.as_ref());

        let transport = self.transport.clone();
        let protocol = self.protocol;
        let format = self.format;
        let path = spec.path();
        let terminal = move |request: CallRequest| -> BoxFuture<'static, Result<CallResponse, Status>> {
            let transport = transport.clone();
            let path = path.clone();
            Box::pin(async move {
                let message = request.payload.expect_unary()?;
                let (headers, body, trailers) = match protocol {
                    ProtocolKind::Grpc | ProtocolKind::GrpcWeb => {
                        transport
                            .enveloped_unary(
                                protocol,
                                &request.ctx,
                                &path,
                                request.headers,
                                message,
                                compression,
                            )
                            .await?
                    }
                    ProtocolKind::Connect | ProtocolKind::Triple => {
                        let get_query = use_get
                            .then(|| connect::build_get_query(&message, format, None));
                        transport
                            .connect_unary(
                                &request.ctx,
                                &path,
                                request.headers,
                                message,
                                compression,
                                get_query,
                            )
                            .await?
                    }
                };
                Ok(CallResponse {
                    headers,
                    payload: Payload::Unary(body),
                    trailers,
                })
            })
        };

        let request = CallRequest {
            spec: spec.clone(),
            headers,
            payload: Payload::Unary(payload),
            ctx: Arc::clone(&ctx),
        };
        let response = run_unary(request, &self.interceptors, &terminal).await?;

        let bytes = response.payload.expect_unary()?;
        let message = self.serializer.parse::<Res>(&bytes).map_err(Status::from)?;
        Ok(Response {
            message,
            headers: response.headers,
            trailers: response.trailers.lock().clone(),
        })
    }

    /// Issues a server-streaming call: one request message, many responses.
    pub async fn server_streaming<Req, Res>(
        &self,
        spec: &MethodSpec,
        message: Req,
        options: CallOptions,
    ) -> Result<StreamingResponse<Res>, Status>
    where
        Req: prost::Message + Serialize,
        Res: prost::Message + DeserializeOwned + Default + Send + 'static,
    {
        if spec.kind != MethodKind::ServerStreaming {
            return Err(Status::internal(format!(
                "{} is not a server-streaming method",
                spec.path()
            )));
        }
        let payload = self.serializer.serialize(&message).map_err(Status::from)?;
        let requests: ByteStream = Box::pin(stream::iter([Ok(payload)]));
        self.streaming_call(spec, requests, options).await
    }

    /// Issues a bidirectional (or client-streaming) call.
    pub async fn duplex<Req, Res>(
        &self,
        spec: &MethodSpec,
        requests: impl Stream<Item = Req> + Send + 'static,
        options: CallOptions,
    ) -> Result<StreamingResponse<Res>, Status>
    where
        Req: prost::Message + Serialize,
        Res: prost::Message + DeserializeOwned + Default + Send + 'static,
    {
        if !spec.kind.client_streams() {
            return Err(Status::internal(format!(
                "{} is not a client-streaming method",
                spec.path()
            )));
        }
        let serializer = self.serializer;
        let requests: ByteStream = Box::pin(
            requests.map(move |message| serializer.serialize(&message).map_err(Status::from)),
        );
        self.streaming_call(spec, requests, options).await
    }

    async fn streaming_call<Res>(
        &self,
        spec: &MethodSpec,
        requests: ByteStream,
        options: CallOptions,
    ) -> Result<StreamingResponse<Res>, Status>
    where
        Res: prost::Message + DeserializeOwned + Default + Send + 'static,
    {
        let timeout = self.effective_timeout(&options);
        let compression = self.preferred_compression;
        let headers = self.request_headers(true, timeout, compression, &options.headers);
        let ctx = build_context(self.protocol, headers.clone(), timeout, options.signal.as_ref());

        let transport = self.transport.clone();
        let protocol = self.protocol;
        let path = spec.path();
        let terminal = move |request: CallRequest| -> BoxFuture<'static, Result<CallResponse, Status>> {
            let transport = transport.clone();
            let path = path.clone();
            Box::pin(async move {
                let requests = request.payload.expect_stream()?;
                let incoming = transport
                    .enveloped_streaming(
                        protocol,
                        &request.ctx,
                        &path,
                        request.headers,
                        requests,
                        compression,
                    )
                    .await?;
                Ok(CallResponse {
                    headers: incoming.headers,
                    payload: Payload::Stream(incoming.messages),
                    trailers: incoming.trailers,
                })
            })
        };

        let request = CallRequest {
            spec: spec.clone(),
            headers,
            payload: Payload::Stream(requests),
            ctx: Arc::clone(&ctx),
        };
        let response = run_streaming(request, &self.interceptors, &terminal).await?;

        let serializer = self.serializer;
        let messages = response.payload.expect_stream()?;
        let typed = messages
            .map(move |item| item.and_then(|bytes| serializer.parse::<Res>(&bytes).map_err(Status::from)));

        Ok(StreamingResponse {
            headers: response.headers,
            messages: Box::pin(typed),
            trailers: response.trailers,
            ctx,
            finished: false,
        })
    }
}

/// The response side of a streaming call. Ends with the canonical error if
/// the call failed; dropping it early cancels the underlying stream and
/// releases every timer attached to the call.
pub struct StreamingResponse<Res> {
    headers: HeaderMap,
    messages: BoxStream<'static, Result<Res, Status>>,
    trailers: crate::transport::TrailerSlot,
    ctx: Arc<CallContext>,
    finished: bool,
}

impl<Res> StreamingResponse<Res> {
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Trailer metadata; complete once the stream has ended.
    pub fn trailers(&self) -> HeaderMap {
        self.trailers.lock().clone()
    }

    /// Convenience wrapper over the `Stream` implementation.
    pub async fn next(&mut self) -> Option<Result<Res, Status>> {
        StreamExt::next(self).await
    }
}

impl<Res> Stream for StreamingResponse<Res> {
    type Item = Result<Res, Status>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.messages.poll_next_unpin(cx) {
            Poll::Ready(Some(Err(error))) => {
                self.finished = true;
                self.ctx.finish();
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(None) => {
                self.finished = true;
                self.ctx.finish();
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

impl<Res> Drop for StreamingResponse<Res> {
    fn drop(&mut self) {
        // Abandoning the stream early must still release the deadline
        // timer and cancel the in-flight h2 stream.
        self.ctx.finish();
    }
}
