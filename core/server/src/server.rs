// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! The hyper binding: accepts TCP connections, serves HTTP/1.1 and HTTP/2
//! automatically, lowers hyper requests into the universal pipeline and
//! lifts universal responses (including trailer frames) back out. Shutdown
//! drains in-flight connections up to a deadline, then aborts the
//! remaining call contexts.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use trirpc_config::Configuration;
use trirpc_config::server::ServerConfig;
use trirpc_protocol::{
    BodyChunk, ByteStream, MethodSpec, Status, UniversalRequest, UniversalResponse,
};

use crate::errors::ServerError;
use crate::handler::MethodHandler;
use crate::router::{RouteOptions, Router};
use crate::service::ServicePipeline;

type OutBody = UnsyncBoxBody<Bytes, Status>;

pub struct Server {
    config: ServerConfig,
    router: Router,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            router: Router::new(),
        }
    }

    /// Registers one method under the given version/group tags.
    pub fn register(&mut self, spec: MethodSpec, handler: MethodHandler, options: &RouteOptions) {
        self.router.register(spec, handler, options);
    }

    /// Registers a whole service.
    pub fn register_service(
        &mut self,
        methods: Vec<(MethodSpec, MethodHandler)>,
        options: &RouteOptions,
    ) {
        self.router.register_service(methods, options);
    }

    /// Binds the listener and spawns the accept loop. Returns a handle used
    /// to observe the bound address and to shut the server down.
    pub async fn serve(self) -> Result<RunningServer, ServerError> {
        self.config.validate()?;
        if self.router.is_empty() {
            warn!("serving with an empty router: every call will be unimplemented");
        }

        let listener = TcpListener::bind(&self.config.endpoint)
            .await
            .map_err(|e| ServerError::Bind {
                endpoint: self.config.endpoint.clone(),
                source: e,
            })?;
        let local_addr = listener.local_addr().map_err(|e| ServerError::Bind {
            endpoint: self.config.endpoint.clone(),
            source: e,
        })?;
        info!(%local_addr, "server listening");

        let drain_timeout = Duration::from(self.config.drain_timeout);
        let shutdown = CancellationToken::new();
        let accept_token = CancellationToken::new();
        let (signal, watch) = drain::channel();

        let pipeline = Arc::new(ServicePipeline::new(
            Arc::new(self.router),
            Arc::new(self.config),
            shutdown.clone(),
        ));

        let loop_token = accept_token.clone();
        tokio::spawn(async move {
            debug!("starting server accept loop");
            let drained = watch.clone().signaled();
            tokio::pin!(drained);
            loop {
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = drained.as_mut() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            spawn_connection(stream, peer, Arc::clone(&pipeline), watch.clone());
                        }
                        Err(e) => {
                            error!(error = %e, "accept failed");
                        }
                    }
                }
            }
            debug!("server accept loop finished");
        });

        Ok(RunningServer {
            local_addr,
            signal: Some(signal),
            shutdown,
            accept_token,
            drain_timeout,
        })
    }
}

/// Handle to a serving instance.
pub struct RunningServer {
    local_addr: SocketAddr,
    signal: Option<drain::Signal>,
    shutdown: CancellationToken,
    accept_token: CancellationToken,
    drain_timeout: Duration,
}

impl RunningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    /// Stops accepting, waits for in-flight calls up to the drain timeout,
    /// then aborts whatever is left through the shutdown signal.
    pub async fn shutdown(mut self) {
        self.accept_token.cancel();
        if let Some(signal) = self.signal.take() {
            let drained = signal.drain();
            if tokio::time::timeout(self.drain_timeout, drained).await.is_err() {
                warn!("drain timed out, aborting in-flight calls");
            }
        }
        self.shutdown.cancel();
    }

    /// Immediate teardown: aborts every in-flight call right away.
    pub fn abort(&self) {
        self.accept_token.cancel();
        self.shutdown.cancel();
    }
}

fn spawn_connection(
    stream: TcpStream,
    peer: SocketAddr,
    pipeline: Arc<ServicePipeline>,
    watch: drain::Watch,
) {
    tokio::spawn(async move {
        let io = TokioIo::new(stream);
        let service = service_fn(move |request: hyper::Request<Incoming>| {
            let pipeline = Arc::clone(&pipeline);
            async move {
                let response = pipeline.handle(lower_request(request)).await;
                Ok::<_, std::convert::Infallible>(raise_response(response))
            }
        });

        let builder = AutoBuilder::new(TokioExecutor::new());
        let connection = builder.serve_connection(io, service);
        tokio::pin!(connection);

        let drained = watch.clone().signaled();
        tokio::pin!(drained);

        let result = tokio::select! {
            result = connection.as_mut() => result,
            _ = drained.as_mut() => {
                connection.as_mut().graceful_shutdown();
                connection.as_mut().await
            }
        };
        if let Err(e) = result {
            debug!(error = %e, %peer, "connection closed with error");
        }
        drop(watch);
    });
}

/// Lowers a hyper request into the transport-agnostic shape.
fn lower_request(request: hyper::Request<Incoming>) -> UniversalRequest {
    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();
    let query = parts.uri.query().map(str::to_string);

    let body: ByteStream = Box::pin(
        futures::stream::unfold(body, |mut body| async move {
            match body.frame().await {
                Some(Ok(frame)) => match frame.into_data() {
                    Ok(data) => Some((Ok(data), body)),
                    // Inbound trailer frames carry nothing we consume.
                    Err(_frame) => Some((Ok(Bytes::new()), body)),
                },
                Some(Err(e)) => Some((
                    Err(Status::unavailable(format!("request body error: {}", e))),
                    body,
                )),
                None => None,
            }
        })
        .filter(|item| {
            futures::future::ready(match item {
                Ok(bytes) => !bytes.is_empty(),
                Err(_) => true,
            })
        }),
    );

    UniversalRequest {
        method: parts.method,
        path,
        query,
        headers: parts.headers,
        body,
    }
}

/// Lifts a universal response into a hyper response, mapping trailer chunks
/// onto HTTP trailer frames.
fn raise_response(response: UniversalResponse) -> hyper::Response<OutBody> {
    let frames = response.body.map(|item| {
        item.map(|chunk| match chunk {
            BodyChunk::Data(data) => Frame::data(data),
            BodyChunk::Trailers(trailers) => Frame::trailers(trailers),
        })
    });
    let body = BodyExt::boxed_unsync(StreamBody::new(frames));

    let mut http_response = match hyper::Response::builder()
        .status(response.status)
        .body(body)
    {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "failed to build response");
            let empty = BodyExt::boxed_unsync(StreamBody::new(futures::stream::empty()));
            let mut fallback = hyper::Response::new(empty);
            *fallback.status_mut() = http::StatusCode::INTERNAL_SERVER_ERROR;
            return fallback;
        }
    };
    http_response.headers_mut().extend(response.headers);
    http_response
}
