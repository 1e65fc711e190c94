// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Client interceptors compose like nested middleware: each one wraps the
//! `next` continuation, sees the outbound request on the way down (in
//! registration order) and the response or error on the way back up (in
//! reverse order). Interceptors work on serialized messages and headers, so
//! one chain serves every call shape.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use http::HeaderMap;
use parking_lot::Mutex;

use trirpc_protocol::{ByteStream, CallContext, MethodSpec, Status};

/// The message payload of a call, serialized but not yet framed.
pub enum Payload {
    Unary(Bytes),
    Stream(ByteStream),
}

impl Payload {
    pub fn expect_unary(self) -> Result<Bytes, Status> {
        match self {
            Payload::Unary(bytes) => Ok(bytes),
            Payload::Stream(_) => Err(Status::internal(
                "protocol error: expected a single message, got a stream",
            )),
        }
    }

    pub fn expect_stream(self) -> Result<ByteStream, Status> {
        match self {
            Payload::Stream(stream) => Ok(stream),
            Payload::Unary(_) => Err(Status::internal(
                "protocol error: expected a stream, got a single message",
            )),
        }
    }
}

impl std::fmt::Debug for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Payload::Unary(bytes) => f.debug_tuple("Unary").field(&bytes.len()).finish(),
            Payload::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Trailer metadata, filled in when the call reaches its terminal state.
pub type Trailers = Arc<Mutex<HeaderMap>>;

pub struct CallRequest {
    pub spec: MethodSpec,
    pub headers: HeaderMap,
    pub payload: Payload,
    pub ctx: Arc<CallContext>,
}

pub struct CallResponse {
    pub headers: HeaderMap,
    pub payload: Payload,
    pub trailers: Trailers,
}

impl std::fmt::Debug for CallRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallRequest")
            .field("spec", &self.spec)
            .field("payload", &self.payload)
            .finish()
    }
}

impl std::fmt::Debug for CallResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallResponse")
            .field("headers", &self.headers)
            .field("payload", &self.payload)
            .finish()
    }
}

/// The continuation an interceptor invokes to proceed with the call.
pub struct Next<'a> {
    interceptors: &'a [Arc<dyn Interceptor>],
    terminal: &'a (dyn Fn(CallRequest) -> BoxFuture<'static, Result<CallResponse, Status>>
             + Send
             + Sync),
}

impl<'a> Next<'a> {
    pub fn run(self, request: CallRequest) -> BoxFuture<'a, Result<CallResponse, Status>> {
        match self.interceptors.split_first() {
            Some((head, rest)) => {
                let next = Next {
                    interceptors: rest,
                    terminal: self.terminal,
                };
                head.intercept(request, next)
            }
            None => (self.terminal)(request),
        }
    }
}

#[async_trait]
pub trait Interceptor: Send + Sync {
    async fn intercept(
        &self,
        request: CallRequest,
        next: Next<'_>,
    ) -> Result<CallResponse, Status>;
}

/// Runs `request` through `interceptors` and then `terminal`.
pub async fn run_chain(
    interceptors: &[Arc<dyn Interceptor>],
    terminal: &(dyn Fn(CallRequest) -> BoxFuture<'static, Result<CallResponse, Status>>
          + Send
          + Sync),
    request: CallRequest,
) -> Result<CallResponse, Status> {
    Next {
        interceptors,
        terminal,
    }
    .run(request)
    .await
}

#[cfg(test)]
mod test {
    use super::*;
    use trirpc_protocol::{MethodKind, ProtocolKind};

    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Interceptor for Recorder {
        async fn intercept(
            &self,
            request: CallRequest,
            next: Next<'_>,
        ) -> Result<CallResponse, Status> {
            self.log.lock().push(format!("{}:before", self.label));
            let result = next.run(request).await;
            self.log.lock().push(format!("{}:after", self.label));
            result
        }
    }

    struct ShortCircuit;

    #[async_trait]
    impl Interceptor for ShortCircuit {
        async fn intercept(
            &self,
            _request: CallRequest,
            _next: Next<'_>,
        ) -> Result<CallResponse, Status> {
            Err(Status::unavailable("short-circuited"))
        }
    }

    fn request() -> CallRequest {
        CallRequest {
            spec: MethodSpec::new("test.Service", "Do", MethodKind::Unary),
            headers: HeaderMap::new(),
            payload: Payload::Unary(Bytes::new()),
            ctx: CallContext::new(ProtocolKind::Connect, HeaderMap::new()),
        }
    }

    fn terminal_ok(
        log: Arc<Mutex<Vec<String>>>,
    ) -> impl Fn(CallRequest) -> BoxFuture<'static, Result<CallResponse, Status>> + Send + Sync
    {
        move |request: CallRequest| {
            let log = Arc::clone(&log);
            Box::pin(async move {
                log.lock().push("terminal".to_string());
                Ok(CallResponse {
                    headers: HeaderMap::new(),
                    payload: request.payload,
                    trailers: Arc::new(Mutex::new(HeaderMap::new())),
                })
            })
        }
    }

    #[tokio::test]
    async fn test_interceptors_wrap_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let interceptors: Vec<Arc<dyn Interceptor>> = vec![
            Arc::new(Recorder {
                label: "outer",
                log: Arc::clone(&log),
            }),
            Arc::new(Recorder {
                label: "inner",
                log: Arc::clone(&log),
            }),
        ];
        let terminal = terminal_ok(Arc::clone(&log));

        run_chain(&interceptors, &terminal, request()).await.unwrap();

        assert_eq!(
            log.lock().clone(),
            vec![
                "outer:before",
                "inner:before",
                "terminal",
                "inner:after",
                "outer:after"
            ]
        );
    }

    #[tokio::test]
    async fn test_short_circuit_skips_terminal() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let interceptors: Vec<Arc<dyn Interceptor>> = vec![
            Arc::new(Recorder {
                label: "outer",
                log: Arc::clone(&log),
            }),
            Arc::new(ShortCircuit),
        ];
        let terminal = terminal_ok(Arc::clone(&log));

        let err = run_chain(&interceptors, &terminal, request())
            .await
            .unwrap_err();
        assert_eq!(err.message, "short-circuited");
        assert_eq!(log.lock().clone(), vec!["outer:before", "outer:after"]);
    }
}
