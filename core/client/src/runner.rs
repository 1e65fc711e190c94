// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! The invocation runner wraps a single call with the interceptor chain,
//! composes the cancellation signal (caller signal ∧ deadline ∧ completion)
//! and normalizes every failure into the canonical status shape before it
//! reaches the caller.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use http::HeaderMap;
use tokio_util::sync::CancellationToken;

use trirpc_protocol::{CallContext, ProtocolKind, Status};

use crate::interceptor::{CallRequest, CallResponse, Interceptor, run_chain};

/// Per-call options supplied by the caller.
#[derive(Default)]
pub struct CallOptions {
    /// Deadline for the whole call. `None` falls back to the client's
    /// configured request timeout.
    pub timeout: Option<Duration>,
    /// Caller-owned cancellation signal.
    pub signal: Option<CancellationToken>,
    /// Extra request headers.
    pub headers: HeaderMap,
}

impl CallOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }
}

/// Builds the call context for one invocation, arming the deadline and
/// linking the caller's signal. The caller's own cancellation surfaces as
/// `[canceled] This operation was aborted`.
pub fn build_context(
    protocol: ProtocolKind,
    request_headers: HeaderMap,
    timeout: Option<Duration>,
    signal: Option<&CancellationToken>,
) -> Arc<CallContext> {
    let ctx = CallContext::new(protocol, request_headers);
    if let Some(timeout) = timeout {
        ctx.set_timeout(timeout);
    }
    if let Some(signal) = signal {
        ctx.link_signal(
            signal.clone(),
            Status::canceled("This operation was aborted"),
        );
    }
    ctx
}

/// Runs a unary call through the interceptor chain. The context signal is
/// force-released once the call finishes, successfully or not, so deadline
/// timers and linked listeners never outlive the call.
pub async fn run_unary(
    request: CallRequest,
    interceptors: &[Arc<dyn Interceptor>],
    terminal: &(dyn Fn(CallRequest) -> BoxFuture<'static, Result<CallResponse, Status>>
          + Send
          + Sync),
) -> Result<CallResponse, Status> {
    let ctx = Arc::clone(&request.ctx);
    let result = run_chain(interceptors, terminal, request).await;
    ctx.finish();
    result
}

/// Runs a streaming call through the interceptor chain. The context is NOT
/// released here: it stays armed until the response stream reaches its
/// terminal state (or is dropped), which is the streaming notion of "call
/// finished".
pub async fn run_streaming(
    request: CallRequest,
    interceptors: &[Arc<dyn Interceptor>],
    terminal: &(dyn Fn(CallRequest) -> BoxFuture<'static, Result<CallResponse, Status>>
          + Send
          + Sync),
) -> Result<CallResponse, Status> {
    let ctx = Arc::clone(&request.ctx);
    match run_chain(interceptors, terminal, request).await {
        Ok(response) => Ok(response),
        Err(error) => {
            ctx.finish();
            Err(error)
        }
    }
}
