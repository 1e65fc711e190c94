// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Per-invocation call context: the composed cancellation signal plus the
//! mutable header state a handler may touch.
//!
//! The signal is the conjunction of three sources (caller cancellation,
//! deadline, shutdown): whichever fires first irreversibly aborts the
//! context and records its reason. Completion force-aborts the signal
//! without a reason so that every linked timer and listener is released.

use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use trirpc_codec::Compression;

use crate::method::ProtocolKind;
use crate::status::Status;

pub struct CallContext {
    protocol: ProtocolKind,
    token: CancellationToken,
    reason: Mutex<Option<Status>>,
    deadline: Mutex<Option<Instant>>,
    timeout: Mutex<Option<Duration>>,

    request_headers: HeaderMap,
    response_headers: Mutex<HeaderMap>,
    response_trailers: Mutex<HeaderMap>,

    request_compression: Option<Compression>,
    response_compression: Option<Compression>,

    service_version: Option<String>,
    service_group: Option<String>,
}

impl CallContext {
    pub fn new(protocol: ProtocolKind, request_headers: HeaderMap) -> Arc<Self> {
        Arc::new(Self {
            protocol,
            token: CancellationToken::new(),
            reason: Mutex::new(None),
            deadline: Mutex::new(None),
            timeout: Mutex::new(None),
            request_headers,
            response_headers: Mutex::new(HeaderMap::new()),
            response_trailers: Mutex::new(HeaderMap::new()),
            request_compression: None,
            response_compression: None,
            service_version: None,
            service_group: None,
        })
    }

    /// Builder used by the adapters while negotiating a request.
    pub fn builder(protocol: ProtocolKind) -> CallContextBuilder {
        CallContextBuilder {
            protocol,
            request_headers: HeaderMap::new(),
            request_compression: None,
            response_compression: None,
            service_version: None,
            service_group: None,
        }
    }

    pub fn protocol(&self) -> ProtocolKind {
        self.protocol
    }

    pub fn request_headers(&self) -> &HeaderMap {
        &self.request_headers
    }

    pub fn request_compression(&self) -> Option<Compression> {
        self.request_compression
    }

    pub fn response_compression(&self) -> Option<Compression> {
        self.response_compression
    }

    pub fn service_version(&self) -> Option<&str> {
        self.service_version.as_deref()
    }

    pub fn service_group(&self) -> Option<&str> {
        self.service_group.as_deref()
    }

    pub fn timeout(&self) -> Option<Duration> {
        *self.timeout.lock()
    }

    /// Remaining budget until the deadline, if one is armed.
    pub fn time_remaining(&self) -> Option<Duration> {
        let deadline = *self.deadline.lock();
        deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Mutates the headers sent ahead of the first response message.
    pub fn with_response_headers<R>(&self, f: impl FnOnce(&mut HeaderMap) -> R) -> R {
        f(&mut self.response_headers.lock())
    }

    pub fn response_headers(&self) -> HeaderMap {
        self.response_headers.lock().clone()
    }

    /// Mutates the trailer metadata sent after the final message.
    pub fn with_response_trailers<R>(&self, f: impl FnOnce(&mut HeaderMap) -> R) -> R {
        f(&mut self.response_trailers.lock())
    }

    pub fn response_trailers(&self) -> HeaderMap {
        self.response_trailers.lock().clone()
    }

    /// The composed cancellation token. Handlers are expected to observe it
    /// promptly; nothing may block unboundedly past a checked point.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The reason recorded by the first abort, if any. A cancelled token
    /// with no reason means normal completion released the signal.
    pub fn abort_reason(&self) -> Option<Status> {
        self.reason.lock().clone()
    }

    /// Aborts the context. Only the first reason is recorded; later calls
    /// are no-ops beyond the (idempotent) token cancellation.
    pub fn abort(&self, reason: Status) {
        {
            let mut slot = self.reason.lock();
            if slot.is_none() {
                trace!(reason = %reason, "call context aborted");
                *slot = Some(reason);
            }
        }
        self.token.cancel();
    }

    /// Force-releases the signal once the call has produced its terminal
    /// response, so deadline timers and linked listeners are dropped.
    pub fn finish(&self) {
        self.token.cancel();
    }

    /// Arms the deadline. The timer task exits as soon as the context is
    /// aborted or finished, so timers never outlive the call.
    pub fn set_timeout(self: &Arc<Self>, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        *self.timeout.lock() = Some(timeout);
        *self.deadline.lock() = Some(deadline);

        let ctx = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    ctx.abort(Status::deadline_exceeded(format!(
                        "the operation timed out after {}ms",
                        timeout.as_millis()
                    )));
                }
                _ = ctx.token.cancelled() => {}
            }
        });
    }

    /// Links an external cancellation source (caller signal, server
    /// shutdown) into this context.
    pub fn link_signal(self: &Arc<Self>, signal: CancellationToken, reason: Status) {
        let ctx = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = signal.cancelled() => ctx.abort(reason),
                _ = ctx.token.cancelled() => {}
            }
        });
    }
}

impl std::fmt::Debug for CallContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallContext")
            .field("protocol", &self.protocol)
            .field("aborted", &self.token.is_cancelled())
            .field("timeout", &*self.timeout.lock())
            .finish()
    }
}

pub struct CallContextBuilder {
    protocol: ProtocolKind,
    request_headers: HeaderMap,
    request_compression: Option<Compression>,
    response_compression: Option<Compression>,
    service_version: Option<String>,
    service_group: Option<String>,
}

impl CallContextBuilder {
    pub fn request_headers(mut self, headers: HeaderMap) -> Self {
        self.request_headers = headers;
        self
    }

    pub fn request_compression(mut self, compression: Option<Compression>) -> Self {
        self.request_compression = compression;
        self
    }

    pub fn response_compression(mut self, compression: Option<Compression>) -> Self {
        self.response_compression = compression;
        self
    }

    pub fn service_version(mut self, version: Option<String>) -> Self {
        self.service_version = version;
        self
    }

    pub fn service_group(mut self, group: Option<String>) -> Self {
        self.service_group = group;
        self
    }

    pub fn build(self) -> Arc<CallContext> {
        Arc::new(CallContext {
            protocol: self.protocol,
            token: CancellationToken::new(),
            reason: Mutex::new(None),
            deadline: Mutex::new(None),
            timeout: Mutex::new(None),
            request_headers: self.request_headers,
            response_headers: Mutex::new(HeaderMap::new()),
            response_trailers: Mutex::new(HeaderMap::new()),
            request_compression: self.request_compression,
            response_compression: self.response_compression,
            service_version: self.service_version,
            service_group: self.service_group,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::status::Code;

    #[tokio::test]
    async fn test_first_abort_reason_wins() {
        let ctx = CallContext::new(ProtocolKind::Connect, HeaderMap::new());
        ctx.abort(Status::canceled("first"));
        ctx.abort(Status::internal("second"));

        let reason = ctx.abort_reason().unwrap();
        assert_eq!(reason.code, Code::Canceled);
        assert_eq!(reason.message, "first");
        assert!(ctx.is_aborted());
    }

    #[tokio::test]
    async fn test_finish_releases_without_reason() {
        let ctx = CallContext::new(ProtocolKind::Grpc, HeaderMap::new());
        ctx.finish();
        assert!(ctx.is_aborted());
        assert!(ctx.abort_reason().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fires() {
        let ctx = CallContext::new(ProtocolKind::Grpc, HeaderMap::new());
        ctx.set_timeout(Duration::from_millis(50));

        ctx.token().cancelled().await;
        let reason = ctx.abort_reason().unwrap();
        assert_eq!(reason.code, Code::DeadlineExceeded);
        assert!(reason.message.contains("50ms"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_finish_disarms_deadline() {
        let ctx = CallContext::new(ProtocolKind::Grpc, HeaderMap::new());
        ctx.set_timeout(Duration::from_secs(60));
        ctx.finish();

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(ctx.abort_reason().is_none());
    }

    #[tokio::test]
    async fn test_linked_signal_aborts_with_reason() {
        let ctx = CallContext::new(ProtocolKind::Connect, HeaderMap::new());
        let signal = CancellationToken::new();
        ctx.link_signal(signal.clone(), Status::canceled("This operation was aborted"));

        signal.cancel();
        ctx.token().cancelled().await;
        let reason = ctx.abort_reason().unwrap();
        assert_eq!(reason.to_string(), "[canceled] This operation was aborted");
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_remaining_counts_down() {
        let ctx = CallContext::new(ProtocolKind::Grpc, HeaderMap::new());
        assert!(ctx.time_remaining().is_none());

        ctx.set_timeout(Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(4)).await;
        let remaining = ctx.time_remaining().unwrap();
        assert!(remaining <= Duration::from_secs(6));
        ctx.finish();
    }
}
