// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! The seam between the session lifecycle manager and the wire. The manager
//! only ever talks to these traits; the real `h2` implementation lives in
//! [`crate::h2session`], and the tests drive the state machine through
//! mocks.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use trirpc_protocol::Status;

use crate::errors::TransportError;

/// Why a GOAWAY was received, as far as the manager cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoAwayKind {
    /// ENHANCE_YOUR_CALM with the "too many pings" semantics: the peer is
    /// penalizing our keep-alive cadence.
    TooManyPings,
    /// FRAME_SIZE_ERROR.
    FrameSize,
    /// NO_ERROR: graceful retirement.
    NoError,
    /// CANCEL.
    Cancel,
    /// Any other reason code.
    Other,
}

/// Terminal report of a session, delivered exactly once by its driver.
#[derive(Debug, Clone)]
pub enum SessionClose {
    GoAway { kind: GoAwayKind, message: String },
    Fatal(String),
    Closed,
}

impl SessionClose {
    /// The status used to abort every call still multiplexed on the
    /// session, attributable to the specific cause.
    pub fn to_status(&self) -> Status {
        match self {
            SessionClose::GoAway { kind, message } => match kind {
                GoAwayKind::TooManyPings => Status::resource_exhausted(message.clone()),
                GoAwayKind::FrameSize => Status::internal(message.clone()),
                GoAwayKind::NoError | GoAwayKind::Cancel => Status::canceled(message.clone()),
                GoAwayKind::Other => Status::unavailable(message.clone()),
            },
            SessionClose::Fatal(message) => Status::unavailable(message.clone()),
            SessionClose::Closed => Status::canceled("connection closed"),
        }
    }
}

/// One established transport session (an HTTP/2 connection). The handle is
/// owned exclusively by the manager; callers reach it only through leases.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    /// Stable identity of the underlying handle, for reuse verification.
    fn id(&self) -> u64;

    /// Sends a liveness probe and resolves once the peer acknowledges it.
    async fn ping(&self) -> Result<(), TransportError>;

    /// Time since the peer last sent us bytes on any stream.
    fn idle_time(&self) -> Duration;

    /// Resolves when the session terminates, reporting the cause.
    async fn closed(&self) -> SessionClose;

    /// Tears the session down, aborting every multiplexed stream.
    fn shutdown(&self);
}

/// Creates sessions for one remote authority.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Session: Session;

    async fn dial(&self) -> Result<Arc<Self::Session>, TransportError>;
}
