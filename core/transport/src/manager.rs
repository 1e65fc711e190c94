// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! The session lifecycle state machine:
//!
//! ```text
//! closed -> connecting -> idle <-> open <-> verifying -> error
//! ```
//!
//! One manager owns at most one underlying session at a time. Requests
//! arriving while a connect attempt is in flight queue on that attempt; a
//! request against a session idle for longer than the ping interval
//! verifies it with a PING first and transparently replaces it on failure.
//! Keep-alive pings run while streams are open (unless the session received
//! bytes within the interval, which resets the clock); a missed ack is
//! fatal. A GOAWAY with ENHANCE_YOUR_CALM doubles the ping interval used by
//! the next session, compounding up to a configured cap.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use trirpc_config::connection::ConnectionConfig;
use trirpc_protocol::Status;

use crate::session::{Dialer, GoAwayKind, Session, SessionClose};

/// Publicly observable state of a manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    Connecting,
    Idle,
    Open,
    Verifying,
    Error,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Closed => "closed",
            SessionState::Connecting => "connecting",
            SessionState::Idle => "idle",
            SessionState::Open => "open",
            SessionState::Verifying => "verifying",
            SessionState::Error => "error",
        }
    }
}

/// Runtime options derived from [`ConnectionConfig`].
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub ping_idle_connection: bool,
    pub backoff_cap: u32,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        (&ConnectionConfig::default()).into()
    }
}

impl From<&ConnectionConfig> for ManagerOptions {
    fn from(config: &ConnectionConfig) -> Self {
        ManagerOptions {
            ping_interval: config.ping_interval.into(),
            ping_timeout: config.ping_timeout.into(),
            idle_timeout: config.idle_timeout.map(Into::into),
            ping_idle_connection: config.ping_idle_connection,
            backoff_cap: config.ping_interval_backoff_cap.max(1),
        }
    }
}

type ConnectSignal = Option<Result<(), Status>>;

struct Cell<S> {
    state: SessionState,
    session: Option<Arc<S>>,
    active_streams: usize,
    last_used: Instant,
    /// Effective interval for the current and next session, after
    /// GOAWAY-driven doublings.
    ping_interval: Duration,
    doublings: u32,
    cause: Option<Status>,
    connect_tx: Option<watch::Sender<ConnectSignal>>,
    connect_rx: Option<watch::Receiver<ConnectSignal>>,
    /// Bumped whenever the underlying handle is installed or released, so
    /// stale timers and settlements are discarded.
    epoch: u64,
    /// Cancels the keep-alive, monitor and idle tasks of the current
    /// session. Always fired before the handle is released.
    tasks: Option<CancellationToken>,
}

impl<S: Session> Cell<S> {
    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            trace!(from = self.state.as_str(), to = next.as_str(), "session state transition");
            self.state = next;
        }
    }

    /// Releases the handle and every task tied to it. The handle is shut
    /// down before the state moves on, so at most one exists at a time.
    fn release_session(&mut self) {
        if let Some(tasks) = self.tasks.take() {
            tasks.cancel();
        }
        if let Some(session) = self.session.take() {
            session.shutdown();
        }
        self.active_streams = 0;
        self.epoch += 1;
    }

    fn notify_connect(&mut self, result: Result<(), Status>) {
        if let Some(tx) = self.connect_tx.take() {
            let _ = tx.send(Some(result));
        }
        self.connect_rx = None;
    }
}

struct Inner<D: Dialer> {
    dialer: D,
    options: ManagerOptions,
    cell: Mutex<Cell<D::Session>>,
}

/// Owns the lifecycle of one shared session towards one remote authority.
pub struct SessionManager<D: Dialer> {
    inner: Arc<Inner<D>>,
}

impl<D: Dialer> Clone for SessionManager<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// A checked-out session handle. Holding a lease keeps the session `open`;
/// dropping the last lease returns it to `idle` and arms the idle timer.
pub struct Lease<D: Dialer> {
    session: Arc<D::Session>,
    epoch: u64,
    inner: std::sync::Weak<Inner<D>>,
}

impl<D: Dialer> Lease<D> {
    pub fn session(&self) -> &D::Session {
        &self.session
    }

    /// Identity of the underlying handle, for reuse assertions.
    pub fn session_id(&self) -> u64 {
        self.session.id()
    }
}

impl<D: Dialer> std::fmt::Debug for Lease<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("session_id", &self.session.id())
            .field("epoch", &self.epoch)
            .finish()
    }
}

impl<D: Dialer> std::ops::Deref for Lease<D> {
    type Target = D::Session;

    fn deref(&self) -> &Self::Target {
        &self.session
    }
}

impl<D: Dialer> Drop for Lease<D> {
    fn drop(&mut self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut cell = inner.cell.lock();
        if cell.epoch != self.epoch {
            return;
        }
        cell.active_streams = cell.active_streams.saturating_sub(1);
        if cell.active_streams == 0 && cell.state == SessionState::Open {
            cell.last_used = Instant::now();
            cell.transition(SessionState::Idle);
        }
    }
}

enum Action<S> {
    Lease(Arc<S>, u64),
    Connect(u64),
    Verify(Arc<S>, u64),
    Wait(watch::Receiver<ConnectSignal>),
    Fail(Status),
}

impl<D: Dialer> SessionManager<D> {
    pub fn new(dialer: D, options: ManagerOptions) -> Self {
        let ping_interval = options.ping_interval;
        Self {
            inner: Arc::new(Inner {
                dialer,
                options: ManagerOptions {
                    backoff_cap: options.backoff_cap.max(1),
                    ..options
                },
                cell: Mutex::new(Cell {
                    state: SessionState::Closed,
                    session: None,
                    active_streams: 0,
                    last_used: Instant::now(),
                    ping_interval,
                    doublings: 0,
                    cause: None,
                    connect_tx: None,
                    connect_rx: None,
                    epoch: 0,
                    tasks: None,
                }),
            }),
        }
    }

    pub fn with_config(dialer: D, config: &ConnectionConfig) -> Self {
        Self::new(dialer, config.into())
    }

    pub fn state(&self) -> SessionState {
        self.inner.cell.lock().state
    }

    /// The ping interval that will be applied to the next session, after
    /// any GOAWAY-driven doubling.
    pub fn current_ping_interval(&self) -> Duration {
        self.inner.cell.lock().ping_interval
    }

    /// Checks out the shared session, connecting or verifying it first as
    /// the state machine requires. Concurrent callers during `connecting`
    /// or `verifying` queue on the in-flight attempt.
    pub async fn acquire(&self) -> Result<Lease<D>, Status> {
        loop {
            let action = self.next_action();
            match action {
                Action::Lease(session, epoch) => {
                    return Ok(Lease {
                        session,
                        epoch,
                        inner: Arc::downgrade(&self.inner),
                    });
                }
                Action::Fail(status) => return Err(status),
                Action::Wait(mut rx) => {
                    loop {
                        let settled = rx.borrow_and_update().clone();
                        match settled {
                            Some(Ok(())) => break,
                            Some(Err(status)) => return Err(status),
                            None => {
                                if rx.changed().await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
                Action::Connect(epoch) => {
                    let result = self.dial().await;
                    self.settle_connect(epoch, result)?;
                }
                Action::Verify(session, epoch) => {
                    self.verify(session, epoch).await?;
                }
            }
        }
    }

    fn next_action(&self) -> Action<D::Session> {
        let mut cell = self.inner.cell.lock();
        match cell.state {
            SessionState::Error => Action::Fail(
                cell.cause
                    .clone()
                    .unwrap_or_else(|| Status::unavailable("connection is in the error state")),
            ),
            SessionState::Connecting | SessionState::Verifying => {
                match cell.connect_rx.clone() {
                    Some(rx) => Action::Wait(rx),
                    // Settlement raced us; re-evaluate.
                    None => Action::Wait(watch::channel(Some(Ok(()))).1),
                }
            }
            SessionState::Closed => {
                let (tx, rx) = watch::channel(None);
                cell.connect_tx = Some(tx);
                cell.connect_rx = Some(rx);
                cell.transition(SessionState::Connecting);
                Action::Connect(cell.epoch)
            }
            SessionState::Open => {
                let session = cell.session.clone().expect("open state without session");
                cell.active_streams += 1;
                cell.last_used = Instant::now();
                Action::Lease(session, cell.epoch)
            }
            SessionState::Idle => {
                let session = cell.session.clone().expect("idle state without session");
                if cell.last_used.elapsed() < cell.ping_interval {
                    cell.transition(SessionState::Open);
                    cell.active_streams += 1;
                    cell.last_used = Instant::now();
                    Action::Lease(session, cell.epoch)
                } else {
                    let (tx, rx) = watch::channel(None);
                    cell.connect_tx = Some(tx);
                    cell.connect_rx = Some(rx);
                    cell.transition(SessionState::Verifying);
                    Action::Verify(session, cell.epoch)
                }
            }
        }
    }

    /// Connects explicitly. This is the only way out of the `error` state
    /// short of a full `abort()`.
    pub async fn connect(&self) -> Result<(), Status> {
        let epoch = {
            let mut cell = self.inner.cell.lock();
            match cell.state {
                SessionState::Error | SessionState::Closed => {
                    cell.release_session();
                    cell.cause = None;
                    let (tx, rx) = watch::channel(None);
                    cell.connect_tx = Some(tx);
                    cell.connect_rx = Some(rx);
                    cell.transition(SessionState::Connecting);
                    cell.epoch
                }
                _ => return Ok(()),
            }
        };
        let result = self.dial().await;
        self.settle_connect(epoch, result)
    }

    /// Destroys the session and rejects everything pending. `abort()` with
    /// no reason ends in `closed`; `abort_with(reason)` persists the reason
    /// as the terminal cause in `error`. Idempotent on a closed manager.
    pub fn abort(&self) {
        self.abort_inner(None);
    }

    pub fn abort_with(&self, reason: Status) {
        self.abort_inner(Some(reason));
    }

    fn abort_inner(&self, reason: Option<Status>) {
        let mut cell = self.inner.cell.lock();
        let reject = reason
            .clone()
            .unwrap_or_else(|| Status::canceled("connection aborted"));
        cell.notify_connect(Err(reject));
        cell.release_session();
        match reason {
            Some(cause) => {
                debug!(%cause, "session aborted with cause");
                cell.cause = Some(cause);
                cell.transition(SessionState::Error);
            }
            None => {
                cell.cause = None;
                cell.transition(SessionState::Closed);
            }
        }
    }

    async fn dial(&self) -> Result<Arc<D::Session>, Status> {
        debug!("opening new session");
        self.inner.dialer.dial().await.map_err(|e| {
            let status: Status = e.into();
            status
        })
    }

    fn settle_connect(&self, epoch: u64, result: Result<Arc<D::Session>, Status>) -> Result<(), Status> {
        let mut cell = self.inner.cell.lock();
        if cell.epoch != epoch {
            // Aborted or replaced while the dial was in flight; the fresh
            // handle (if any) must not leak.
            if let Ok(session) = result {
                session.shutdown();
            }
            return Err(cell
                .cause
                .clone()
                .unwrap_or_else(|| Status::canceled("connection aborted")));
        }

        match result {
            Ok(session) => {
                self.install(&mut cell, session);
                cell.notify_connect(Ok(()));
                Ok(())
            }
            Err(status) => {
                warn!(error = %status, "connect attempt failed");
                cell.release_session();
                cell.cause = Some(status.clone());
                cell.transition(SessionState::Error);
                cell.notify_connect(Err(status.clone()));
                Err(status)
            }
        }
    }

    async fn verify(&self, session: Arc<D::Session>, epoch: u64) -> Result<(), Status> {
        let ping_timeout = self.inner.options.ping_timeout;

        let verified = matches!(
            tokio::time::timeout(ping_timeout, session.ping()).await,
            Ok(Ok(()))
        );

        if verified {
            trace!("idle session verified by PING");
            let mut cell = self.inner.cell.lock();
            if cell.epoch == epoch {
                cell.last_used = Instant::now();
                cell.transition(SessionState::Idle);
                cell.notify_connect(Ok(()));
            }
            return Ok(());
        }

        debug!("idle session failed verification, reconnecting");
        let connect_epoch = {
            let mut cell = self.inner.cell.lock();
            if cell.epoch != epoch {
                return Err(cell
                    .cause
                    .clone()
                    .unwrap_or_else(|| Status::canceled("connection aborted")));
            }
            cell.release_session();
            cell.transition(SessionState::Connecting);
            cell.epoch
        };

        let result = self.dial().await;
        self.settle_connect(connect_epoch, result)
    }

    /// Installs a fresh handle: state becomes `idle`, and the keep-alive,
    /// close-monitor and idle-timeout tasks for this handle are spawned.
    fn install(&self, cell: &mut Cell<D::Session>, session: Arc<D::Session>) {
        cell.release_session();
        let epoch = cell.epoch;
        let tasks = CancellationToken::new();
        cell.session = Some(Arc::clone(&session));
        cell.tasks = Some(tasks.clone());
        cell.last_used = Instant::now();
        cell.cause = None;
        cell.transition(SessionState::Idle);

        debug!(session_id = session.id(), interval_ms = cell.ping_interval.as_millis() as u64, "session established");

        self.spawn_keepalive(Arc::clone(&session), epoch, cell.ping_interval, tasks.clone());
        self.spawn_monitor(Arc::clone(&session), epoch, tasks.clone());
        if let Some(idle_timeout) = self.inner.options.idle_timeout {
            self.spawn_idle_reaper(epoch, idle_timeout, tasks);
        }
    }

    /// Keep-alive loop: pings on a fixed interval while streams are open
    /// (or always, with `ping_idle_connection`). Bytes received within the
    /// interval reset the clock, so an actively receiving session is never
    /// probed redundantly. A missed ack is a fatal connection error.
    fn spawn_keepalive(
        &self,
        session: Arc<D::Session>,
        epoch: u64,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        let inner = Arc::clone(&self.inner);
        let ping_timeout = inner.options.ping_timeout;
        let ping_idle = inner.options.ping_idle_connection;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }

                let eligible = {
                    let cell = inner.cell.lock();
                    if cell.epoch != epoch {
                        return;
                    }
                    match cell.state {
                        SessionState::Open => true,
                        SessionState::Idle => ping_idle,
                        // Verification owns the probe in other states.
                        _ => false,
                    }
                };
                if !eligible {
                    continue;
                }

                // Receiving bytes resets the idle-ping clock.
                if session.idle_time() < interval {
                    continue;
                }

                let acked = matches!(
                    tokio::time::timeout(ping_timeout, session.ping()).await,
                    Ok(Ok(()))
                );
                if !acked {
                    warn!(session_id = session.id(), "keep-alive PING timed out");
                    let mut cell = inner.cell.lock();
                    if cell.epoch != epoch {
                        return;
                    }
                    let cause = Status::unavailable("PING timed out");
                    cell.notify_connect(Err(cause.clone()));
                    cell.release_session();
                    cell.cause = Some(cause);
                    cell.transition(SessionState::Error);
                    return;
                }
            }
        });
    }

    /// Waits for the session driver to report termination and folds the
    /// cause into the state machine. ENHANCE_YOUR_CALM doubles the ping
    /// interval used by the next session, compounding up to the cap.
    fn spawn_monitor(&self, session: Arc<D::Session>, epoch: u64, cancel: CancellationToken) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let close = tokio::select! {
                _ = cancel.cancelled() => return,
                close = session.closed() => close,
            };

            let mut cell = inner.cell.lock();
            if cell.epoch != epoch {
                return;
            }

            match &close {
                SessionClose::GoAway {
                    kind: GoAwayKind::TooManyPings,
                    ..
                } => {
                    let base = inner.options.ping_interval;
                    let cap = inner.options.backoff_cap;
                    cell.doublings += 1;
                    let multiplier = 1u32
                        .checked_shl(cell.doublings)
                        .unwrap_or(u32::MAX)
                        .min(cap);
                    cell.ping_interval = base.saturating_mul(multiplier);
                    let cause = Status::resource_exhausted(format!(
                        "HTTP/2 GOAWAY (too many pings): doubled the interval to {}ms for the next connection",
                        cell.ping_interval.as_millis()
                    ));
                    warn!(interval_ms = cell.ping_interval.as_millis() as u64, "GOAWAY backoff applied");
                    cell.notify_connect(Err(cause.clone()));
                    cell.release_session();
                    cell.cause = Some(cause);
                    cell.transition(SessionState::Error);
                }
                SessionClose::GoAway {
                    kind: GoAwayKind::NoError | GoAwayKind::Cancel,
                    ..
                }
                | SessionClose::Closed => {
                    debug!("session retired gracefully");
                    cell.notify_connect(Err(close.to_status()));
                    cell.release_session();
                    cell.cause = None;
                    cell.transition(SessionState::Closed);
                }
                _ => {
                    let cause = close.to_status();
                    warn!(error = %cause, "session terminated");
                    cell.notify_connect(Err(cause.clone()));
                    cell.release_session();
                    cell.cause = Some(cause);
                    cell.transition(SessionState::Error);
                }
            }
        });
    }

    /// Proactively closes a session that stays idle past the configured
    /// timeout.
    fn spawn_idle_reaper(&self, epoch: u64, idle_timeout: Duration, cancel: CancellationToken) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            loop {
                let wait = {
                    let cell = inner.cell.lock();
                    if cell.epoch != epoch {
                        return;
                    }
                    if cell.state == SessionState::Idle && cell.active_streams == 0 {
                        idle_timeout.saturating_sub(cell.last_used.elapsed())
                    } else {
                        idle_timeout
                    }
                };

                if !wait.is_zero() {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(wait) => {}
                    }
                }

                let mut cell = inner.cell.lock();
                if cell.epoch != epoch {
                    return;
                }
                if cell.state == SessionState::Idle
                    && cell.active_streams == 0
                    && cell.last_used.elapsed() >= idle_timeout
                {
                    debug!("closing idle session after timeout");
                    cell.release_session();
                    cell.cause = None;
                    cell.transition(SessionState::Closed);
                    return;
                }
            }
        });
    }
}
