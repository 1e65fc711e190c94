// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! The real HTTP/2 session over the `h2` crate: handshake, a driver task
//! that pumps the connection and classifies its terminal error, a PING
//! handle for liveness probes, and stream multiplexing for callers.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use h2::client::{ResponseFuture, SendRequest};
use http::Request;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use trirpc_config::backoff::{BackoffConfig, Strategy};
use trirpc_config::connection::ConnectionConfig;
use trirpc_protocol::Status;

use crate::errors::{TransportError, h2_error_to_status};
use crate::session::{Dialer, GoAwayKind, Session, SessionClose};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
pub struct H2Session {
    id: u64,
    send_request: Mutex<SendRequest<Bytes>>,
    ping_pong: tokio::sync::Mutex<h2::PingPong>,
    last_received: Mutex<Instant>,
    closed_rx: watch::Receiver<Option<SessionClose>>,
    shutdown: CancellationToken,
}

impl H2Session {
    /// Performs the HTTP/2 handshake over an established byte stream and
    /// spawns the connection driver.
    pub async fn start<T>(io: T) -> Result<Arc<H2Session>, TransportError>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (send_request, mut connection) = h2::client::handshake(io)
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        let ping_pong = connection
            .ping_pong()
            .ok_or_else(|| TransportError::Handshake("PING handle unavailable".to_string()))?;

        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        let shutdown = CancellationToken::new();
        let (closed_tx, closed_rx) = watch::channel(None);

        let driver_shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::pin!(connection);
            let close = tokio::select! {
                _ = driver_shutdown.cancelled() => SessionClose::Closed,
                result = connection.as_mut() => match result {
                    Ok(()) => SessionClose::Closed,
                    Err(e) => classify_connection_error(&e),
                },
            };
            debug!(session_id = id, close = ?close, "session driver finished");
            let _ = closed_tx.send(Some(close));
        });

        Ok(Arc::new(H2Session {
            id,
            send_request: Mutex::new(send_request),
            ping_pong: tokio::sync::Mutex::new(ping_pong),
            last_received: Mutex::new(Instant::now()),
            closed_rx,
            shutdown,
        }))
    }

    /// Opens one multiplexed stream. The returned pair is the response
    /// future and the request body writer.
    pub async fn open_stream(
        &self,
        request: Request<()>,
        end_of_stream: bool,
    ) -> Result<(ResponseFuture, h2::SendStream<Bytes>), Status> {
        let send_request = self.send_request.lock().clone();
        let mut ready = send_request
            .ready()
            .await
            .map_err(|e| h2_error_to_status(&e))?;
        ready
            .send_request(request, end_of_stream)
            .map_err(|e| h2_error_to_status(&e))
    }

    /// Called by stream readers whenever response bytes arrive, resetting
    /// the keep-alive idle clock.
    pub fn record_activity(&self) {
        *self.last_received.lock() = Instant::now();
    }
}

fn classify_connection_error(error: &h2::Error) -> SessionClose {
    if error.is_go_away() {
        let kind = match error.reason() {
            Some(h2::Reason::ENHANCE_YOUR_CALM) => GoAwayKind::TooManyPings,
            Some(h2::Reason::FRAME_SIZE_ERROR) => GoAwayKind::FrameSize,
            Some(h2::Reason::NO_ERROR) => GoAwayKind::NoError,
            Some(h2::Reason::CANCEL) => GoAwayKind::Cancel,
            _ => GoAwayKind::Other,
        };
        return SessionClose::GoAway {
            kind,
            message: error.to_string(),
        };
    }
    SessionClose::Fatal(error.to_string())
}

#[async_trait]
impl Session for H2Session {
    fn id(&self) -> u64 {
        self.id
    }

    async fn ping(&self) -> Result<(), TransportError> {
        self.ping_pong
            .lock()
            .await
            .ping(h2::Ping::opaque())
            .await
            .map(|_pong| ())
            .map_err(|e| TransportError::Ping(e.to_string()))
    }

    fn idle_time(&self) -> Duration {
        self.last_received.lock().elapsed()
    }

    async fn closed(&self) -> SessionClose {
        let mut rx = self.closed_rx.clone();
        loop {
            if let Some(close) = rx.borrow_and_update().clone() {
                return close;
            }
            if rx.changed().await.is_err() {
                return SessionClose::Closed;
            }
        }
    }

    fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Dials TCP and runs the HTTP/2 handshake for one remote authority,
/// retrying per the configured backoff.
pub struct H2Dialer {
    host: String,
    port: u16,
    connect_timeout: Option<Duration>,
    backoff: BackoffConfig,
}

impl H2Dialer {
    pub fn from_endpoint(endpoint: &str, config: &ConnectionConfig) -> Result<Self, TransportError> {
        let uri: http::Uri = endpoint
            .parse()
            .map_err(|e| TransportError::InvalidEndpoint(format!("{}: {}", endpoint, e)))?;
        if uri.scheme_str() != Some("http") {
            return Err(TransportError::InvalidEndpoint(format!(
                "unsupported scheme in {}: only http endpoints are dialed directly",
                endpoint
            )));
        }
        let host = uri
            .host()
            .ok_or_else(|| {
                TransportError::InvalidEndpoint(format!("missing host in {}", endpoint))
            })?
            .to_string();
        let port = uri.port_u16().unwrap_or(80);
        let connect_timeout = Some(Duration::from(config.connect_timeout)).filter(|t| !t.is_zero());

        Ok(Self {
            host,
            port,
            connect_timeout,
            backoff: config.backoff.clone(),
        })
    }

    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    async fn attempt(&self) -> Result<Arc<H2Session>, TransportError> {
        let connect = TcpStream::connect((self.host.as_str(), self.port));
        let tcp = match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, connect)
                .await
                .map_err(|_| {
                    TransportError::Connect(format!(
                        "{}: connect timed out after {}ms",
                        self.authority(),
                        limit.as_millis()
                    ))
                })?
                .map_err(|e| TransportError::Connect(format!("{}: {}", self.authority(), e)))?,
            None => connect
                .await
                .map_err(|e| TransportError::Connect(format!("{}: {}", self.authority(), e)))?,
        };
        tcp.set_nodelay(true).ok();

        H2Session::start(tcp).await
    }
}

#[async_trait]
impl Dialer for H2Dialer {
    type Session = H2Session;

    async fn dial(&self) -> Result<Arc<H2Session>, TransportError> {
        let mut delays = self.backoff.get_strategy();
        loop {
            match self.attempt().await {
                Ok(session) => return Ok(session),
                Err(error) => match delays.next() {
                    Some(delay) => {
                        warn!(error = %error, delay_ms = delay.as_millis() as u64, "connect attempt failed, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(error),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, HeaderValue, Method};

    /// Minimal in-process h2 server over a duplex pipe: answers every
    /// request with "hello" plus an ok trailer block.
    fn spawn_echo_server(io: tokio::io::DuplexStream) {
        tokio::spawn(async move {
            let mut connection = h2::server::handshake(io).await.unwrap();
            while let Some(incoming) = connection.accept().await {
                let Ok((_request, mut respond)) = incoming else {
                    break;
                };
                tokio::spawn(async move {
                    let response = http::Response::builder().status(200).body(()).unwrap();
                    let mut send = respond.send_response(response, false).unwrap();
                    send.send_data(Bytes::from_static(b"hello"), false).unwrap();
                    let mut trailers = HeaderMap::new();
                    trailers.insert("grpc-status", HeaderValue::from_static("0"));
                    send.send_trailers(trailers).unwrap();
                });
            }
        });
    }

    #[tokio::test]
    async fn test_open_stream_roundtrip() {
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        spawn_echo_server(server_io);

        let session = H2Session::start(client_io).await.unwrap();
        let request = Request::builder()
            .method(Method::POST)
            .uri("http://localhost/echo")
            .body(())
            .unwrap();

        let (response, mut send) = session.open_stream(request, false).await.unwrap();
        send.send_data(Bytes::from_static(b"ping"), true).unwrap();

        let response = response.await.unwrap();
        assert_eq!(response.status(), 200);

        let mut body = response.into_body();
        let mut received = Vec::new();
        while let Some(chunk) = body.data().await {
            let chunk = chunk.unwrap();
            let _ = body.flow_control().release_capacity(chunk.len());
            received.extend_from_slice(&chunk);
            session.record_activity();
        }
        assert_eq!(received, b"hello");

        let trailers = body.trailers().await.unwrap().unwrap();
        assert_eq!(trailers.get("grpc-status").unwrap(), "0");
        assert!(session.idle_time() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_ping_acked_by_peer() {
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        spawn_echo_server(server_io);

        let session = H2Session::start(client_io).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), session.ping())
            .await
            .expect("ping should resolve")
            .expect("ping should be acked");
    }

    #[tokio::test]
    async fn test_shutdown_reports_closed() {
        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        spawn_echo_server(server_io);

        let session = H2Session::start(client_io).await.unwrap();
        session.shutdown();
        let close = tokio::time::timeout(Duration::from_secs(5), session.closed())
            .await
            .expect("closed should resolve");
        assert!(matches!(close, SessionClose::Closed));
    }

    #[tokio::test]
    async fn test_unresolvable_host_is_connect_error() {
        let config = ConnectionConfig::default()
            .with_backoff(BackoffConfig::new_fixed_interval(Duration::ZERO, 0));
        let dialer =
            H2Dialer::from_endpoint("http://host.invalid:4242", &config).unwrap();
        let error = dialer.dial().await.unwrap_err();
        assert!(matches!(error, TransportError::Connect(_)));

        let status: Status = error.into();
        assert_eq!(status.code, trirpc_protocol::Code::Unavailable);
        assert!(status.message.contains("host.invalid:4242"));
    }

    #[test]
    fn test_rejects_non_http_endpoints() {
        let config = ConnectionConfig::default();
        assert!(matches!(
            H2Dialer::from_endpoint("https://secure:443", &config),
            Err(TransportError::InvalidEndpoint(_))
        ));
        assert!(matches!(
            H2Dialer::from_endpoint("not a uri", &config),
            Err(TransportError::InvalidEndpoint(_))
        ));
    }
}
