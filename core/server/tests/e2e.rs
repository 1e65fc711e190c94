// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! End-to-end tests: a real hyper server and a real HTTP/2 client on
//! 127.0.0.1, exercised over every wire protocol.

use std::time::Duration;

use futures::{StreamExt, stream};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use trirpc_client::{CallOptions, Client};
use trirpc_config::backoff::BackoffConfig;
use trirpc_config::client::ClientConfig;
use trirpc_config::connection::ConnectionConfig;
use trirpc_config::server::ServerConfig;
use trirpc_protocol::{Code, Idempotency, MethodKind, MethodSpec, ProtocolKind, Status};
use trirpc_server::handler::{self, RequestStream};
use trirpc_server::router::RouteOptions;
use trirpc_server::server::{RunningServer, Server};
use trirpc_transport::SessionState;

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
struct HelloRequest {
    #[prost(string, tag = "1")]
    #[serde(default)]
    name: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
struct HelloReply {
    #[prost(string, tag = "1")]
    #[serde(default)]
    message: String,
}

fn say_hello_spec() -> MethodSpec {
    MethodSpec::new("greet.GreetService", "SayHello", MethodKind::Unary)
        .with_idempotency(Idempotency::NoSideEffects)
}

fn error_test_spec() -> MethodSpec {
    MethodSpec::new("greet.GreetService", "ErrorTest", MethodKind::Unary)
}

fn echo_stream_spec() -> MethodSpec {
    MethodSpec::new("greet.GreetService", "EchoStream", MethodKind::BiDiStreaming)
}

fn slow_spec() -> MethodSpec {
    MethodSpec::new("greet.GreetService", "Slow", MethodKind::Unary)
}

async fn start_server(config: ServerConfig) -> RunningServer {
    let mut server = Server::new(config.with_drain_timeout(Duration::from_secs(1)));

    server.register(
        say_hello_spec(),
        handler::unary(|request: HelloRequest, _ctx| async move {
            Ok(HelloReply {
                message: format!("hello {}", request.name),
            })
        }),
        &RouteOptions::default(),
    );

    server.register(
        say_hello_spec(),
        handler::unary(|request: HelloRequest, _ctx| async move {
            Ok(HelloReply {
                message: format!("hello {} from v2", request.name),
            })
        }),
        &RouteOptions::default().with_version("2.0.0"),
    );

    server.register(
        error_test_spec(),
        handler::unary(|_request: HelloRequest, _ctx| async move {
            Err::<HelloReply, _>(Status::internal("exception"))
        }),
        &RouteOptions::default(),
    );

    server.register(
        echo_stream_spec(),
        handler::duplex(
            |mut requests: RequestStream<HelloRequest>, _ctx| async move {
                let first = match requests.next().await {
                    Some(Ok(request)) => request,
                    _ => return Err(Status::invalid_argument("missing first message")),
                };
                // One reply, then hold the stream open until the peer
                // goes away.
                let responses = stream::once(async move {
                    Ok(HelloReply {
                        message: format!("hello {}", first.name),
                    })
                })
                .chain(stream::pending());
                Ok(responses)
            },
        ),
        &RouteOptions::default(),
    );

    server.register(
        slow_spec(),
        handler::unary(|request: HelloRequest, _ctx| async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(HelloReply {
                message: request.name,
            })
        }),
        &RouteOptions::default(),
    );

    server.serve().await.expect("server starts")
}

fn client_for(server: &RunningServer, protocol: ProtocolKind) -> Client {
    Client::builder(&server.endpoint())
        .protocol(protocol)
        .build()
        .expect("client builds")
}

#[tokio::test]
async fn test_unary_hello_over_every_protocol() {
    let server = start_server(ServerConfig::with_endpoint("127.0.0.1:0")).await;

    for protocol in [
        ProtocolKind::Triple,
        ProtocolKind::Connect,
        ProtocolKind::Grpc,
        ProtocolKind::GrpcWeb,
    ] {
        let client = client_for(&server, protocol);
        let response = client
            .unary::<HelloRequest, HelloReply>(
                &say_hello_spec(),
                HelloRequest {
                    name: "dubbo".into(),
                },
                CallOptions::default(),
            )
            .await
            .unwrap_or_else(|e| panic!("{protocol}: {e}"));
        assert_eq!(response.message.message, "hello dubbo", "{protocol}");
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_unary_json_format() {
    let server = start_server(ServerConfig::with_endpoint("127.0.0.1:0")).await;

    let config = ClientConfig::with_endpoint(&server.endpoint()).with_use_binary_format(false);
    let client = Client::builder("unused")
        .with_config(config)
        .protocol(ProtocolKind::Connect)
        .build()
        .unwrap();

    let response = client
        .unary::<HelloRequest, HelloReply>(
            &say_hello_spec(),
            HelloRequest { name: "json".into() },
            CallOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(response.message.message, "hello json");

    server.shutdown().await;
}

#[tokio::test]
async fn test_error_propagation_over_every_protocol() {
    let server = start_server(ServerConfig::with_endpoint("127.0.0.1:0")).await;

    for protocol in [
        ProtocolKind::Triple,
        ProtocolKind::Connect,
        ProtocolKind::Grpc,
        ProtocolKind::GrpcWeb,
    ] {
        let client = client_for(&server, protocol);
        let err = client
            .unary::<HelloRequest, HelloReply>(
                &error_test_spec(),
                HelloRequest::default(),
                CallOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, Code::Internal, "{protocol}");
        assert_eq!(err.message, "exception", "{protocol}");
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_unimplemented_for_unknown_method() {
    let server = start_server(ServerConfig::with_endpoint("127.0.0.1:0")).await;

    let client = client_for(&server, ProtocolKind::Grpc);
    let missing = MethodSpec::new("greet.GreetService", "NoSuchMethod", MethodKind::Unary);
    let err = client
        .unary::<HelloRequest, HelloReply>(&missing, HelloRequest::default(), CallOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::Unimplemented);

    server.shutdown().await;
}

#[tokio::test]
async fn test_service_version_routing() {
    let server = start_server(ServerConfig::with_endpoint("127.0.0.1:0")).await;

    let versioned = Client::builder(&server.endpoint())
        .protocol(ProtocolKind::Triple)
        .service_version("2.0.0")
        .build()
        .unwrap();
    let response = versioned
        .unary::<HelloRequest, HelloReply>(
            &say_hello_spec(),
            HelloRequest {
                name: "dubbo".into(),
            },
            CallOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(response.message.message, "hello dubbo from v2");

    // A version/group tag that was never registered does not dispatch.
    let unknown = Client::builder(&server.endpoint())
        .protocol(ProtocolKind::Triple)
        .service_version("3.0.0")
        .build()
        .unwrap();
    let err = unknown
        .unary::<HelloRequest, HelloReply>(
            &say_hello_spec(),
            HelloRequest::default(),
            CallOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::Unimplemented);

    server.shutdown().await;
}

#[tokio::test]
async fn test_bidi_stream_and_cancellation() {
    let server = start_server(ServerConfig::with_endpoint("127.0.0.1:0")).await;

    let client = client_for(&server, ProtocolKind::Triple);
    let signal = CancellationToken::new();

    let requests = stream::iter([HelloRequest {
        name: "dubbo".into(),
    }])
    .chain(stream::pending());

    let mut responses = client
        .duplex::<HelloRequest, HelloReply>(
            &echo_stream_spec(),
            requests,
            CallOptions::default().with_signal(signal.clone()),
        )
        .await
        .unwrap();

    let first = responses.next().await.unwrap().unwrap();
    assert_eq!(first.message, "hello dubbo");

    // Abort mid-stream: the iteration surfaces the canonical error.
    signal.cancel();
    let err = responses.next().await.unwrap().unwrap_err();
    assert_eq!(err.code, Code::Canceled);
    assert_eq!(err.to_string(), "[canceled] This operation was aborted");

    server.shutdown().await;
}

#[tokio::test]
async fn test_deadline_exceeded() {
    let server = start_server(ServerConfig::with_endpoint("127.0.0.1:0")).await;

    let client = client_for(&server, ProtocolKind::Grpc);
    let err = client
        .unary::<HelloRequest, HelloReply>(
            &slow_spec(),
            HelloRequest { name: "slow".into() },
            CallOptions::default().with_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::DeadlineExceeded);

    server.shutdown().await;
}

#[tokio::test]
async fn test_connection_is_reused_across_sequential_calls() {
    let server = start_server(ServerConfig::with_endpoint("127.0.0.1:0")).await;

    let client = client_for(&server, ProtocolKind::Triple);
    assert_eq!(client.session_manager().state(), SessionState::Closed);

    for _ in 0..2 {
        client
            .unary::<HelloRequest, HelloReply>(
                &say_hello_spec(),
                HelloRequest {
                    name: "dubbo".into(),
                },
                CallOptions::default(),
            )
            .await
            .unwrap();
        // Between calls the shared session parks in idle, ready for reuse.
        assert_eq!(client.session_manager().state(), SessionState::Idle);
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_large_payload_roundtrip_with_compression() {
    let server = start_server(ServerConfig::with_endpoint("127.0.0.1:0")).await;

    let name = "dubbo ".repeat(4096);
    for protocol in [ProtocolKind::Grpc, ProtocolKind::Triple] {
        let client = client_for(&server, protocol);
        let response = client
            .unary::<HelloRequest, HelloReply>(
                &say_hello_spec(),
                HelloRequest { name: name.clone() },
                CallOptions::default(),
            )
            .await
            .unwrap_or_else(|e| panic!("{protocol}: {e}"));
        assert_eq!(response.message.message, format!("hello {}", name), "{protocol}");
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_connect_get_unary() {
    let server = start_server(ServerConfig::with_endpoint("127.0.0.1:0").with_enable_get(true)).await;

    let config = ClientConfig::with_endpoint(&server.endpoint()).with_use_http_get(true);
    let client = Client::builder("unused")
        .with_config(config)
        .protocol(ProtocolKind::Connect)
        .build()
        .unwrap();

    let response = client
        .unary::<HelloRequest, HelloReply>(
            &say_hello_spec(),
            HelloRequest { name: "get".into() },
            CallOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(response.message.message, "hello get");

    server.shutdown().await;
}

#[tokio::test]
async fn test_required_protocol_header_is_enforced() {
    let server = start_server(
        ServerConfig::with_endpoint("127.0.0.1:0").with_require_protocol_header(true),
    )
    .await;

    // The client always sends the version header, so calls succeed when
    // enforcement is on.
    let client = client_for(&server, ProtocolKind::Triple);
    let response = client
        .unary::<HelloRequest, HelloReply>(
            &say_hello_spec(),
            HelloRequest {
                name: "dubbo".into(),
            },
            CallOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(response.message.message, "hello dubbo");

    server.shutdown().await;
}

#[tokio::test]
async fn test_unresolvable_host_is_unavailable() {
    let config = ClientConfig::with_endpoint("http://host.invalid:4242").with_connection(
        ConnectionConfig::default()
            .with_backoff(BackoffConfig::new_fixed_interval(Duration::ZERO, 0)),
    );
    let client = Client::builder("unused")
        .with_config(config)
        .protocol(ProtocolKind::Triple)
        .build()
        .unwrap();

    let err = client
        .unary::<HelloRequest, HelloReply>(
            &say_hello_spec(),
            HelloRequest::default(),
            CallOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code, Code::Unavailable);
    assert!(err.message.contains("host.invalid"));
    assert_eq!(client.session_manager().state(), SessionState::Error);
}

#[tokio::test]
async fn test_server_streaming_natural_end() {
    let mut server = Server::new(
        ServerConfig::with_endpoint("127.0.0.1:0").with_drain_timeout(Duration::from_secs(1)),
    );
    let counting_spec =
        MethodSpec::new("greet.GreetService", "CountTo", MethodKind::ServerStreaming);
    server.register(
        counting_spec.clone(),
        handler::server_streaming(|request: HelloRequest, _ctx| async move {
            let count: usize = request.name.parse().unwrap_or(0);
            Ok(stream::iter((1..=count).map(|i| {
                Ok(HelloReply {
                    message: i.to_string(),
                })
            })))
        }),
        &RouteOptions::default(),
    );
    let running = server.serve().await.unwrap();

    for protocol in [ProtocolKind::Grpc, ProtocolKind::Connect] {
        let client = client_for(&running, protocol);
        let mut responses = client
            .server_streaming::<HelloRequest, HelloReply>(
                &counting_spec,
                HelloRequest { name: "3".into() },
                CallOptions::default(),
            )
            .await
            .unwrap();

        let mut received = Vec::new();
        while let Some(item) = responses.next().await {
            received.push(item.unwrap_or_else(|e| panic!("{protocol}: {e}")).message);
        }
        assert_eq!(received, vec!["1", "2", "3"], "{protocol}");
    }

    running.shutdown().await;
}
