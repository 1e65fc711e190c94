// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Typed method handlers, erased into a uniform shape the pipeline can
//! drive. The erased closures own the parse/serialize steps so the
//! pipeline only ever moves serialized payloads; the negotiated wire
//! format arrives through the [`Serializer`] argument at call time.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;

use trirpc_codec::Serializer;
use trirpc_protocol::{ByteStream, CallContext, MethodKind, Status};

/// A typed inbound message stream handed to streaming handlers.
pub type RequestStream<Req> = futures::stream::BoxStream<'static, Result<Req, Status>>;

type UnaryFn = Arc<
    dyn Fn(Arc<CallContext>, Serializer, Bytes) -> BoxFuture<'static, Result<Bytes, Status>>
        + Send
        + Sync,
>;
type ServerStreamFn = Arc<
    dyn Fn(Arc<CallContext>, Serializer, Bytes) -> BoxFuture<'static, Result<ByteStream, Status>>
        + Send
        + Sync,
>;
type ClientStreamFn = Arc<
    dyn Fn(Arc<CallContext>, Serializer, ByteStream) -> BoxFuture<'static, Result<Bytes, Status>>
        + Send
        + Sync,
>;
type DuplexFn = Arc<
    dyn Fn(
            Arc<CallContext>,
            Serializer,
            ByteStream,
        ) -> BoxFuture<'static, Result<ByteStream, Status>>
        + Send
        + Sync,
>;

/// One registered method implementation.
#[derive(Clone)]
pub enum MethodHandler {
    Unary(UnaryFn),
    ServerStreaming(ServerStreamFn),
    ClientStreaming(ClientStreamFn),
    Duplex(DuplexFn),
}

impl MethodHandler {
    pub fn kind(&self) -> MethodKind {
        match self {
            MethodHandler::Unary(_) => MethodKind::Unary,
            MethodHandler::ServerStreaming(_) => MethodKind::ServerStreaming,
            MethodHandler::ClientStreaming(_) => MethodKind::ClientStreaming,
            MethodHandler::Duplex(_) => MethodKind::BiDiStreaming,
        }
    }
}

impl std::fmt::Debug for MethodHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MethodHandler::{:?}", self.kind())
    }
}

fn parse_stream<Req>(serializer: Serializer, payloads: ByteStream) -> RequestStream<Req>
where
    Req: prost::Message + DeserializeOwned + Default + Send + 'static,
{
    Box::pin(payloads.map(move |item| {
        item.and_then(|bytes| serializer.parse::<Req>(&bytes).map_err(Status::from))
    }))
}

fn serialize_stream<Res, S>(serializer: Serializer, messages: S) -> ByteStream
where
    Res: prost::Message + Serialize + Send + 'static,
    S: Stream<Item = Result<Res, Status>> + Send + 'static,
{
    Box::pin(messages.map(move |item| {
        item.and_then(|message| serializer.serialize(&message).map_err(Status::from))
    }))
}

/// Builds a unary handler from `async fn(Req, ctx) -> Result<Res, Status>`.
pub fn unary<Req, Res, F, Fut>(handler: F) -> MethodHandler
where
    Req: prost::Message + DeserializeOwned + Default + Send + 'static,
    Res: prost::Message + Serialize + Send + 'static,
    F: Fn(Req, Arc<CallContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Res, Status>> + Send + 'static,
{
    let handler = Arc::new(handler);
    MethodHandler::Unary(Arc::new(move |ctx, serializer, bytes| {
        let handler = Arc::clone(&handler);
        Box::pin(async move {
            let request: Req = serializer.parse(&bytes).map_err(Status::from)?;
            let response = handler(request, ctx).await?;
            serializer.serialize(&response).map_err(Status::from)
        })
    }))
}

/// Builds a server-streaming handler from
/// `async fn(Req, ctx) -> Result<impl Stream<Item = Result<Res, Status>>, Status>`.
pub fn server_streaming<Req, Res, F, Fut, S>(handler: F) -> MethodHandler
where
    Req: prost::Message + DeserializeOwned + Default + Send + 'static,
    Res: prost::Message + Serialize + Send + 'static,
    F: Fn(Req, Arc<CallContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<S, Status>> + Send + 'static,
    S: Stream<Item = Result<Res, Status>> + Send + 'static,
{
    let handler = Arc::new(handler);
    MethodHandler::ServerStreaming(Arc::new(move |ctx, serializer, bytes| {
        let handler = Arc::clone(&handler);
        Box::pin(async move {
            let request: Req = serializer.parse(&bytes).map_err(Status::from)?;
            let responses = handler(request, ctx).await?;
            Ok(serialize_stream(serializer, responses))
        })
    }))
}

/// Builds a client-streaming handler from
/// `async fn(RequestStream<Req>, ctx) -> Result<Res, Status>`.
pub fn client_streaming<Req, Res, F, Fut>(handler: F) -> MethodHandler
where
    Req: prost::Message + DeserializeOwned + Default + Send + 'static,
    Res: prost::Message + Serialize + Send + 'static,
    F: Fn(RequestStream<Req>, Arc<CallContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Res, Status>> + Send + 'static,
{
    let handler = Arc::new(handler);
    MethodHandler::ClientStreaming(Arc::new(move |ctx, serializer, payloads| {
        let handler = Arc::clone(&handler);
        Box::pin(async move {
            let requests = parse_stream::<Req>(serializer, payloads);
            let response = handler(requests, ctx).await?;
            serializer.serialize(&response).map_err(Status::from)
        })
    }))
}

/// Builds a bidirectional handler from
/// `async fn(RequestStream<Req>, ctx) -> Result<impl Stream<Item = Result<Res, Status>>, Status>`.
pub fn duplex<Req, Res, F, Fut, S>(handler: F) -> MethodHandler
where
    Req: prost::Message + DeserializeOwned + Default + Send + 'static,
    Res: prost::Message + Serialize + Send + 'static,
    F: Fn(RequestStream<Req>, Arc<CallContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<S, Status>> + Send + 'static,
    S: Stream<Item = Result<Res, Status>> + Send + 'static,
{
    let handler = Arc::new(handler);
    MethodHandler::Duplex(Arc::new(move |ctx, serializer, payloads| {
        let handler = Arc::clone(&handler);
        Box::pin(async move {
            let requests = parse_stream::<Req>(serializer, payloads);
            let responses = handler(requests, ctx).await?;
            Ok(serialize_stream(serializer, responses))
        })
    }))
}

#[cfg(test)]
mod test {
    use super::*;
    use futures::stream;
    use http::HeaderMap;
    use serde::Deserialize;
    use trirpc_codec::WireFormat;
    use trirpc_config::limits::LimitsConfig;
    use trirpc_protocol::ProtocolKind;

    #[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
    struct Echo {
        #[prost(string, tag = "1")]
        #[serde(default)]
        text: String,
    }

    fn serializer() -> Serializer {
        Serializer::new(WireFormat::Binary, &LimitsConfig::default())
    }

    #[tokio::test]
    async fn test_unary_handler_parses_and_serializes() {
        let handler = unary(|request: Echo, _ctx| async move {
            Ok(Echo {
                text: format!("hello {}", request.text),
            })
        });
        let MethodHandler::Unary(erased) = handler else {
            panic!("expected unary handler");
        };

        let ctx = CallContext::new(ProtocolKind::Triple, HeaderMap::new());
        let input = serializer().serialize(&Echo { text: "dubbo".into() }).unwrap();
        let output = erased(ctx, serializer(), input).await.unwrap();
        let decoded: Echo = serializer().parse(&output).unwrap();
        assert_eq!(decoded.text, "hello dubbo");
    }

    #[tokio::test]
    async fn test_client_streaming_handler_collects() {
        let handler = client_streaming(|mut requests: RequestStream<Echo>, _ctx| async move {
            let mut parts = Vec::new();
            while let Some(message) = requests.next().await {
                parts.push(message?.text);
            }
            Ok(Echo {
                text: parts.join("+"),
            })
        });
        let MethodHandler::ClientStreaming(erased) = handler else {
            panic!("expected client-streaming handler");
        };

        let inputs: Vec<Result<Bytes, Status>> = ["a", "b"]
            .iter()
            .map(|text| Ok(serializer().serialize(&Echo { text: text.to_string() }).unwrap()))
            .collect();
        let ctx = CallContext::new(ProtocolKind::Grpc, HeaderMap::new());
        let output = erased(ctx, serializer(), Box::pin(stream::iter(inputs)))
            .await
            .unwrap();
        let decoded: Echo = serializer().parse(&output).unwrap();
        assert_eq!(decoded.text, "a+b");
    }

    #[tokio::test]
    async fn test_handler_error_passes_through() {
        let handler = unary(|_request: Echo, _ctx| async move {
            Err::<Echo, _>(Status::new(trirpc_protocol::Code::Internal, "exception"))
        });
        let MethodHandler::Unary(erased) = handler else {
            panic!("expected unary handler");
        };

        let ctx = CallContext::new(ProtocolKind::Connect, HeaderMap::new());
        let input = serializer().serialize(&Echo::default()).unwrap();
        let err = erased(ctx, serializer(), input).await.unwrap_err();
        assert_eq!(err.message, "exception");
    }
}
