// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

pub mod connect;
pub mod context;
pub mod grpc;
pub mod grpcweb;
pub mod headers;
pub mod method;
pub mod status;
pub mod timeout;

pub use context::CallContext;
pub use method::{
    BodyChunk, BodyStream, ByteStream, Idempotency, MethodKind, MethodSpec, Negotiated,
    ProtocolKind, RequestError, UniversalRequest, UniversalResponse,
};
pub use status::{Code, Status, StatusDetail};
