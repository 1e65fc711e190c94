// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

pub mod client;
pub mod interceptor;
pub mod runner;
pub mod transport;

pub use client::{Client, ClientBuilder, Response, StreamingResponse};
pub use interceptor::{CallRequest, CallResponse, Interceptor, Next, Payload};
pub use runner::CallOptions;
