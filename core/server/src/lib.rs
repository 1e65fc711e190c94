// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

pub mod errors;
pub mod handler;
pub mod router;
pub mod server;
pub mod service;

pub use errors::ServerError;
pub use handler::MethodHandler;
pub use router::{RouteOptions, Router};
pub use server::{RunningServer, Server};
pub use service::ServicePipeline;
