// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error;

use trirpc_protocol::{Code, Status};

/// Transport-level faults. Everything here is wrapped as `Unavailable` at
/// the manager boundary, with the underlying OS-level message preserved.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("HTTP/2 handshake failed: {0}")]
    Handshake(String),
    #[error("PING timed out")]
    PingTimeout,
    #[error("PING failed: {0}")]
    Ping(String),
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("connection is shutting down")]
    ShuttingDown,
}

impl From<TransportError> for Status {
    fn from(error: TransportError) -> Self {
        match &error {
            TransportError::ShuttingDown => Status::canceled(error.to_string()),
            _ => Status::unavailable(error.to_string()),
        }
    }
}

/// Maps an h2 stream or connection error onto a canonical status, keeping
/// the cause attributable: the GOAWAY/RST reason selects the code.
pub fn h2_error_to_status(error: &h2::Error) -> Status {
    use h2::Reason;

    match error.reason() {
        Some(Reason::ENHANCE_YOUR_CALM) => Status::resource_exhausted(error.to_string()),
        Some(Reason::FRAME_SIZE_ERROR) => Status::internal(error.to_string()),
        Some(Reason::NO_ERROR) | Some(Reason::CANCEL) => Status::canceled(error.to_string()),
        Some(_) => Status::unavailable(error.to_string()),
        None => Status::new(Code::Unavailable, error.to_string()),
    }
}
