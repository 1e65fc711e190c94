// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! The canonical cross-protocol error shape. Every failure that crosses a
//! protocol boundary is converted into a [`Status`] before it is surfaced to
//! a caller or serialized onto the wire; no protocol-specific error type
//! survives past the adapter layer.

use bytes::Bytes;
use http::HeaderMap;

use trirpc_codec::CodecError;

/// Canonical status codes, matching the gRPC enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Code {
    Ok = 0,
    Canceled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl Code {
    pub fn from_i32(value: i32) -> Option<Code> {
        use Code::*;
        Some(match value {
            0 => Ok,
            1 => Canceled,
            2 => Unknown,
            3 => InvalidArgument,
            4 => DeadlineExceeded,
            5 => NotFound,
            6 => AlreadyExists,
            7 => PermissionDenied,
            8 => ResourceExhausted,
            9 => FailedPrecondition,
            10 => Aborted,
            11 => OutOfRange,
            12 => Unimplemented,
            13 => Internal,
            14 => Unavailable,
            15 => DataLoss,
            16 => Unauthenticated,
            _ => return None,
        })
    }

    /// Snake-case name as used by the Connect protocol ("not_found").
    pub fn as_str(&self) -> &'static str {
        match self {
            Code::Ok => "ok",
            Code::Canceled => "canceled",
            Code::Unknown => "unknown",
            Code::InvalidArgument => "invalid_argument",
            Code::DeadlineExceeded => "deadline_exceeded",
            Code::NotFound => "not_found",
            Code::AlreadyExists => "already_exists",
            Code::PermissionDenied => "permission_denied",
            Code::ResourceExhausted => "resource_exhausted",
            Code::FailedPrecondition => "failed_precondition",
            Code::Aborted => "aborted",
            Code::OutOfRange => "out_of_range",
            Code::Unimplemented => "unimplemented",
            Code::Internal => "internal",
            Code::Unavailable => "unavailable",
            Code::DataLoss => "data_loss",
            Code::Unauthenticated => "unauthenticated",
        }
    }

    pub fn from_name(name: &str) -> Option<Code> {
        use Code::*;
        Some(match name {
            "ok" => Ok,
            "canceled" => Canceled,
            "unknown" => Unknown,
            "invalid_argument" => InvalidArgument,
            "deadline_exceeded" => DeadlineExceeded,
            "not_found" => NotFound,
            "already_exists" => AlreadyExists,
            "permission_denied" => PermissionDenied,
            "resource_exhausted" => ResourceExhausted,
            "failed_precondition" => FailedPrecondition,
            "aborted" => Aborted,
            "out_of_range" => OutOfRange,
            "unimplemented" => Unimplemented,
            "internal" => Internal,
            "unavailable" => Unavailable,
            "data_loss" => DataLoss,
            "unauthenticated" => Unauthenticated,
            _ => return None,
        })
    }

    /// Maps an HTTP status to a code, used when a transport surfaces an
    /// error without any in-band status. Follows the gRPC HTTP mapping.
    pub fn from_http_status(status: u16) -> Code {
        match status {
            400 => Code::Internal,
            401 => Code::Unauthenticated,
            403 => Code::PermissionDenied,
            404 => Code::Unimplemented,
            429 => Code::Unavailable,
            502 | 503 | 504 => Code::Unavailable,
            _ => Code::Unknown,
        }
    }

    /// Maps a code to the HTTP status used by Connect/Triple unary errors.
    pub fn to_http_status(&self) -> u16 {
        match self {
            Code::Ok => 200,
            Code::Canceled => 408,
            Code::Unknown => 500,
            Code::InvalidArgument => 400,
            Code::DeadlineExceeded => 408,
            Code::NotFound => 404,
            Code::AlreadyExists => 409,
            Code::PermissionDenied => 403,
            Code::ResourceExhausted => 429,
            Code::FailedPrecondition => 412,
            Code::Aborted => 409,
            Code::OutOfRange => 400,
            Code::Unimplemented => 404,
            Code::Internal => 500,
            Code::Unavailable => 503,
            Code::DataLoss => 500,
            Code::Unauthenticated => 401,
        }
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single binary-encoded detail attached to a status, mirroring
/// `google.protobuf.Any`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusDetail {
    pub type_url: String,
    pub value: Bytes,
}

impl StatusDetail {
    pub fn new(type_url: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            type_url: type_url.into(),
            value: value.into(),
        }
    }
}

/// The canonical error surfaced by every public API of this workspace.
#[derive(Debug, Clone)]
pub struct Status {
    pub code: Code,
    pub message: String,
    pub details: Vec<StatusDetail>,
    pub metadata: HeaderMap,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: Vec::new(),
            metadata: HeaderMap::new(),
        }
    }

    pub fn canceled(message: impl Into<String>) -> Self {
        Self::new(Code::Canceled, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(Code::DeadlineExceeded, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(Code::ResourceExhausted, message)
    }

    pub fn unimplemented(message: impl Into<String>) -> Self {
        Self::new(Code::Unimplemented, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(Code::Unknown, message)
    }

    pub fn with_details(mut self, details: Vec<StatusDetail>) -> Self {
        self.details = details;
        self
    }

    pub fn with_metadata(mut self, metadata: HeaderMap) -> Self {
        self.metadata = metadata;
        self
    }

    /// Coerces an arbitrary error into the canonical shape. A `Status`
    /// passes through unchanged; anything else becomes `Unknown` with the
    /// original message preserved.
    pub fn from_error<E>(error: E) -> Status
    where
        E: std::error::Error + 'static,
    {
        Self::from_dyn_error(&error)
    }

    fn from_dyn_error(error: &(dyn std::error::Error + 'static)) -> Status {
        if let Some(status) = error.downcast_ref::<Status>() {
            return status.clone();
        }
        Status::unknown(error.to_string())
    }

    /// Like [`Status::from_error`], but defaults to the given code instead
    /// of `Unknown` for unrecognized errors.
    pub fn from_error_with_code<E>(code: Code, error: E) -> Status
    where
        E: std::error::Error + 'static,
    {
        if let Some(status) = (&error as &(dyn std::error::Error)).downcast_ref::<Status>() {
            return status.clone();
        }
        Status::new(code, error.to_string())
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for Status {}

impl PartialEq for Status {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code && self.message == other.message && self.details == other.details
    }
}

impl From<CodecError> for Status {
    fn from(error: CodecError) -> Self {
        let message = error.to_string();
        match error {
            CodecError::ReadLimitExceeded { .. } | CodecError::WriteLimitExceeded { .. } => {
                Status::resource_exhausted(message)
            }
            CodecError::MalformedFrame(_)
            | CodecError::UnknownCompression
            | CodecError::Decode { .. }
            | CodecError::Decompress(_) => Status::invalid_argument(message),
            CodecError::Encode(_) | CodecError::Compress(_) => Status::internal(message),
        }
    }
}

/// Wire shape of `google.rpc.Status`, used for `grpc-status-details-bin`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StatusProto {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(message, repeated, tag = "3")]
    pub details: Vec<AnyProto>,
}

/// Wire shape of `google.protobuf.Any`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AnyProto {
    #[prost(string, tag = "1")]
    pub type_url: String,
    #[prost(bytes = "bytes", tag = "2")]
    pub value: Bytes,
}

impl Status {
    /// Encodes code/message/details as a `google.rpc.Status` message.
    pub fn to_proto(&self) -> StatusProto {
        StatusProto {
            code: self.code as i32,
            message: self.message.clone(),
            details: self
                .details
                .iter()
                .map(|d| AnyProto {
                    type_url: d.type_url.clone(),
                    value: d.value.clone(),
                })
                .collect(),
        }
    }

    pub fn from_proto(proto: StatusProto) -> Status {
        Status {
            code: Code::from_i32(proto.code).unwrap_or(Code::Unknown),
            message: proto.message,
            details: proto
                .details
                .into_iter()
                .map(|d| StatusDetail {
                    type_url: d.type_url,
                    value: d.value,
                })
                .collect(),
            metadata: HeaderMap::new(),
        }
    }
}
