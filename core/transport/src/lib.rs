// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

pub mod errors;
pub mod h2session;
pub mod manager;
pub mod pool;
pub mod session;

pub use errors::{TransportError, h2_error_to_status};
pub use h2session::{H2Dialer, H2Session};
pub use manager::{Lease, SessionManager, SessionState};
pub use pool::SessionPool;
pub use session::{Dialer, GoAwayKind, Session, SessionClose};
