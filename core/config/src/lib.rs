// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

pub mod backoff;
pub mod client;
pub mod compression;
pub mod connection;
pub mod errors;
pub mod limits;
pub mod server;

/// Common trait implemented by every configuration struct in this crate.
pub trait Configuration {
    type Error;

    fn validate(&self) -> Result<(), Self::Error>;
}
