// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Per-authority session managers. All calls against one scheme+host:port
//! share one manager, and therefore one multiplexed HTTP/2 session.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;

use trirpc_config::connection::ConnectionConfig;
use trirpc_protocol::Status;

use crate::h2session::H2Dialer;
use crate::manager::SessionManager;

pub struct SessionPool {
    config: ConnectionConfig,
    managers: RwLock<HashMap<String, SessionManager<H2Dialer>>>,
}

impl SessionPool {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            managers: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the manager owning the session towards `endpoint`, creating
    /// it on first use.
    pub fn manager_for(&self, endpoint: &str) -> Result<SessionManager<H2Dialer>, Status> {
        let key = normalize_authority(endpoint)?;

        if let Some(manager) = self.managers.read().get(&key) {
            return Ok(manager.clone());
        }

        let mut managers = self.managers.write();
        if let Some(manager) = managers.get(&key) {
            return Ok(manager.clone());
        }

        debug!(authority = %key, "creating session manager");
        let dialer = H2Dialer::from_endpoint(endpoint, &self.config).map_err(Status::from)?;
        let manager = SessionManager::with_config(dialer, &self.config);
        managers.insert(key, manager.clone());
        Ok(manager)
    }

    /// Aborts every pooled manager, rejecting all pending work.
    pub fn abort_all(&self) {
        for manager in self.managers.read().values() {
            manager.abort();
        }
    }
}

fn normalize_authority(endpoint: &str) -> Result<String, Status> {
    let uri: http::Uri = endpoint
        .parse()
        .map_err(|e| Status::unavailable(format!("invalid endpoint {}: {}", endpoint, e)))?;
    let scheme = uri.scheme_str().unwrap_or("http");
    let host = uri
        .host()
        .ok_or_else(|| Status::unavailable(format!("missing host in endpoint {}", endpoint)))?;
    let port = uri.port_u16().unwrap_or(80);
    Ok(format!("{}://{}:{}", scheme, host, port))
}
