// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

//! Routes an inbound path plus the Dubbo version/group headers to a
//! registered method. The composite key lets several implementations of
//! the same RPC path coexist under different version/group tags.

use std::collections::HashMap;
use std::sync::Arc;

use http::HeaderMap;
use tracing::debug;

use trirpc_protocol::headers::{HEADER_TRI_SERVICE_GROUP, HEADER_TRI_SERVICE_VERSION};
use trirpc_protocol::{MethodSpec, Status};

use crate::handler::MethodHandler;

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct RouteKey {
    path: String,
    version: String,
    group: String,
}

/// Version/group tags a service is registered under. Empty strings are the
/// defaults for unspecified tags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteOptions {
    pub version: Option<String>,
    pub group: Option<String>,
}

impl RouteOptions {
    pub fn with_version(mut self, version: &str) -> Self {
        self.version = Some(version.to_string());
        self
    }

    pub fn with_group(mut self, group: &str) -> Self {
        self.group = Some(group.to_string());
        self
    }
}

/// One registered method: its descriptor plus the erased implementation.
#[derive(Debug)]
pub struct Route {
    pub spec: MethodSpec,
    pub handler: MethodHandler,
    pub version: String,
    pub group: String,
}

#[derive(Default)]
pub struct Router {
    routes: HashMap<RouteKey, Arc<Route>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one method under the given version/group tags. A second
    /// registration of the same key replaces the first.
    pub fn register(&mut self, spec: MethodSpec, handler: MethodHandler, options: &RouteOptions) {
        let version = options.version.clone().unwrap_or_default();
        let group = options.group.clone().unwrap_or_default();
        let key = RouteKey {
            path: spec.path(),
            version: version.clone(),
            group: group.clone(),
        };
        debug!(path = %key.path, version = %key.version, group = %key.group, "registering method");
        self.routes.insert(
            key,
            Arc::new(Route {
                spec,
                handler,
                version,
                group,
            }),
        );
    }

    /// Registers a whole service: a map of method name to (spec, handler).
    pub fn register_service(
        &mut self,
        methods: Vec<(MethodSpec, MethodHandler)>,
        options: &RouteOptions,
    ) {
        for (spec, handler) in methods {
            self.register(spec, handler, options);
        }
    }

    /// Resolves the handler for a request. The version/group tags ride in
    /// the `tri-service-*` headers regardless of wire protocol.
    pub fn dispatch(&self, path: &str, headers: &HeaderMap) -> Result<Arc<Route>, Status> {
        let version = header_value(headers, HEADER_TRI_SERVICE_VERSION);
        let group = header_value(headers, HEADER_TRI_SERVICE_GROUP);
        let key = RouteKey {
            path: path.to_string(),
            version: version.to_string(),
            group: group.to_string(),
        };
        self.routes.get(&key).cloned().ok_or_else(|| {
            Status::unimplemented(format!(
                "no handler for {} (version \"{}\", group \"{}\")",
                path, version, group
            ))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::handler;
    use http::HeaderValue;
    use serde::{Deserialize, Serialize};
    use trirpc_protocol::{Code, MethodKind};

    #[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
    struct Empty {}

    fn noop_handler() -> MethodHandler {
        handler::unary(|_request: Empty, _ctx| async move { Ok(Empty {}) })
    }

    fn spec() -> MethodSpec {
        MethodSpec::new("greet.GreetService", "SayHello", MethodKind::Unary)
    }

    #[test]
    fn test_dispatch_default_tags() {
        let mut router = Router::new();
        router.register(spec(), noop_handler(), &RouteOptions::default());

        let route = router
            .dispatch("/greet.GreetService/SayHello", &HeaderMap::new())
            .unwrap();
        assert_eq!(route.spec.method, "SayHello");
    }

    #[test]
    fn test_dispatch_no_match_is_unimplemented() {
        let router = Router::new();
        let err = router
            .dispatch("/greet.GreetService/SayHello", &HeaderMap::new())
            .unwrap_err();
        assert_eq!(err.code, Code::Unimplemented);
        assert!(err.message.contains("/greet.GreetService/SayHello"));
    }

    #[test]
    fn test_same_path_different_version_and_group() {
        let mut router = Router::new();
        router.register(
            spec(),
            noop_handler(),
            &RouteOptions::default().with_version("1.0.0"),
        );
        router.register(
            spec(),
            noop_handler(),
            &RouteOptions::default().with_version("2.0.0").with_group("blue"),
        );

        let mut headers = HeaderMap::new();
        headers.insert(HEADER_TRI_SERVICE_VERSION, HeaderValue::from_static("1.0.0"));
        let route = router
            .dispatch("/greet.GreetService/SayHello", &headers)
            .unwrap();
        assert_eq!(route.version, "1.0.0");

        headers.insert(HEADER_TRI_SERVICE_VERSION, HeaderValue::from_static("2.0.0"));
        headers.insert(HEADER_TRI_SERVICE_GROUP, HeaderValue::from_static("blue"));
        let route = router
            .dispatch("/greet.GreetService/SayHello", &headers)
            .unwrap();
        assert_eq!(route.version, "2.0.0");
        assert_eq!(route.group, "blue");

        // A tag combination that was never registered does not fall back.
        headers.insert(HEADER_TRI_SERVICE_GROUP, HeaderValue::from_static("green"));
        let err = router
            .dispatch("/greet.GreetService/SayHello", &headers)
            .unwrap_err();
        assert_eq!(err.code, Code::Unimplemented);
    }
}
