//! Inbound webhook routes
//!
//! Plugins register `(method, path)` handlers while loading. The table is
//! consumed by whatever HTTP front end the process runs; the bridge itself
//! serves no HTTP. When two plugins claim the same route the first one
//! keeps it.

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// HTTP method of a webhook route
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    /// GET
    Get,
    /// POST
    Post,
    /// PUT
    Put,
    /// DELETE
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Post => write!(f, "POST"),
            Method::Put => write!(f, "PUT"),
            Method::Delete => write!(f, "DELETE"),
        }
    }
}

/// A webhook call handed to a plugin
#[derive(Debug, Clone, Default)]
pub struct WebhookRequest {
    /// Query parameters
    pub query: BTreeMap<String, String>,
    /// Parsed JSON body, `Null` when absent
    pub body: serde_json::Value,
}

/// A plugin's answer to a webhook call
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookResponse {
    /// HTTP status code
    pub status: u16,
    /// JSON body
    pub body: serde_json::Value,
}

impl WebhookResponse {
    /// 200 with a JSON body
    pub fn ok(body: serde_json::Value) -> Self {
        Self { status: 200, body }
    }
}

/// Async webhook handler
pub type RouteHandler =
    Arc<dyn Fn(WebhookRequest) -> BoxFuture<'static, anyhow::Result<WebhookResponse>> + Send + Sync>;

/// A registered route
#[derive(Clone)]
pub struct RouteEntry {
    /// Owning plugin
    pub owner: String,
    /// Handler
    pub handler: RouteHandler,
}

impl fmt::Debug for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteEntry").field("owner", &self.owner).finish()
    }
}

/// Route summary for status output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteInfo {
    /// Method
    pub method: Method,
    /// Path
    pub path: String,
    /// Owning plugin
    pub owner: String,
}

type RouteKey = (Method, String);

/// Shared webhook route table
#[derive(Clone, Default)]
pub struct RouteTable {
    routes: Arc<RwLock<BTreeMap<RouteKey, RouteEntry>>>,
}

impl RouteTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Let `plugin_id` register its routes. Returns the routes it won.
    pub fn register_plugin<F>(&self, plugin_id: &str, register: F) -> Vec<RouteInfo>
    where
        F: FnOnce(&mut RouteRegistrar<'_>),
    {
        let mut routes = self.routes.write();
        let mut registrar = RouteRegistrar {
            routes: &mut *routes,
            owner: plugin_id,
            added: Vec::new(),
        };
        register(&mut registrar);
        registrar.added
    }

    /// Drop every route owned by `plugin_id`
    pub fn remove_plugin(&self, plugin_id: &str) -> usize {
        let mut routes = self.routes.write();
        let before = routes.len();
        routes.retain(|_, entry| entry.owner != plugin_id);
        before - routes.len()
    }

    /// Find the handler for a route
    pub fn resolve(&self, method: Method, path: &str) -> Option<RouteEntry> {
        self.routes.read().get(&(method, normalize(path))).cloned()
    }

    /// Invoke the handler for a route. `None` when nothing is registered.
    pub async fn call(
        &self,
        method: Method,
        path: &str,
        request: WebhookRequest,
    ) -> Option<anyhow::Result<WebhookResponse>> {
        let entry = self.resolve(method, path)?;
        debug!(%method, path, owner = %entry.owner, "Webhook call");
        Some((entry.handler)(request).await)
    }

    /// All routes, sorted
    pub fn list(&self) -> Vec<RouteInfo> {
        self.routes
            .read()
            .iter()
            .map(|((method, path), entry)| RouteInfo {
                method: *method,
                path: path.clone(),
                owner: entry.owner.clone(),
            })
            .collect()
    }
}

impl fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteTable")
            .field("routes", &self.routes.read().len())
            .finish()
    }
}

/// Passed to [`Plugin::register_routes`](super::Plugin::register_routes)
pub struct RouteRegistrar<'a> {
    routes: &'a mut BTreeMap<RouteKey, RouteEntry>,
    owner: &'a str,
    added: Vec<RouteInfo>,
}

impl RouteRegistrar<'_> {
    /// Register a handler. Returns false if another plugin owns the route.
    pub fn route<F, Fut>(&mut self, method: Method, path: &str, handler: F) -> bool
    where
        F: Fn(WebhookRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<WebhookResponse>> + Send + 'static,
    {
        let path = normalize(path);
        let key = (method, path.clone());
        if let Some(existing) = self.routes.get(&key) {
            warn!(
                plugin = %self.owner,
                owner = %existing.owner,
                %method,
                path = %path,
                "Webhook route already registered; keeping first"
            );
            return false;
        }

        let handler: RouteHandler =
            Arc::new(move |req| -> BoxFuture<'static, anyhow::Result<WebhookResponse>> {
                Box::pin(handler(req))
            });
        self.routes.insert(
            key,
            RouteEntry {
                owner: self.owner.to_string(),
                handler,
            },
        );
        debug!(plugin = %self.owner, %method, path = %path, "Webhook route registered");
        self.added.push(RouteInfo {
            method,
            path,
            owner: self.owner.to_string(),
        });
        true
    }

    /// Plugin registering routes
    pub fn owner(&self) -> &str {
        self.owner
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}
