//! Static JSON-RPC route table.
//!
//! Route groups are composed once at startup; the resulting table is immutable
//! and shared by every tunnel's dispatcher.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use mexec_protocol::{Request, Response, RpcError, JSONRPC_VERSION};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info};

use crate::tunnel::Tunnel;

/// Per-call context handed to route handlers.
#[derive(Clone)]
pub(crate) struct CallContext {
    pub tunnel: Arc<Tunnel>,
}

type RouteFuture = Pin<Box<dyn Future<Output = Result<Value, RpcError>> + Send>>;
type RouteHandler = Arc<dyn Fn(CallContext, Value) -> RouteFuture + Send + Sync>;

pub(crate) struct Route {
    method: &'static str,
    handler: RouteHandler,
}

impl Route {
    pub fn new<F, Fut>(method: &'static str, handler: F) -> Self
    where
        F: Fn(CallContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        Self {
            method,
            handler: Arc::new(move |ctx, params| Box::pin(handler(ctx, params))),
        }
    }
}

pub(crate) struct RoutesGroup {
    pub name: &'static str,
    pub routes: Vec<Route>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub(crate) enum RegistryError {
    #[error("method '{method}' registered by both '{first}' and '{second}'")]
    DuplicateMethod {
        method: &'static str,
        first: &'static str,
        second: &'static str,
    },
}

pub(crate) struct RouteTable {
    routes: HashMap<&'static str, (&'static str, RouteHandler)>,
}

impl RouteTable {
    pub fn compose(groups: Vec<RoutesGroup>) -> Result<Self, RegistryError> {
        let mut routes: HashMap<&'static str, (&'static str, RouteHandler)> = HashMap::new();
        for group in groups {
            for route in group.routes {
                if let Some((first, _)) = routes.get(route.method) {
                    return Err(RegistryError::DuplicateMethod {
                        method: route.method,
                        first: *first,
                        second: group.name,
                    });
                }
                routes.insert(route.method, (group.name, route.handler));
            }
        }
        Ok(Self { routes })
    }

    pub fn contains(&self, method: &str) -> bool {
        self.routes.contains_key(method)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn log_routes(&self) {
        let mut by_group: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (method, (group, _)) in &self.routes {
            by_group.entry(*group).or_default().push(*method);
        }
        for (group, mut methods) in by_group {
            methods.sort_unstable();
            info!(group, methods = ?methods, "registered json-rpc routes");
        }
    }

    /// Handle one inbound text frame. Returns the response to write, if any.
    pub async fn handle_frame(&self, ctx: CallContext, text: &str) -> Option<Response> {
        let raw: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(err) => {
                return Some(Response::error(Value::Null, RpcError::parse_error(err.to_string())))
            }
        };
        let id = raw.get("id").cloned().unwrap_or(Value::Null);
        let request: Request = match serde_json::from_value(raw) {
            Ok(request) => request,
            Err(err) => return Some(Response::error(id, RpcError::invalid_request(err.to_string()))),
        };
        if request.jsonrpc != JSONRPC_VERSION {
            return Some(Response::error(
                id,
                RpcError::invalid_request(format!("unsupported jsonrpc version '{}'", request.jsonrpc)),
            ));
        }
        self.dispatch(ctx, request).await
    }

    pub async fn dispatch(&self, ctx: CallContext, request: Request) -> Option<Response> {
        let Request { id, method, params, .. } = request;
        let outcome = match self.routes.get(method.as_str()) {
            Some((_, handler)) => handler(ctx, params).await,
            None => Err(RpcError::method_not_found(&method)),
        };
        let id = match id {
            Some(id) => id,
            None => {
                if let Err(err) = outcome {
                    debug!(%method, %err, "notification handler failed");
                }
                return None;
            }
        };
        Some(match outcome {
            Ok(result) => Response::result(id, result),
            Err(err) => Response::error(id, err),
        })
    }
}

/// Decode handler params, mapping failures to `invalid params`.
pub(crate) fn decode_params<T: DeserializeOwned>(params: Value) -> Result<T, RpcError> {
    serde_json::from_value(params).map_err(|err| RpcError::invalid_params(err.to_string()))
}
