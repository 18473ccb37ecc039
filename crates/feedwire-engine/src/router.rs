//! Route tree dispatch.
//!
//! A request path is resolved against standalone routes first, then against
//! the tree by splitting on `.`. Every authenticator on the way down must
//! pass, outermost first. A successful handler's reply goes out on
//! `"m." + path` before the outbounds the route modifies are refreshed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use feedwire_core::frame::{Frame, is_unauthorized_marker};
use feedwire_core::HandlerError;
use futures::future::join_all;
use metrics::{counter, histogram};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, error, instrument, trace, warn};

use crate::connection::Connection;
use crate::errors::{EngineError, Result};
use crate::handler::Reply;
use crate::outbound::OutboundRegistry;
use crate::route::{PATH_SEPARATOR, Route, validate_method};

const SLOW_REQUEST_SECS: u64 = 5;

/// An inbound request.
#[derive(Clone, Debug)]
pub struct Request {
    /// Route path.
    pub path: String,
    /// Request payload.
    pub payload: Value,
    /// Sender.
    pub connection: Arc<Connection>,
    /// Correlation id echoed on the reply.
    pub message_id: Option<i64>,
}

impl Request {
    /// Request without a correlation id.
    pub fn new(path: impl Into<String>, payload: Value, connection: Arc<Connection>) -> Self {
        Self {
            path: path.into(),
            payload,
            connection,
            message_id: None,
        }
    }

    /// Set the correlation id.
    #[must_use]
    pub fn with_message_id(mut self, message_id: Option<i64>) -> Self {
        self.message_id = message_id;
        self
    }

    /// Request carried by an inbound frame.
    pub fn from_frame(frame: Frame, connection: Arc<Connection>) -> Self {
        Self {
            path: frame.method,
            payload: frame.value.unwrap_or_default(),
            connection,
            message_id: frame.message_id,
        }
    }
}

/// How a routed request ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Handler succeeded and a reply was sent.
    Replied,
    /// Handler succeeded without a reply.
    Completed,
    /// An authenticator or the handler refused the request.
    Unauthorized,
    /// The handler failed; an error frame was sent.
    Failed,
}

#[derive(Default)]
struct RouteTable {
    roots: Vec<Arc<Route>>,
    standalone: HashMap<String, Arc<Route>>,
}

impl RouteTable {
    fn resolve(&self, path: &str) -> Option<Vec<Arc<Route>>> {
        if let Some(route) = self.standalone.get(path) {
            return Some(vec![Arc::clone(route)]);
        }
        self.resolve_tree(path)
    }

    fn resolve_tree(&self, path: &str) -> Option<Vec<Arc<Route>>> {
        let mut segments = path.split(PATH_SEPARATOR);
        let first = segments.next()?;
        let mut node = self.roots.iter().find(|root| root.method == first)?;
        let mut chain = vec![Arc::clone(node)];
        for segment in segments {
            node = node.find_child(segment)?;
            chain.push(Arc::clone(node));
        }
        Some(chain)
    }
}

fn count_handlers(route: &Route) -> usize {
    usize::from(route.has_handler()) + route.children.iter().map(|c| count_handlers(c)).sum::<usize>()
}

/// Route tree plus standalone routes.
pub struct Router {
    table: RwLock<RouteTable>,
    outbounds: Arc<OutboundRegistry>,
}

impl Router {
    /// Empty router refreshing outbounds from `outbounds`.
    pub fn new(outbounds: Arc<OutboundRegistry>) -> Self {
        Self {
            table: RwLock::new(RouteTable::default()),
            outbounds,
        }
    }

    /// Outbounds refreshed by `modifies` bindings.
    pub fn outbounds(&self) -> &Arc<OutboundRegistry> {
        &self.outbounds
    }

    /// Register a root route and its subtree.
    pub fn register(&self, route: Route) -> Result<()> {
        route.validate_tree()?;
        let mut table = self.table.write();
        if table.roots.iter().any(|root| root.method == route.method) {
            return Err(EngineError::DuplicateRoute {
                method: route.method,
            });
        }
        if let Some(path) = route
            .paths()
            .into_iter()
            .find(|path| table.standalone.contains_key(path))
        {
            return Err(EngineError::DuplicateRoute { method: path });
        }
        debug!(method = %route.method, "route registered");
        table.roots.push(Arc::new(route));
        Ok(())
    }

    /// Register a route matched by its whole path.
    pub fn register_standalone(&self, route: Route) -> Result<()> {
        validate_method(&route.method)?;
        if !route.children.is_empty() {
            return Err(EngineError::InvalidRouteMethod {
                method: route.method,
                reason: "standalone routes cannot have children",
            });
        }
        let mut table = self.table.write();
        if table.standalone.contains_key(&route.method) || table.resolve_tree(&route.method).is_some() {
            return Err(EngineError::DuplicateRoute {
                method: route.method,
            });
        }
        debug!(method = %route.method, "standalone route registered");
        let _ = table
            .standalone
            .insert(route.method.clone(), Arc::new(route));
        Ok(())
    }

    /// Node serving `path`.
    pub fn route_by_method(&self, path: &str) -> Result<Arc<Route>> {
        self.table
            .read()
            .resolve(path)
            .and_then(|mut chain| chain.pop())
            .ok_or_else(|| EngineError::RouteNotFound {
                path: path.to_owned(),
            })
    }

    /// Number of paths with a handler.
    pub fn route_count(&self) -> usize {
        let table = self.table.read();
        table.standalone.len() + table.roots.iter().map(|root| count_handlers(root)).sum::<usize>()
    }

    /// Drop every route.
    pub fn clear(&self) {
        *self.table.write() = RouteTable::default();
    }

    /// Dispatch a request.
    ///
    /// Unknown paths fail synchronously with [`EngineError::RouteNotFound`];
    /// everything else is reported to the client and summarized in the
    /// returned [`Outcome`].
    #[instrument(skip_all, fields(path = %request.path, conn_id = %request.connection.id()))]
    pub async fn route(&self, request: Request) -> Result<Outcome> {
        let Request {
            path,
            payload,
            connection,
            message_id,
        } = request;

        let chain = self.table.read().resolve(&path);
        let Some((route, handler)) = chain
            .as_ref()
            .and_then(|chain| chain.last())
            .and_then(|route| route.handler.clone().map(|h| (Arc::clone(route), h)))
        else {
            counter!("route_errors_total", "path" => path.clone(), "kind" => "not_found").increment(1);
            return Err(EngineError::RouteNotFound { path });
        };
        counter!("route_requests_total", "path" => path.clone()).increment(1);
        if connection.logging() {
            debug!(message_id, "request received");
        }

        for node in chain.iter().flatten() {
            if let Some(authenticator) = &node.authenticator {
                if !authenticator.check_authentication(&connection, &payload).await {
                    return Ok(reject(&route, &path, &connection, message_id));
                }
            }
        }

        let start = Instant::now();
        let result = handler.handle(payload, Arc::clone(&connection)).await;
        let duration = start.elapsed();
        histogram!("route_duration_seconds", "path" => path.clone()).record(duration.as_secs_f64());
        if duration.as_secs() >= SLOW_REQUEST_SECS {
            warn!(duration_secs = duration.as_secs_f64(), "slow route handler");
        }

        let (outcome, response) = match result {
            Ok(Reply::Value(value)) if is_unauthorized_marker(&value) => {
                return Ok(reject(&route, &path, &connection, message_id));
            }
            Ok(Reply::Value(value)) => {
                let mut frame = Frame::reply(&path, value, message_id);
                let _ = connection.send(&frame);
                (Outcome::Replied, frame.value.take().unwrap_or_default())
            }
            Ok(Reply::Empty) => (Outcome::Completed, Value::Null),
            Ok(Reply::Unauthorized) | Err(HandlerError::Unauthorized) => {
                return Ok(reject(&route, &path, &connection, message_id));
            }
            Err(err) => return Ok(fail(&route, &path, &connection, message_id, &err)),
        };

        self.fan_out(&route, &response, &connection).await;
        if route.modifies_authentication {
            let outbounds = Arc::clone(&self.outbounds);
            let connection = Arc::clone(&connection);
            let _ = tokio::spawn(async move {
                outbounds.resend_after_authentication_change(&connection).await;
            });
        }
        Ok(outcome)
    }

    async fn fan_out(&self, route: &Route, response: &Value, connection: &Connection) {
        if route.modifies.is_empty() {
            return;
        }
        let updates = route.modifies.iter().map(|binding| async move {
            let key = match &binding.filter {
                Some(filter) => filter.partition(response, connection).await,
                None => None,
            };
            self.outbounds.send_updates(&binding.outbounds, key).await;
        });
        let _ = join_all(updates).await;
    }
}

fn reject(route: &Route, path: &str, connection: &Connection, message_id: Option<i64>) -> Outcome {
    trace!(path, conn_id = %connection.id(), "request rejected");
    counter!("route_errors_total", "path" => path.to_owned(), "kind" => "unauthorized").increment(1);
    if route.reports_unauthorized {
        let _ = connection.send(&Frame::error(HandlerError::Unauthorized.to_string(), message_id));
    }
    Outcome::Unauthorized
}

fn fail(
    route: &Route,
    path: &str,
    connection: &Connection,
    message_id: Option<i64>,
    err: &HandlerError,
) -> Outcome {
    counter!("route_errors_total", "path" => path.to_owned(), "kind" => err.kind()).increment(1);
    if err.is_logged() && !route.silent {
        error!(path, conn_id = %connection.id(), error = %err, "route handler failed");
    } else {
        trace!(path, conn_id = %connection.id(), error = %err, "route handler failed quietly");
    }
    let _ = connection.send(&Frame::error(err.to_string(), message_id));
    Outcome::Failed
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.route_count())
            .finish_non_exhaustive()
    }
}
