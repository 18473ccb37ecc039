//! Route tree nodes.
//!
//! A route is built once at boot and frozen when registered. Tree routes are
//! addressed by their method segments joined with `.`; standalone routes are
//! matched by their whole path.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use crate::auth::Authenticator;
use crate::connection::Connection;
use crate::errors::{EngineError, Result};
use crate::filter::MessageFilter;
use crate::handler::{HandlerResult, RouteHandler, handler_fn};

/// Separator between the segments of a tree path.
pub const PATH_SEPARATOR: char = '.';

/// Outbounds re-broadcast after a route succeeds, optionally narrowed to one
/// partition.
#[derive(Clone)]
pub struct Modifies {
    pub(crate) filter: Option<Arc<dyn MessageFilter>>,
    pub(crate) outbounds: Vec<String>,
}

impl Modifies {
    /// Outbound methods this binding refreshes.
    pub fn outbounds(&self) -> &[String] {
        &self.outbounds
    }

    /// Whether the binding targets a single partition.
    pub fn is_filtered(&self) -> bool {
        self.filter.is_some()
    }
}

/// A node of the route tree.
#[derive(Clone, Default)]
pub struct Route {
    pub(crate) method: String,
    pub(crate) authenticator: Option<Authenticator>,
    pub(crate) modifies: Vec<Modifies>,
    pub(crate) children: Vec<Arc<Route>>,
    pub(crate) handler: Option<Arc<dyn RouteHandler>>,
    pub(crate) silent: bool,
    pub(crate) modifies_authentication: bool,
    pub(crate) reports_unauthorized: bool,
}

impl Route {
    /// A route with no handler, gate or children.
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            ..Self::default()
        }
    }

    /// Attach a handler.
    #[must_use]
    pub fn handler(mut self, handler: Arc<dyn RouteHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Attach an async closure as handler.
    #[must_use]
    pub fn handle_with<F, Fut>(self, handler: F) -> Self
    where
        F: Fn(Value, Arc<Connection>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.handler(handler_fn(handler))
    }

    /// Gate this node and everything below it.
    #[must_use]
    pub fn authenticator(mut self, authenticator: Authenticator) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Refresh every subscriber of `outbounds` after success.
    #[must_use]
    pub fn modifies<I, S>(mut self, outbounds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.modifies.push(Modifies {
            filter: None,
            outbounds: outbounds.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Refresh the partition of `outbounds` that `filter` computes from the
    /// handler's reply.
    #[must_use]
    pub fn modifies_filtered<I, S>(mut self, filter: Arc<dyn MessageFilter>, outbounds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.modifies.push(Modifies {
            filter: Some(filter),
            outbounds: outbounds.into_iter().map(Into::into).collect(),
        });
        self
    }

    /// Add a child route.
    #[must_use]
    pub fn child(mut self, child: Route) -> Self {
        self.children.push(Arc::new(child));
        self
    }

    /// Keep handler failures out of the server log.
    #[must_use]
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    /// Re-run auth-sensitive outbound deliveries for the caller after success.
    #[must_use]
    pub fn modifies_authentication(mut self) -> Self {
        self.modifies_authentication = true;
        self
    }

    /// Send an error frame when the gate rejects a request.
    #[must_use]
    pub fn reports_unauthorized(mut self) -> Self {
        self.reports_unauthorized = true;
        self
    }

    /// Method segment.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Child nodes.
    pub fn children(&self) -> &[Arc<Route>] {
        &self.children
    }

    /// Modifies bindings.
    pub fn modifies_bindings(&self) -> &[Modifies] {
        &self.modifies
    }

    /// Whether a handler is attached.
    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    /// Whether a gate is attached.
    pub fn has_authenticator(&self) -> bool {
        self.authenticator.is_some()
    }

    /// Whether handler failures are kept out of the log.
    pub fn is_silent(&self) -> bool {
        self.silent
    }

    /// Whether success triggers auth-sensitive re-delivery.
    pub fn changes_authentication(&self) -> bool {
        self.modifies_authentication
    }

    /// Child with the given method segment.
    pub fn find_child(&self, method: &str) -> Option<&Arc<Route>> {
        self.children.iter().find(|child| child.method == method)
    }

    /// Check method segments and sibling uniqueness of the whole subtree.
    pub(crate) fn validate_tree(&self) -> Result<()> {
        validate_method(&self.method)?;
        if self.method.contains(PATH_SEPARATOR) {
            return Err(EngineError::InvalidRouteMethod {
                method: self.method.clone(),
                reason: "tree route methods cannot contain '.'",
            });
        }
        let mut seen = HashSet::with_capacity(self.children.len());
        for child in &self.children {
            if !seen.insert(child.method.as_str()) {
                return Err(EngineError::DuplicateRoute {
                    method: format!("{}{PATH_SEPARATOR}{}", self.method, child.method),
                });
            }
            child.validate_tree()?;
        }
        Ok(())
    }

    /// Full paths of every node in the subtree, rooted at this node.
    pub(crate) fn paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        self.collect_paths(None, &mut paths);
        paths
    }

    fn collect_paths(&self, prefix: Option<&str>, out: &mut Vec<String>) {
        let path = match prefix {
            Some(prefix) => format!("{prefix}{PATH_SEPARATOR}{}", self.method),
            None => self.method.clone(),
        };
        for child in &self.children {
            child.collect_paths(Some(&path), out);
        }
        out.push(path);
    }
}

pub(crate) fn validate_method(method: &str) -> Result<()> {
    if method.is_empty() {
        return Err(EngineError::InvalidRouteMethod {
            method: method.to_owned(),
            reason: "method cannot be empty",
        });
    }
    Ok(())
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("has_handler", &self.has_handler())
            .field("has_authenticator", &self.has_authenticator())
            .field("modifies", &self.modifies.len())
            .field("children", &self.children)
            .finish_non_exhaustive()
    }
}
