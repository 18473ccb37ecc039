//! Composable authentication gates.
//!
//! An [`Authenticator`] wraps one [`AuthCheck`] plus two flat lists:
//!
//! - `and`: requirements that must all pass alongside the check
//! - `or`: alternatives tried in declaration order when that fails
//!
//! A gate passes when `check && all(and) || any(or)`. Appending only pushes
//! onto the head's lists, so an alternative built earlier keeps its meaning.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::connection::Connection;

/// A single authentication predicate.
#[async_trait]
pub trait AuthCheck: Send + Sync {
    /// Whether `connection` may make a request with `payload`.
    async fn authenticate(&self, connection: &Connection, payload: &Value) -> bool;
}

struct FnCheck<F>(F);

#[async_trait]
impl<F> AuthCheck for FnCheck<F>
where
    F: Fn(&Connection, &Value) -> bool + Send + Sync,
{
    async fn authenticate(&self, connection: &Connection, payload: &Value) -> bool {
        (self.0)(connection, payload)
    }
}

/// Authentication gate with `or` / `and` chains.
#[derive(Clone)]
pub struct Authenticator {
    check: Arc<dyn AuthCheck>,
    ors: Vec<Authenticator>,
    ands: Vec<Authenticator>,
}

impl Authenticator {
    /// Gate on an async check.
    pub fn new(check: impl AuthCheck + 'static) -> Self {
        Self {
            check: Arc::new(check),
            ors: Vec::new(),
            ands: Vec::new(),
        }
    }

    /// Gate on a synchronous predicate.
    pub fn from_fn<F>(check: F) -> Self
    where
        F: Fn(&Connection, &Value) -> bool + Send + Sync + 'static,
    {
        Self::new(FnCheck(check))
    }

    /// Passes when the connection carries an auth token.
    pub fn authenticated() -> Self {
        Self::from_fn(|connection, _| connection.is_authenticated())
    }

    /// Always passes.
    pub fn allow_all() -> Self {
        Self::from_fn(|_, _| true)
    }

    /// Always fails.
    pub fn deny_all() -> Self {
        Self::from_fn(|_, _| false)
    }

    /// Append an alternative tried after every previously declared one.
    #[must_use]
    pub fn or(mut self, alternative: Authenticator) -> Self {
        self.ors.push(alternative);
        self
    }

    /// Append a requirement checked after every previously declared one.
    #[must_use]
    pub fn and(mut self, requirement: Authenticator) -> Self {
        self.ands.push(requirement);
        self
    }

    /// Evaluate the gate.
    pub fn check_authentication<'a>(
        &'a self,
        connection: &'a Connection,
        payload: &'a Value,
    ) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            if self.check.authenticate(connection, payload).await
                && self.requirements_pass(connection, payload).await
            {
                return true;
            }
            for alternative in &self.ors {
                if alternative.check_authentication(connection, payload).await {
                    return true;
                }
            }
            false
        })
    }

    async fn requirements_pass(&self, connection: &Connection, payload: &Value) -> bool {
        for requirement in &self.ands {
            if !requirement.check_authentication(connection, payload).await {
                return false;
            }
        }
        true
    }
}

impl std::fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("or", &self.ors.len())
            .field("and", &self.ands.len())
            .finish_non_exhaustive()
    }
}
