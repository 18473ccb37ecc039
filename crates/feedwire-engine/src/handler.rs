//! Route handler and outbound producer seams.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use feedwire_core::frame::is_unauthorized_marker;
use feedwire_core::HandlerError;
use serde_json::Value;

use crate::connection::Connection;

/// Successful route handler outcome.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    /// Send this value back on `"m." + path`.
    Value(Value),
    /// Completed without a reply frame.
    Empty,
    /// The request was not allowed.
    Unauthorized,
}

impl From<Value> for Reply {
    /// Legacy unauthorized marker strings become [`Reply::Unauthorized`].
    fn from(value: Value) -> Self {
        if is_unauthorized_marker(&value) {
            Self::Unauthorized
        } else {
            Self::Value(value)
        }
    }
}

/// Result of a route handler.
pub type HandlerResult = Result<Reply, HandlerError>;

/// Handles a routed request.
#[async_trait]
pub trait RouteHandler: Send + Sync {
    /// Handle `payload` sent by `connection`.
    async fn handle(&self, payload: Value, connection: Arc<Connection>) -> HandlerResult;
}

/// [`RouteHandler`] backed by an async closure.
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> RouteHandler for FnHandler<F>
where
    F: Fn(Value, Arc<Connection>) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, payload: Value, connection: Arc<Connection>) -> HandlerResult {
        (self.0)(payload, connection).await
    }
}

/// Wrap an async closure as a route handler.
pub fn handler_fn<F, Fut>(handler: F) -> Arc<dyn RouteHandler>
where
    F: Fn(Value, Arc<Connection>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler(handler))
}

/// One page of a larger collection.
#[derive(Clone, Debug, PartialEq)]
pub struct PartialResult {
    /// Items in this page.
    pub items: Vec<Value>,
    /// Length of the whole collection.
    pub total_length: u64,
}

/// What an outbound producer returns.
#[derive(Clone, Debug, PartialEq)]
pub enum FeedData {
    /// The whole collection.
    Items(Vec<Value>),
    /// A page plus the total length.
    Partial(PartialResult),
    /// The connection may not see this feed.
    Unauthorized,
}

impl From<Vec<Value>> for FeedData {
    fn from(items: Vec<Value>) -> Self {
        Self::Items(items)
    }
}

impl From<PartialResult> for FeedData {
    fn from(result: PartialResult) -> Self {
        Self::Partial(result)
    }
}

/// Produces the current data of an outbound for one connection.
#[async_trait]
pub trait Producer: Send + Sync {
    /// Fetch data, limited to `count` items or to the item whose identity is `id`.
    async fn produce(
        &self,
        connection: Arc<Connection>,
        count: Option<u64>,
        id: Option<Value>,
    ) -> Result<FeedData, HandlerError>;
}

/// [`Producer`] backed by an async closure.
pub struct FnProducer<F>(F);

#[async_trait]
impl<F, Fut> Producer for FnProducer<F>
where
    F: Fn(Arc<Connection>, Option<u64>, Option<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<FeedData, HandlerError>> + Send + 'static,
{
    async fn produce(
        &self,
        connection: Arc<Connection>,
        count: Option<u64>,
        id: Option<Value>,
    ) -> Result<FeedData, HandlerError> {
        (self.0)(connection, count, id).await
    }
}

/// Wrap an async closure as a producer.
pub fn producer_fn<F, Fut>(producer: F) -> Arc<dyn Producer>
where
    F: Fn(Arc<Connection>, Option<u64>, Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<FeedData, HandlerError>> + Send + 'static,
{
    Arc::new(FnProducer(producer))
}
