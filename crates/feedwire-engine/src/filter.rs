//! Partition keys and the filters that compute them.
//!
//! Subscribers of an outbound are bucketed by [`PartitionKey`]. The
//! unfiltered bucket is `None` and holds every subscriber; a filter maps a
//! response and the connection that produced it to an extra bucket.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::connection::Connection;

/// Key of a subscriber partition.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PartitionKey(String);

impl PartitionKey {
    /// Key from any string.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key from a JSON scalar. `null` means "no partition".
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::String(s) => Some(Self(s.clone())),
            other => Some(Self(other.to_string())),
        }
    }

    /// The key text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitionKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for PartitionKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl From<u64> for PartitionKey {
    fn from(key: u64) -> Self {
        Self(key.to_string())
    }
}

impl From<i64> for PartitionKey {
    fn from(key: i64) -> Self {
        Self(key.to_string())
    }
}

/// Maps a response and connection to a subscriber partition.
///
/// On subscription the response is the delivered item array; on a route's
/// `modifies` fan-out it is the route handler's return value.
#[async_trait]
pub trait MessageFilter: Send + Sync {
    /// Partition for this response, `None` for the unfiltered partition.
    async fn partition(&self, response: &Value, connection: &Connection) -> Option<PartitionKey>;
}

struct FnFilter<F>(F);

#[async_trait]
impl<F> MessageFilter for FnFilter<F>
where
    F: Fn(&Value, &Connection) -> Option<PartitionKey> + Send + Sync,
{
    async fn partition(&self, response: &Value, connection: &Connection) -> Option<PartitionKey> {
        (self.0)(response, connection)
    }
}

/// Filter from a synchronous closure.
pub fn filter_fn<F>(filter: F) -> Arc<dyn MessageFilter>
where
    F: Fn(&Value, &Connection) -> Option<PartitionKey> + Send + Sync + 'static,
{
    Arc::new(FnFilter(filter))
}

/// Partition by a field of the response object.
pub fn response_field(field: &'static str) -> Arc<dyn MessageFilter> {
    filter_fn(move |response, _| response.get(field).and_then(PartitionKey::from_value))
}

/// Partition by a session attribute of the connection.
pub fn connection_attribute(key: &'static str) -> Arc<dyn MessageFilter> {
    filter_fn(move |_, connection| {
        connection
            .attribute(key)
            .as_ref()
            .and_then(PartitionKey::from_value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn conn() -> Connection {
        let (tx, _rx) = mpsc::channel(1);
        Connection::new(tx, None, false)
    }

    #[test]
    fn key_from_value() {
        assert_eq!(PartitionKey::from_value(&json!(null)), None);
        assert_eq!(PartitionKey::from_value(&json!("a")), Some("a".into()));
        assert_eq!(PartitionKey::from_value(&json!(5)), Some(PartitionKey::from(5u64)));
        assert_eq!(PartitionKey::from_value(&json!(true)).unwrap().as_str(), "true");
    }

    #[test]
    fn numeric_and_string_keys_coincide() {
        assert_eq!(
            PartitionKey::from_value(&json!(7)),
            PartitionKey::from_value(&json!("7"))
        );
    }

    #[test]
    fn display_and_serde() {
        let key = PartitionKey::new("room-1");
        assert_eq!(key.to_string(), "room-1");
        assert_eq!(serde_json::to_value(&key).unwrap(), json!("room-1"));
    }

    #[tokio::test]
    async fn response_field_filter() {
        let filter = response_field("roomId");
        let c = conn();
        assert_eq!(
            filter.partition(&json!({"roomId": 3}), &c).await,
            Some(PartitionKey::from(3u64))
        );
        assert_eq!(filter.partition(&json!({"other": 3}), &c).await, None);
        assert_eq!(filter.partition(&json!([1, 2]), &c).await, None);
    }

    #[tokio::test]
    async fn connection_attribute_filter() {
        let filter = connection_attribute("room");
        let c = conn();
        assert_eq!(filter.partition(&json!([]), &c).await, None);
        c.set_attribute("room", json!("lobby"));
        assert_eq!(
            filter.partition(&json!([]), &c).await,
            Some(PartitionKey::new("lobby"))
        );
    }
}
