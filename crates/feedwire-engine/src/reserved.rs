//! Protocol routes every engine serves.
//!
//! - `___cache`: the client's reply to a cache probe
//! - `request.<method>`: lazy-load trigger for an outbound
//! - `___browser`: browser metadata, recorded once
//! - `___ip`: replies with the peer IP, once per connection

use std::sync::Arc;

use feedwire_core::HandlerError;
use feedwire_core::frame::{BROWSER_METHOD, CACHE_METHOD, Frame, IP_METHOD, REQUEST_PREFIX};
use serde_json::Value;
use tracing::debug;

use crate::connection::{BrowserInfo, Connection, RequestConfig};
use crate::handler::Reply;
use crate::outbound::{CacheProbe, Delivery, Outbound, OutboundRegistry};
use crate::route::Route;

/// Path of the lazy-load trigger for `method`.
pub fn request_path(method: &str) -> String {
    format!("{REQUEST_PREFIX}{method}")
}

/// `___cache`: resolve a probe reply against the named outbound.
pub fn cache_route(outbounds: Arc<OutboundRegistry>) -> Route {
    Route::new(CACHE_METHOD)
        .reports_unauthorized()
        .handle_with(move |payload, connection| {
            let outbounds = Arc::clone(&outbounds);
            async move {
                let probe: CacheProbe = serde_json::from_value(payload)?;
                let outbound = outbounds
                    .get(&probe.method)
                    .map_err(|err| HandlerError::failed(err.to_string()))?;
                let delivery = outbound
                    .handle_cache_probe(&connection, probe)
                    .await
                    .map_err(|err| err.into_handler_error())?;
                if delivery == Delivery::Unauthorized {
                    withdraw_cached(&outbound, &connection);
                    return Err(HandlerError::Unauthorized);
                }
                Ok(Reply::Empty)
            }
        })
}

fn withdraw_cached(outbound: &Outbound, connection: &Connection) {
    let _ = connection.send(&Frame::cache_delete(outbound.method()));
    outbound.revoke(connection);
}

/// `request.<method>`: deliver a lazy outbound on demand.
pub fn lazy_route(outbound: Arc<Outbound>) -> Route {
    Route::new(request_path(outbound.method()))
        .reports_unauthorized()
        .handle_with(move |payload, connection| {
            let outbound = Arc::clone(&outbound);
            async move {
                let config: RequestConfig = if payload.is_null() {
                    RequestConfig::default()
                } else {
                    serde_json::from_value(payload)?
                };
                match outbound
                    .send_to(&connection, Some(config))
                    .await
                    .map_err(|err| err.into_handler_error())?
                {
                    Delivery::Unauthorized => Err(HandlerError::Unauthorized),
                    _ => Ok(Reply::Empty),
                }
            }
        })
}

/// `___browser`: record browser metadata once. Never replies.
pub fn browser_route() -> Route {
    Route::new(BROWSER_METHOD).handle_with(|payload, connection: Arc<Connection>| async move {
        let info: BrowserInfo = serde_json::from_value(payload).unwrap_or_default();
        if connection.set_browser_once(info) {
            debug!(conn_id = %connection.id(), browser = ?connection.browser(), "browser reported");
        }
        Ok(Reply::Empty)
    })
}

/// `___ip`: reply with the peer IP the first time it is asked.
pub fn ip_route() -> Route {
    Route::new(IP_METHOD).handle_with(|_, connection: Arc<Connection>| async move {
        if !connection.take_ip_report() {
            return Ok(Reply::Empty);
        }
        let ip = connection
            .remote_addr()
            .map_or(Value::Null, |addr| Value::String(addr.ip().to_string()));
        Ok(Reply::Value(ip))
    })
}
