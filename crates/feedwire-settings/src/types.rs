//! Settings types.

use serde::{Deserialize, Serialize};

/// Root settings object.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FeedwireSettings {
    /// WebSocket transport settings.
    pub server: ServerSettings,
    /// Delivery engine settings.
    pub engine: EngineSettings,
    /// Logging settings.
    pub logging: LoggingSettings,
}

/// WebSocket transport settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` picks a free port).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
    /// Per-connection outbound queue capacity, in frames.
    pub send_buffer_size: usize,
    /// Interval between server Ping frames.
    pub ping_interval_secs: u64,
    /// Close the connection after this long without a Pong.
    pub pong_timeout_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            max_connections: 1024,
            max_message_size: 16 * 1024 * 1024,
            send_buffer_size: 1024,
            ping_interval_secs: 30,
            pong_timeout_secs: 60,
        }
    }
}

/// Delivery engine settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    /// Enables the cache-probe protocol for connections that support it.
    pub cache_enabled: bool,
    /// Delivered snapshots remembered per outbound, keyed by content hash.
    pub snapshot_memory: usize,
    /// Initial value of each connection's frame logging flag.
    pub log_frames: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            snapshot_memory: 32,
            log_frames: false,
        }
    }
}

/// Logging settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of the compact format.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let s = FeedwireSettings::default();
        assert_eq!(s.server.host, "127.0.0.1");
        assert_eq!(s.server.port, 8080);
        assert_eq!(s.server.max_connections, 1024);
        assert_eq!(s.server.max_message_size, 16 * 1024 * 1024);
        assert!(s.engine.cache_enabled);
        assert_eq!(s.engine.snapshot_memory, 32);
        assert!(!s.engine.log_frames);
        assert_eq!(s.logging.level, "info");
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(FeedwireSettings::default()).unwrap();
        assert!(json["server"]["maxConnections"].is_number());
        assert!(json["engine"]["cacheEnabled"].is_boolean());
        assert!(json["engine"]["snapshotMemory"].is_number());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: FeedwireSettings =
            serde_json::from_str(r#"{"engine": {"cacheEnabled": false}}"#).unwrap();
        assert!(!s.engine.cache_enabled);
        assert_eq!(s.engine.snapshot_memory, 32);
        assert_eq!(s.server, ServerSettings::default());
    }
}
