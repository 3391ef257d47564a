/// Configuration management for the flowd engine
///
/// Handles server binding, the advertised callback address, the SQLite store,
/// the type registry, outbound HTTP timeouts and the driver loop interval.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Type registry configuration
    pub registry: RegistryConfig,
    /// Driver loop configuration
    pub engine: EngineConfig,
    /// Outbound HTTP client configuration
    pub http: HttpConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Server port number
    pub port: u16,
    /// `host:port` remote service nodes deliver completion callbacks to
    pub advertise_addr: String,
}

/// SQLite store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database file, created when missing
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Base URL of the type registry (`GET {url}/datatype`)
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Minimum time between two driver ticks
    pub tick_interval_ms: u64,
}

impl EngineConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Limits for every request to service nodes, WEB tasks and callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Whole request, connect to last body byte
    pub request_timeout_ms: u64,
    pub connect_timeout_ms: u64,
}

impl HttpConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 10_000,
            connect_timeout_ms: 3_000,
        }
    }
}

impl Default for Config {
    /// Default configuration with ENV_VAR support for container deployment
    fn default() -> Self {
        let port = std::env::var("FLOWD_PORT")
            .ok()
            .and_then(|port| port.parse().ok())
            .unwrap_or(5000);
        let defaults = HttpConfig::default();

        Self {
            server: ServerConfig {
                host: std::env::var("FLOWD_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port,
                advertise_addr: std::env::var("FLOWD_ADVERTISE_ADDR")
                    .unwrap_or_else(|_| format!("127.0.0.1:{}", port)),
            },
            database: DatabaseConfig {
                path: std::env::var("FLOWD_DATABASE").unwrap_or_else(|_| "datastore.db".to_string()),
            },
            registry: RegistryConfig {
                url: std::env::var("FLOWD_REGISTRY_URL").unwrap_or_else(|_| "http://localhost:5001".to_string()),
            },
            engine: EngineConfig {
                tick_interval_ms: std::env::var("FLOWD_TICK_INTERVAL_MS")
                    .ok()
                    .and_then(|ms| ms.parse().ok())
                    .unwrap_or(500),
            },
            http: HttpConfig {
                request_timeout_ms: env_millis("FLOWD_HTTP_TIMEOUT_MS").unwrap_or(defaults.request_timeout_ms),
                connect_timeout_ms: env_millis("FLOWD_HTTP_CONNECT_TIMEOUT_MS").unwrap_or(defaults.connect_timeout_ms),
            },
        }
    }
}

fn env_millis(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|ms| ms.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advertise_addr_follows_port() {
        let config = Config::default();
        if std::env::var("FLOWD_ADVERTISE_ADDR").is_err() {
            assert_eq!(config.server.advertise_addr, format!("127.0.0.1:{}", config.server.port));
        }
        assert_eq!(config.engine.tick_interval(), Duration::from_millis(config.engine.tick_interval_ms));
    }

    #[test]
    fn test_http_timeouts_are_bounded_by_default() {
        let http = HttpConfig::default();
        assert_eq!(http.request_timeout(), Duration::from_secs(10));
        assert!(http.connect_timeout() <= http.request_timeout());
    }
}
