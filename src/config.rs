//! Server configuration: the numeric constants fixed by the spec, grouped
//! into sub-structs the way the teacher's `rust-ai-ide-core/src/config.rs`
//! groups `CoreConfig`/`NetworkConfig`/`PerformanceConfig`, minus the
//! internal `Config` trait and YAML/TOML loading that crate depends on
//! (unavailable standalone, and unneeded here: only environment overrides
//! and the wire JSON format are in scope).

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub health_check_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    pub buffer_retention_secs: u64,
    pub presence_ttl_secs: u64,
    pub session_ttl_secs: u64,
    pub rate_limit_idle_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 30,
            cleanup_interval_secs: 60,
            buffer_retention_secs: 300,
            presence_ttl_secs: 300,
            session_ttl_secs: 24 * 3600,
            rate_limit_idle_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub cache_ttl_secs: u64,
    pub call_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 30,
            call_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    pub sample_window: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { sample_window: 1000 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub bind_address: String,
    pub port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

/// Top-level configuration, assembled from environment variables by the
/// server binary and otherwise falling back to the spec's fixed defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub network: NetworkConfig,
    pub rate_limit: RateLimitConfig,
    pub retention: RetentionConfig,
    pub store: StoreConfig,
    pub metrics: MetricsConfig,
}

impl Config {
    /// Builds a `Config` from defaults, overridden by any of
    /// `COLLAB_BIND_ADDRESS`, `COLLAB_PORT`, `COLLAB_RATE_LIMIT_MAX_REQUESTS`
    /// that are set in the process environment.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("COLLAB_BIND_ADDRESS") {
            config.network.bind_address = addr;
        }
        if let Ok(port) = std::env::var("COLLAB_PORT") {
            if let Ok(port) = port.parse() {
                config.network.port = port;
            }
        }
        if let Ok(max) = std::env::var("COLLAB_RATE_LIMIT_MAX_REQUESTS") {
            if let Ok(max) = max.parse() {
                config.rate_limit.max_requests = max;
            }
        }

        config
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.retention.health_check_interval_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.retention.cleanup_interval_secs)
    }

    pub fn buffer_retention(&self) -> Duration {
        Duration::from_secs(self.retention.buffer_retention_secs)
    }

    pub fn store_call_timeout(&self) -> Duration {
        Duration::from_secs(self.store.call_timeout_secs)
    }
}
