//! Runtime configuration.
//!
//! The configuration surface is a flat set of tunables populated from the
//! command line; there is no config file. `normalize` is applied before the
//! values are shared so that dependent limits stay consistent.

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:80";
pub const DEFAULT_MAX_ACTIVE_CLIENTS: usize = 128;
pub const DEFAULT_UPSTREAM_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_UPSTREAM_IO_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_CLIENT_IO_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_POOL_MAX_IDLE_PER_KEY: usize = 8;
pub const DEFAULT_POOL_MAX_IDLE_TOTAL: usize = 256;
pub const DEFAULT_POOL_IDLE_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_POOL_MAX_AGE_MS: u64 = 120_000;

/// Full configuration for one proxy process.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address the client listener binds to (`host:port`, IPv4 literal).
    pub listen: String,
    /// Path of the routes file scanned for `"host":"target"` pairs.
    pub routes: PathBuf,
    /// Path of the pidfile written at startup.
    pub pidfile: PathBuf,
    /// When set, the listener is obtained from launchd instead of bound.
    pub launchd_socket: Option<String>,
    /// Cap on concurrently served clients; excess connections get a 503.
    pub max_active_clients: usize,
    pub upstream_connect_timeout: Duration,
    pub upstream_io_timeout: Duration,
    pub client_io_timeout: Duration,
    pub pool_max_idle_per_key: usize,
    pub pool_max_idle_total: usize,
    pub pool_idle_timeout: Duration,
    pub pool_max_age: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            listen: DEFAULT_LISTEN.to_string(),
            routes: PathBuf::from("routes.json"),
            pidfile: PathBuf::from("domainsd.pid"),
            launchd_socket: None,
            max_active_clients: DEFAULT_MAX_ACTIVE_CLIENTS,
            upstream_connect_timeout: Duration::from_millis(DEFAULT_UPSTREAM_CONNECT_TIMEOUT_MS),
            upstream_io_timeout: Duration::from_millis(DEFAULT_UPSTREAM_IO_TIMEOUT_MS),
            client_io_timeout: Duration::from_millis(DEFAULT_CLIENT_IO_TIMEOUT_MS),
            pool_max_idle_per_key: DEFAULT_POOL_MAX_IDLE_PER_KEY,
            pool_max_idle_total: DEFAULT_POOL_MAX_IDLE_TOTAL,
            pool_idle_timeout: Duration::from_millis(DEFAULT_POOL_IDLE_TIMEOUT_MS),
            pool_max_age: Duration::from_millis(DEFAULT_POOL_MAX_AGE_MS),
        }
    }
}

impl ProxyConfig {
    /// Silently raise the global idle cap to at least the per-key cap.
    pub fn normalize(&mut self) {
        if self.pool_max_idle_total < self.pool_max_idle_per_key {
            self.pool_max_idle_total = self.pool_max_idle_per_key;
        }
    }
}
