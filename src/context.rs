//! Shared per-process server state.
//!
//! `ServerContext` carries the configuration, the admission counters, and the
//! running flag. It is handed to the listener, every client handler, and the
//! upstream pool; all counters are atomics so readers never take a lock.

use crate::config::ProxyConfig;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

pub struct ServerContext {
    pub config: ProxyConfig,
    active_clients: AtomicUsize,
    overload_rejections: AtomicU64,
    running: AtomicBool,
}

/// Admission slot held by one client handler. Dropping it releases the slot.
pub struct ClientSlot {
    ctx: Arc<ServerContext>,
}

impl Drop for ClientSlot {
    fn drop(&mut self) {
        self.ctx.active_clients.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ServerContext {
    pub fn new(mut config: ProxyConfig) -> Self {
        config.normalize();
        ServerContext {
            config,
            active_clients: AtomicUsize::new(0),
            overload_rejections: AtomicU64::new(0),
            running: AtomicBool::new(true),
        }
    }

    /// Try to claim an admission slot. Failure counts as an overload
    /// rejection.
    pub fn try_acquire_client_slot(self: &Arc<Self>) -> Option<ClientSlot> {
        let prev = self.active_clients.fetch_add(1, Ordering::AcqRel);
        if prev >= self.config.max_active_clients {
            self.active_clients.fetch_sub(1, Ordering::AcqRel);
            self.overload_rejections.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        Some(ClientSlot { ctx: Arc::clone(self) })
    }

    pub fn active_clients(&self) -> usize {
        self.active_clients.load(Ordering::Relaxed)
    }

    pub fn overload_rejections(&self) -> u64 {
        self.overload_rejections.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    /// One-line plain-text counters body served on the health path.
    pub fn health_body(&self) -> String {
        let config = &self.config;
        format!(
            "ok active_clients={} overload_rejections={} max_active_clients={} \
             upstream_connect_timeout_ms={} upstream_io_timeout_ms={} client_io_timeout_ms={} \
             pool_max_idle_per_key={} pool_max_idle_total={} pool_idle_timeout_ms={} \
             pool_max_age_ms={}\n",
            self.active_clients(),
            self.overload_rejections(),
            config.max_active_clients,
            config.upstream_connect_timeout.as_millis(),
            config.upstream_io_timeout.as_millis(),
            config.client_io_timeout.as_millis(),
            config.pool_max_idle_per_key,
            config.pool_max_idle_total,
            config.pool_idle_timeout.as_millis(),
            config.pool_max_age.as_millis(),
        )
    }
}
