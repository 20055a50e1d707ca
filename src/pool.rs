//! Keyed pool of idle upstream connections.
//!
//! Connections are parked per `host:port` key and handed back newest-first:
//! the most recently used socket is the one most likely to still be open at
//! the remote. Entries expire by idle time and by absolute age, and every
//! handout or return is gated by a non-blocking liveness probe. The internal
//! lock covers bookkeeping only; connecting and probing happen outside it.

use crate::context::ServerContext;
use crate::net;
use crate::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tracing::{debug, trace};

struct PooledConn {
    stream: TcpStream,
    created_at: Instant,
    last_used_at: Instant,
}

/// A connection handed out by [`UpstreamPool::acquire`]. `reused` records
/// whether it came from the idle pool, which decides the one write retry the
/// forwarding engine is allowed.
pub struct AcquiredConn {
    pub stream: TcpStream,
    pub reused: bool,
}

pub struct UpstreamPool {
    ctx: Arc<ServerContext>,
    inner: Mutex<PoolInner>,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Default)]
struct PoolInner {
    by_key: HashMap<String, Vec<PooledConn>>,
    idle_total: usize,
}

impl PoolInner {
    /// Evict entries that are over-idle or over-age and drop empty keys.
    /// Liveness probing is deliberately not done here: it would serialize
    /// socket syscalls behind the lock.
    fn reap(&mut self, now: Instant, idle_timeout: std::time::Duration, max_age: std::time::Duration) {
        let mut evicted = 0usize;
        self.by_key.retain(|_, conns| {
            let before = conns.len();
            conns.retain(|conn| {
                now.duration_since(conn.last_used_at) <= idle_timeout
                    && now.duration_since(conn.created_at) <= max_age
            });
            evicted += before - conns.len();
            !conns.is_empty()
        });
        self.idle_total = self.idle_total.saturating_sub(evicted);
    }

    /// Pop the newest idle entry for `key`, if any.
    fn pop(&mut self, key: &str) -> Option<PooledConn> {
        let conns = self.by_key.get_mut(key)?;
        let conn = conns.pop();
        if conn.is_some() {
            self.idle_total = self.idle_total.saturating_sub(1);
        }
        if conns.is_empty() {
            self.by_key.remove(key);
        }
        conn
    }
}

impl UpstreamPool {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        UpstreamPool {
            ctx,
            inner: Mutex::new(PoolInner::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Hand out a connection for `key`, reusing the warmest idle socket that
    /// passes the liveness probe, or opening a fresh one to `host:port`.
    pub async fn acquire(&self, key: &str, host: &str, port: u16) -> Result<AcquiredConn> {
        let config = &self.ctx.config;
        loop {
            let candidate = {
                let mut inner = self.inner.lock();
                inner.reap(Instant::now(), config.pool_idle_timeout, config.pool_max_age);
                inner.pop(key)
            };
            let Some(conn) = candidate else { break };
            // Probe with the lock already released; a bad socket is simply
            // dropped and the next-newest entry tried.
            if net::socket_is_idle_usable(&conn.stream).await {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(key, "reusing pooled upstream connection");
                return Ok(AcquiredConn { stream: conn.stream, reused: true });
            }
            trace!(key, "pooled connection failed liveness probe, discarding");
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let stream = net::connect_upstream(host, port, config.upstream_connect_timeout).await?;
        trace!(key, "opened fresh upstream connection");
        Ok(AcquiredConn { stream, reused: false })
    }

    /// Park a connection for reuse under `key`. The socket is dropped instead
    /// if it fails the liveness probe or either idle cap is already full.
    pub async fn release(&self, key: &str, stream: TcpStream) {
        if !net::socket_is_idle_usable(&stream).await {
            trace!(key, "dropping connection that failed liveness probe at release");
            return;
        }
        let config = &self.ctx.config;
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.reap(now, config.pool_idle_timeout, config.pool_max_age);
        if inner.idle_total >= config.pool_max_idle_total {
            trace!(key, "idle pool full, dropping connection");
            return;
        }
        let conns = inner.by_key.entry(key.to_string()).or_default();
        if conns.len() >= config.pool_max_idle_per_key {
            trace!(key, "per-key idle cap reached, dropping connection");
            return;
        }
        conns.push(PooledConn {
            stream,
            created_at: now,
            last_used_at: now,
        });
        inner.idle_total += 1;
    }

    /// Close a connection unconditionally.
    pub fn discard(&self, stream: TcpStream) {
        drop(stream);
    }

    pub fn idle_total(&self) -> usize {
        self.inner.lock().idle_total
    }

    pub fn idle_for_key(&self, key: &str) -> usize {
        self.inner.lock().by_key.get(key).map_or(0, Vec::len)
    }

    /// (hits, misses) over the lifetime of the pool.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}
