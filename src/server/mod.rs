//! Listener, admission control, and handler spawning.

mod handler;
mod tunnel;

use crate::context::ServerContext;
use crate::http1;
use crate::net;
use crate::pool::UpstreamPool;
use crate::routes::RouteTable;
use crate::{ProxyConfig, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

/// Reserved request path answered by the proxy itself.
pub const HEALTH_PATH: &str = "/_flow/domains/health";

/// One proxy instance: shared context, route table, and upstream pool.
pub struct Server {
    ctx: Arc<ServerContext>,
    routes: Arc<RouteTable>,
    pool: Arc<UpstreamPool>,
}

impl Server {
    pub fn new(config: ProxyConfig) -> Self {
        let routes_path = config.routes.clone();
        let ctx = Arc::new(ServerContext::new(config));
        let routes = Arc::new(RouteTable::new(routes_path));
        let pool = Arc::new(UpstreamPool::new(ctx.clone()));
        Server { ctx, routes, pool }
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    pub fn pool(&self) -> &Arc<UpstreamPool> {
        &self.pool
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    /// Accept loop. Runs until the listener is closed or the running flag is
    /// cleared; in-flight handlers are left to finish on their own.
    pub async fn run(&self, listener: TcpListener) -> Result<()> {
        info!("accepting connections");
        while self.ctx.is_running() {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    if !self.ctx.is_running() {
                        break;
                    }
                    warn!("accept error: {}", e);
                    continue;
                }
            };
            self.admit(stream, peer);
        }
        Ok(())
    }

    /// Claim an admission slot for the connection or fast-reject it with a
    /// 503. The slot is released when the handler task finishes.
    fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        let Some(slot) = self.ctx.try_acquire_client_slot() else {
            debug!(%peer, "rejecting client, handler capacity reached");
            let io_timeout = self.ctx.config.client_io_timeout;
            tokio::spawn(async move {
                let mut stream = stream;
                let resp = http1::local_response(
                    503,
                    "Service Unavailable",
                    "Proxy overloaded, retry shortly\n",
                    false,
                );
                let _ = net::write_all_timeout(&mut stream, resp.as_bytes(), io_timeout).await;
            });
            return;
        };

        let ctx = self.ctx.clone();
        let routes = self.routes.clone();
        let pool = self.pool.clone();
        tokio::spawn(async move {
            let _slot = slot;
            handler::handle_client(ctx, routes, pool, stream, peer).await;
        });
    }
}
