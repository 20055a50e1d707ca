//! Per-client forwarding engine.
//!
//! Each accepted connection gets one handler task running this loop: read a
//! request, resolve its host to an upstream, forward, relay the response, and
//! keep going while both sides stay reusable. A single-slot upstream cache
//! makes back-to-back requests to the same key skip the pool entirely; on a
//! key change the cached socket is released to the pool, not closed.

use super::tunnel;
use super::HEALTH_PATH;
use crate::context::ServerContext;
use crate::http1::{self, build_upstream_request, read_request, relay_response};
use crate::net;
use crate::pool::UpstreamPool;
use crate::routes::RouteTable;
use crate::Error;
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, trace};

pub(crate) async fn handle_client(
    ctx: Arc<ServerContext>,
    routes: Arc<RouteTable>,
    pool: Arc<UpstreamPool>,
    mut client: TcpStream,
    peer: SocketAddr,
) {
    debug!(%peer, "client connected");
    let client_io = ctx.config.client_io_timeout;
    let upstream_io = ctx.config.upstream_io_timeout;

    let mut pending = BytesMut::new();
    let mut cached: Option<(TcpStream, String)> = None;

    while ctx.is_running() {
        let req = match read_request(&mut client, &mut pending, client_io).await {
            Ok(req) => req,
            Err(err) if err.is_client_disconnect() => {
                trace!(%peer, reason = %err, "client session ended");
                break;
            }
            Err(err) => {
                send_local(&mut client, client_io, 400, "Bad Request", &format!("{err}\n")).await;
                break;
            }
        };

        if req.path == HEALTH_PATH {
            let keep = req.client_wants_keepalive;
            let resp = http1::local_response(200, "OK", &ctx.health_body(), keep);
            if net::write_all_timeout(&mut client, resp.as_bytes(), client_io).await.is_err()
                || !keep
            {
                break;
            }
            continue;
        }

        if req.normalized_host.is_empty() {
            send_local(&mut client, client_io, 400, "Bad Request", "Missing Host header\n").await;
            break;
        }

        let Some(target) = routes.lookup(&req.normalized_host) else {
            debug!(%peer, host = %req.normalized_host, "no route for host");
            let body = format!("No local route configured for {}\n", req.normalized_host);
            send_local(&mut client, client_io, 404, "Not Found", &body).await;
            break;
        };

        let Some((upstream_host, upstream_port)) = net::parse_host_port(&target) else {
            send_local(&mut client, client_io, 502, "Bad Gateway", "Invalid target route\n").await;
            break;
        };

        let upgrade = req.is_upgrade();
        let upstream_key = format!("{upstream_host}:{upstream_port}");
        trace!(%peer, method = %req.method, path = %req.path, key = %upstream_key, upgrade, "forwarding request");

        if upgrade {
            // Upgrade tunnels are one-shot; the keepalive cache is moot.
            release_cached(&pool, &mut cached).await;
        }

        let mut from_cache = None;
        if !upgrade {
            if let Some((stream, key)) = cached.take() {
                if key == upstream_key {
                    from_cache = Some(stream);
                } else {
                    pool.release(&key, stream).await;
                }
            }
        }

        let (mut upstream, was_pooled) = match from_cache {
            Some(stream) => (stream, true),
            None => {
                let acquired = if upgrade {
                    net::connect_upstream(
                        &upstream_host,
                        upstream_port,
                        ctx.config.upstream_connect_timeout,
                    )
                    .await
                    .map(|stream| (stream, false))
                } else {
                    pool.acquire(&upstream_key, &upstream_host, upstream_port)
                        .await
                        .map(|conn| (conn.stream, conn.reused))
                };
                match acquired {
                    Ok(pair) => pair,
                    Err(Error::ConnectTimeout(reason)) => {
                        debug!(%peer, %reason, "upstream connect timed out");
                        send_local(
                            &mut client,
                            client_io,
                            504,
                            "Gateway Timeout",
                            "Upstream connect timed out\n",
                        )
                        .await;
                        break;
                    }
                    Err(err) => {
                        debug!(%peer, %err, "upstream connect failed");
                        send_local(
                            &mut client,
                            client_io,
                            502,
                            "Bad Gateway",
                            "Upstream connection failed\n",
                        )
                        .await;
                        break;
                    }
                }
            }
        };

        let host_header = if upstream_host == "127.0.0.1" || upstream_host == "::1" {
            "localhost"
        } else {
            upstream_host.as_str()
        };
        let head = build_upstream_request(&req, host_header, upgrade);

        if net::write_all_timeout(&mut upstream, &head, upstream_io).await.is_err() {
            // Stale keepalive sockets routinely die on the first write; a
            // pooled socket gets exactly one retry on a fresh acquisition.
            let mut replacement = None;
            drop(upstream);
            if !upgrade && was_pooled {
                if let Ok(conn) =
                    pool.acquire(&upstream_key, &upstream_host, upstream_port).await
                {
                    let mut retry = conn.stream;
                    if net::write_all_timeout(&mut retry, &head, upstream_io).await.is_ok() {
                        debug!(%peer, key = %upstream_key, "retried request on fresh upstream socket");
                        replacement = Some(retry);
                    }
                }
            }
            match replacement {
                Some(stream) => upstream = stream,
                None => {
                    send_local(
                        &mut client,
                        client_io,
                        502,
                        "Bad Gateway",
                        "Failed to forward request\n",
                    )
                    .await;
                    break;
                }
            }
        }

        if upgrade {
            if !req.leftover.is_empty()
                && net::write_all_timeout(&mut upstream, &req.leftover, upstream_io)
                    .await
                    .is_err()
            {
                break;
            }
            pending.clear();
            debug!(%peer, key = %upstream_key, "tunneling upgraded connection");
            tunnel::pump_bidirectional(client, upstream, client_io, upstream_io).await;
            debug!(%peer, "client disconnected");
            return;
        }

        let outcome =
            relay_response(&mut upstream, &mut client, &req.method, upstream_io, client_io).await;

        if outcome.upstream_reusable {
            cached = Some((upstream, upstream_key));
        } else {
            pool.discard(upstream);
        }

        if !(req.client_wants_keepalive && outcome.client_can_keepalive) {
            break;
        }
    }

    release_cached(&pool, &mut cached).await;
    debug!(%peer, "client disconnected");
}

async fn release_cached(pool: &UpstreamPool, cached: &mut Option<(TcpStream, String)>) {
    if let Some((stream, key)) = cached.take() {
        pool.release(&key, stream).await;
    }
}

/// Write a proxy-generated error response, best-effort.
async fn send_local(
    client: &mut TcpStream,
    io_timeout: Duration,
    status: u16,
    reason: &str,
    body: &str,
) {
    let resp = http1::local_response(status, reason, body, false);
    let _ = net::write_all_timeout(client, resp.as_bytes(), io_timeout).await;
}
