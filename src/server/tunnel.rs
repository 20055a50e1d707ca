//! Bidirectional byte relay for upgraded connections.
//!
//! After a successful upgrade handshake the two sockets become an opaque
//! tunnel: one pump per direction copies bytes until EOF, error, or the
//! opposite pump finishing. Each pump half-closes its write side on exit so
//! the peer sees a clean FIN, and a shared flag stops the other direction at
//! its next read.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

const TUNNEL_BUFFER_SIZE: usize = 16 * 1024;

/// Relay bytes in both directions until both pumps finish.
pub(crate) async fn pump_bidirectional(
    client: TcpStream,
    upstream: TcpStream,
    client_io_timeout: Duration,
    upstream_io_timeout: Duration,
) {
    let done = Arc::new(AtomicBool::new(false));
    let (client_read, client_write) = client.into_split();
    let (upstream_read, upstream_write) = upstream.into_split();

    let flag = done.clone();
    let downstream = tokio::spawn(async move {
        pump(upstream_read, client_write, upstream_io_timeout, client_io_timeout, flag).await
    });
    let sent = pump(client_read, upstream_write, client_io_timeout, upstream_io_timeout, done).await;
    let received = downstream.await.unwrap_or(0);

    debug!(sent, received, "tunnel closed");
}

async fn pump(
    mut src: OwnedReadHalf,
    mut dst: OwnedWriteHalf,
    read_timeout: Duration,
    write_timeout: Duration,
    done: Arc<AtomicBool>,
) -> u64 {
    let mut buf = [0u8; TUNNEL_BUFFER_SIZE];
    let mut total = 0u64;
    while !done.load(Ordering::Relaxed) {
        let n = match timeout(read_timeout, src.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => n,
            Ok(Err(_)) | Err(_) => break,
        };
        match timeout(write_timeout, dst.write_all(&buf[..n])).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) | Err(_) => break,
        }
        total += n as u64;
    }
    done.store(true, Ordering::Relaxed);
    // Half-close towards the peer; the read half closes when dropped.
    let _ = dst.shutdown().await;
    total
}
