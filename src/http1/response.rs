//! Upstream response classification and byte-exact relay.
//!
//! The proxy never rewrites a relayed response: the head is forwarded as
//! received and the body is streamed through under whichever framing the
//! head declared. Parsing exists only to find the body's end and to decide
//! whether the upstream socket and the client connection stay reusable.

use super::{find_crlf, find_header_end, MAX_HEADER_BYTES};
use crate::net;
use bytes::{Buf, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// Framing classification of one upstream response.
#[derive(Debug)]
pub struct ResponseMeta {
    pub status_code: u16,
    pub chunked: bool,
    pub connection_close: bool,
    pub no_body: bool,
    pub content_length: Option<usize>,
}

/// What the relay decided about each endpoint once the response ended.
#[derive(Debug, Default, Clone, Copy)]
pub struct RelayOutcome {
    pub upstream_reusable: bool,
    pub client_can_keepalive: bool,
}

/// Parse a response head for framing. `req_method` matters because HEAD
/// responses carry no body no matter what the headers claim.
pub fn parse_response_head(raw: &[u8], req_method: &str) -> Option<ResponseMeta> {
    let text = String::from_utf8_lossy(raw);
    let mut lines = text.lines();

    let status_line = lines.next()?;
    let mut parts = status_line.split_whitespace();
    let _version = parts.next()?;
    let status_code: u16 = parts.next()?.parse().ok()?;

    let mut chunked = false;
    let mut content_length = None;
    let mut connection_close = false;
    for line in lines {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        let value = value.trim();
        if name.eq_ignore_ascii_case("transfer-encoding") {
            if value.to_ascii_lowercase().contains("chunked") {
                chunked = true;
            }
        } else if name.eq_ignore_ascii_case("content-length") {
            // A non-numeric length is treated as absent; the relay then
            // falls back to read-until-close framing.
            content_length = value.parse::<usize>().ok();
        } else if name.eq_ignore_ascii_case("connection") {
            if value.to_ascii_lowercase().contains("close") {
                connection_close = true;
            }
        }
    }

    let informational = (100..200).contains(&status_code) && status_code != 101;
    let no_body = req_method.eq_ignore_ascii_case("HEAD")
        || informational
        || status_code == 204
        || status_code == 304;
    let mut meta = ResponseMeta {
        status_code,
        chunked,
        connection_close,
        no_body,
        content_length,
    };
    if meta.no_body {
        meta.chunked = false;
        meta.content_length = Some(0);
    }
    Some(meta)
}

/// Relay one upstream response to the client and decide endpoint reuse.
///
/// The default (all-false) outcome covers every failure: malformed head,
/// framing violations, short reads, and client write errors. Once any head
/// byte has been written there is no recovery path, only closed sockets.
pub async fn relay_response<U, C>(
    upstream: &mut U,
    client: &mut C,
    req_method: &str,
    upstream_timeout: Duration,
    client_timeout: Duration,
) -> RelayOutcome
where
    U: AsyncRead + Unpin,
    C: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(8 * 1024);
    let head_len = loop {
        if let Some(end) = find_header_end(&buf) {
            break end + 4;
        }
        if buf.len() > MAX_HEADER_BYTES {
            return RelayOutcome::default();
        }
        match net::read_buf_timeout(upstream, &mut buf, upstream_timeout).await {
            Ok(0) | Err(_) => return RelayOutcome::default(),
            Ok(_) => {}
        }
    };

    let Some(meta) = parse_response_head(&buf[..head_len], req_method) else {
        return RelayOutcome::default();
    };
    let head = buf.split_to(head_len);
    if net::write_all_timeout(client, &head, client_timeout).await.is_err() {
        return RelayOutcome::default();
    }

    // `buf` now holds whatever body bytes arrived along with the head.
    if meta.no_body {
        if !buf.is_empty() {
            // The upstream broke the framing contract by sending bytes after
            // a bodiless head. Forward them, but never reuse the socket.
            let _ = net::write_all_timeout(client, &buf, client_timeout).await;
            return RelayOutcome::default();
        }
        let reusable = !meta.connection_close;
        return RelayOutcome {
            upstream_reusable: reusable,
            client_can_keepalive: reusable,
        };
    }

    if meta.chunked {
        let complete =
            relay_chunked_body(upstream, client, buf, upstream_timeout, client_timeout).await;
        let keep = complete && !meta.connection_close;
        return RelayOutcome {
            upstream_reusable: keep,
            client_can_keepalive: keep,
        };
    }

    if let Some(length) = meta.content_length {
        let complete =
            relay_sized_body(upstream, client, buf, length, upstream_timeout, client_timeout).await;
        let keep = complete && !meta.connection_close;
        return RelayOutcome {
            upstream_reusable: keep,
            client_can_keepalive: keep,
        };
    }

    // No framing signal at all: stream until upstream EOF. Neither endpoint
    // survives, because only the close delimits the body.
    if !buf.is_empty() && net::write_all_timeout(client, &buf, client_timeout).await.is_err() {
        return RelayOutcome::default();
    }
    buf.clear();
    loop {
        match net::read_buf_timeout(upstream, &mut buf, upstream_timeout).await {
            Ok(0) => break,
            Ok(_) => {
                if net::write_all_timeout(client, &buf, client_timeout).await.is_err() {
                    return RelayOutcome::default();
                }
                buf.clear();
            }
            Err(_) => return RelayOutcome::default(),
        }
    }
    RelayOutcome::default()
}

/// Forward exactly `length` body bytes. Any bytes past the declared length
/// mean the upstream overran its framing; the relay reports failure so the
/// socket is closed.
async fn relay_sized_body<U, C>(
    upstream: &mut U,
    client: &mut C,
    mut buf: BytesMut,
    length: usize,
    upstream_timeout: Duration,
    client_timeout: Duration,
) -> bool
where
    U: AsyncRead + Unpin,
    C: AsyncWrite + Unpin,
{
    let mut sent = 0usize;
    if !buf.is_empty() {
        let first = buf.len().min(length);
        if first > 0
            && net::write_all_timeout(client, &buf[..first], client_timeout).await.is_err()
        {
            return false;
        }
        if buf.len() > length {
            return false;
        }
        sent = first;
        buf.clear();
    }

    while sent < length {
        match net::read_buf_timeout(upstream, &mut buf, upstream_timeout).await {
            Ok(0) | Err(_) => return false,
            Ok(n) => {
                let to_send = n.min(length - sent);
                if net::write_all_timeout(client, &buf[..to_send], client_timeout).await.is_err() {
                    return false;
                }
                sent += to_send;
                if n > to_send {
                    return false;
                }
                buf.clear();
            }
        }
    }
    true
}

/// Forward a chunked body byte-for-byte: size lines (extensions included),
/// chunk data, terminators, and the trailer section through its final blank
/// line. Returns true only when the body completed with nothing after it.
async fn relay_chunked_body<U, C>(
    upstream: &mut U,
    client: &mut C,
    mut buf: BytesMut,
    upstream_timeout: Duration,
    client_timeout: Duration,
) -> bool
where
    U: AsyncRead + Unpin,
    C: AsyncWrite + Unpin,
{
    loop {
        let line_end = loop {
            if let Some(i) = find_crlf(&buf) {
                break i;
            }
            match net::read_buf_timeout(upstream, &mut buf, upstream_timeout).await {
                Ok(0) | Err(_) => return false,
                Ok(_) => {}
            }
        };
        let size_text = String::from_utf8_lossy(&buf[..line_end]).trim().to_string();
        let size_field = size_text.split(';').next().unwrap_or("").trim().to_string();
        let Ok(chunk_size) = usize::from_str_radix(&size_field, 16) else {
            return false;
        };

        if chunk_size == 0 {
            // The blank line closing the trailer section shares its leading
            // CRLF with the size line when there are no trailers, so the
            // search starts at the size line's terminator.
            let end = loop {
                if let Some(i) = find_header_end(&buf[line_end..]) {
                    break line_end + i + 4;
                }
                match net::read_buf_timeout(upstream, &mut buf, upstream_timeout).await {
                    Ok(0) | Err(_) => return false,
                    Ok(_) => {}
                }
            };
            if net::write_all_timeout(client, &buf[..end], client_timeout).await.is_err() {
                return false;
            }
            return end == buf.len();
        }

        let data_start = line_end + 2;
        while buf.len() < data_start + chunk_size + 2 {
            match net::read_buf_timeout(upstream, &mut buf, upstream_timeout).await {
                Ok(0) | Err(_) => return false,
                Ok(_) => {}
            }
        }
        if &buf[data_start + chunk_size..data_start + chunk_size + 2] != b"\r\n" {
            return false;
        }
        let frame = data_start + chunk_size + 2;
        if net::write_all_timeout(client, &buf[..frame], client_timeout).await.is_err() {
            return false;
        }
        buf.advance(frame);
    }
}
