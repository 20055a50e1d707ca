//! Client request parsing and upstream head serialization.

use super::{find_crlf, find_header_end, MAX_HEADER_BYTES};
use crate::net;
use crate::{Error, Result};
use bytes::{Buf, Bytes, BytesMut};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::Duration;
use tokio::io::AsyncRead;

/// One parsed client request. Lives for a single handler iteration.
#[derive(Debug)]
pub struct Request {
    pub method: String,
    /// Raw request-target bytes, forwarded verbatim.
    pub path: String,
    pub version: String,
    /// Headers in original order with original casing.
    pub headers: Vec<(String, String)>,
    headers_lc: HashMap<String, String>,
    pub body: Bytes,
    /// Bytes received past the end of this message (pipelined input).
    pub leftover: Bytes,
    /// Host header value with any `:port` suffix removed, lowercased.
    pub normalized_host: String,
    pub chunked: bool,
    pub client_wants_keepalive: bool,
}

impl Request {
    /// Case-insensitive header lookup. Duplicate names keep the last value.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers_lc.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// An upgrade needs both an `Upgrade` header and a `Connection` header
    /// mentioning it.
    pub fn is_upgrade(&self) -> bool {
        if self.header("upgrade").is_none() {
            return false;
        }
        self.header("connection")
            .map(|value| value.to_ascii_lowercase().contains("upgrade"))
            .unwrap_or(false)
    }
}

/// Read and frame one request from `stream`.
///
/// `pending` carries pipelined bytes across calls: it is drained on entry and
/// refilled with this message's leftover on success.
pub async fn read_request<S>(
    stream: &mut S,
    pending: &mut BytesMut,
    io_timeout: Duration,
) -> Result<Request>
where
    S: AsyncRead + Unpin,
{
    let mut buf = std::mem::take(pending);
    if buf.capacity() < 8192 {
        buf.reserve(8192);
    }

    let header_end = loop {
        if let Some(end) = find_header_end(&buf) {
            break end;
        }
        if buf.len() > MAX_HEADER_BYTES {
            return Err(Error::parse("request headers too large"));
        }
        if read_client(stream, &mut buf, io_timeout).await? == 0 {
            return Err(Error::client_closed("client closed before request"));
        }
    };

    let head = buf.split_to(header_end + 4);
    let head_text = String::from_utf8_lossy(&head[..header_end]).into_owned();
    let mut lines = head_text.lines();

    let request_line = lines.next().ok_or_else(|| Error::parse("missing request line"))?;
    let mut parts = request_line.split_whitespace();
    let (method, path, version) = match (parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(path), Some(version)) => {
            (method.to_string(), path.to_string(), version.to_string())
        }
        _ => return Err(Error::parse("invalid request line")),
    };

    let mut headers = Vec::new();
    let mut headers_lc = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        // Lines without a colon are dropped.
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim().to_string();
        let value = value.trim().to_string();
        headers_lc.insert(name.to_ascii_lowercase(), value.clone());
        headers.push((name, value));
    }

    let normalized_host = headers_lc
        .get("host")
        .map(|host| {
            let trimmed = host.trim();
            let without_port = trimmed.split(':').next().unwrap_or(trimmed);
            without_port.to_ascii_lowercase()
        })
        .unwrap_or_default();

    let chunked = headers_lc
        .get("transfer-encoding")
        .map(|value| value.to_ascii_lowercase().contains("chunked"))
        .unwrap_or(false);

    // Chunked framing wins; Content-Length is only consulted without it.
    let mut content_length = 0usize;
    if !chunked {
        if let Some(raw) = headers_lc.get("content-length") {
            content_length = raw
                .parse()
                .map_err(|_| Error::parse("invalid content-length"))?;
        }
    }

    let (body, leftover) = if chunked {
        decode_chunked_body(stream, buf, io_timeout).await?
    } else {
        read_sized_body(stream, buf, content_length, io_timeout).await?
    };

    let client_wants_keepalive =
        wants_keepalive(&version, headers_lc.get("connection").map(String::as_str));

    let request = Request {
        method,
        path,
        version,
        headers,
        headers_lc,
        body,
        leftover: Bytes::copy_from_slice(&leftover),
        normalized_host,
        chunked,
        client_wants_keepalive,
    };
    *pending = leftover;
    Ok(request)
}

async fn read_client<S>(stream: &mut S, buf: &mut BytesMut, io_timeout: Duration) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    net::read_buf_timeout(stream, buf, io_timeout)
        .await
        .map_err(|e| Error::parse(format!("recv failed: {e}")))
}

async fn read_sized_body<S>(
    stream: &mut S,
    mut buf: BytesMut,
    content_length: usize,
    io_timeout: Duration,
) -> Result<(Bytes, BytesMut)>
where
    S: AsyncRead + Unpin,
{
    while buf.len() < content_length {
        if read_client(stream, &mut buf, io_timeout).await? == 0 {
            return Err(Error::parse("client closed before full request body"));
        }
    }
    let body = buf.split_to(content_length).freeze();
    Ok((body, buf))
}

/// Decode a chunked request body, returning the payload and any bytes past
/// the trailer section.
async fn decode_chunked_body<S>(
    stream: &mut S,
    mut buf: BytesMut,
    io_timeout: Duration,
) -> Result<(Bytes, BytesMut)>
where
    S: AsyncRead + Unpin,
{
    let mut body = BytesMut::new();
    loop {
        let line_end = wait_for_crlf(stream, &mut buf, io_timeout).await?;
        let size_text = String::from_utf8_lossy(&buf[..line_end]).trim().to_string();
        let size_field = size_text.split(';').next().unwrap_or("").trim();
        let chunk_size = usize::from_str_radix(size_field, 16)
            .map_err(|_| Error::parse("invalid chunk size"))?;
        buf.advance(line_end + 2);

        if chunk_size == 0 {
            // Trailer mode: consume header-like lines until the blank one.
            loop {
                let trailer_end = wait_for_crlf(stream, &mut buf, io_timeout).await?;
                let blank = trailer_end == 0;
                buf.advance(trailer_end + 2);
                if blank {
                    return Ok((body.freeze(), buf));
                }
            }
        }

        while buf.len() < chunk_size + 2 {
            if read_client(stream, &mut buf, io_timeout).await? == 0 {
                return Err(Error::client_closed("client closed connection"));
            }
        }
        body.extend_from_slice(&buf[..chunk_size]);
        if &buf[chunk_size..chunk_size + 2] != b"\r\n" {
            return Err(Error::parse("invalid chunk terminator"));
        }
        buf.advance(chunk_size + 2);
    }
}

async fn wait_for_crlf<S>(stream: &mut S, buf: &mut BytesMut, io_timeout: Duration) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(i) = find_crlf(buf) {
            return Ok(i);
        }
        if read_client(stream, buf, io_timeout).await? == 0 {
            return Err(Error::client_closed("client closed connection"));
        }
    }
}

fn wants_keepalive(version: &str, connection: Option<&str>) -> bool {
    let connection = connection.map(str::to_ascii_lowercase).unwrap_or_default();
    let close = connection.contains("close");
    let keep_alive = connection.contains("keep-alive");
    if version.eq_ignore_ascii_case("HTTP/1.1") {
        return !close;
    }
    if version.eq_ignore_ascii_case("HTTP/1.0") {
        return keep_alive;
    }
    false
}

/// Hop-specific headers and the ones the proxy regenerates itself.
fn should_skip_forward_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "host"
            | "connection"
            | "proxy-connection"
            | "x-forwarded-for"
            | "x-forwarded-host"
            | "x-forwarded-proto"
            | "content-length"
            | "transfer-encoding"
    )
}

/// Serialize the request head (and body, for non-upgrades) sent upstream.
///
/// Passthrough headers keep their original order and casing; the forwarding
/// headers are regenerated. Upgrade requests carry no body and no
/// `Content-Length`; everything else is reframed to a plain `Content-Length`
/// body regardless of how the client framed it.
pub fn build_upstream_request(req: &Request, host_header: &str, upgrade: bool) -> BytesMut {
    let mut head = String::with_capacity(512 + req.path.len());
    let _ = write!(head, "{} {} {}\r\n", req.method, req.path, req.version);

    for (name, value) in &req.headers {
        if should_skip_forward_header(name) {
            continue;
        }
        let _ = write!(head, "{name}: {value}\r\n");
    }

    let _ = write!(head, "Host: {host_header}\r\n");
    let original_host = req.header("host").unwrap_or(host_header);
    let _ = write!(head, "X-Forwarded-Host: {original_host}\r\n");
    head.push_str("X-Forwarded-Proto: http\r\n");

    if upgrade {
        head.push_str("Connection: Upgrade\r\n");
        let _ = write!(head, "Upgrade: {}\r\n", req.header("upgrade").unwrap_or("websocket"));
        head.push_str("\r\n");
        return BytesMut::from(head.as_bytes());
    }

    head.push_str("Connection: keep-alive\r\n");
    let _ = write!(head, "Content-Length: {}\r\n\r\n", req.body.len());
    let mut out = BytesMut::from(head.as_bytes());
    out.extend_from_slice(&req.body);
    out
}
