//! HTTP/1.1 message framing for both sides of the proxy.
//!
//! Requests are parsed just far enough to route and reframe them; responses
//! are parsed only to classify their body framing so the relay can forward
//! bytes unchanged and decide whether either socket stays reusable.

pub mod request;
pub mod response;

pub use request::{build_upstream_request, read_request, Request};
pub use response::{parse_response_head, relay_response, RelayOutcome, ResponseMeta};

/// Header stamped on every response the proxy generates itself.
pub const PROXY_HEADER_NAME: &str = "X-Flow-Domainsd";
pub const PROXY_HEADER_VALUE: &str = "1";

/// Cap on an accumulated header block, either direction.
pub const MAX_HEADER_BYTES: usize = 1024 * 1024;

/// Find the `\r\n\r\n` ending a header block, returning the index of its
/// first byte.
pub(crate) fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

pub(crate) fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Serialize a response generated by the proxy itself. Error responses always
/// close; the health endpoint passes the client's keep-alive preference.
pub fn local_response(status: u16, reason: &str, body: &str, keep_alive: bool) -> String {
    let connection = if keep_alive { "keep-alive" } else { "close" };
    format!(
        "HTTP/1.1 {status} {reason}\r\n\
         {PROXY_HEADER_NAME}: {PROXY_HEADER_VALUE}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: {connection}\r\n\r\n\
         {body}",
        body.len()
    )
}
