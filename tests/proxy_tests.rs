//! End-to-end proxy tests over real loopback sockets.
//!
//! Each test starts a full `Server` on an ephemeral port with its own routes
//! file, plus one or more scripted upstreams, and drives the exchange from a
//! raw TCP client so the bytes on the wire can be asserted exactly.

use domainsd::{ProxyConfig, Server};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

fn temp_routes_file(content: &str) -> PathBuf {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let path = std::env::temp_dir().join(format!(
        "domainsd-proxy-test-{}-{}.json",
        std::process::id(),
        n
    ));
    std::fs::write(&path, content).unwrap();
    path
}

struct TestProxy {
    addr: SocketAddr,
    server: Arc<Server>,
    accept: JoinHandle<()>,
    routes_path: PathBuf,
}

impl TestProxy {
    async fn start(routes: &str, tweak: impl FnOnce(&mut ProxyConfig)) -> Self {
        let routes_path = temp_routes_file(routes);
        let mut config = ProxyConfig {
            routes: routes_path.clone(),
            client_io_timeout: Duration::from_secs(5),
            upstream_io_timeout: Duration::from_secs(5),
            upstream_connect_timeout: Duration::from_secs(5),
            ..ProxyConfig::default()
        };
        tweak(&mut config);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(Server::new(config));
        let run = server.clone();
        let accept = tokio::spawn(async move {
            let _ = run.run(listener).await;
        });
        TestProxy {
            addr,
            server,
            accept,
            routes_path,
        }
    }

    async fn connect(&self) -> TcpStream {
        TcpStream::connect(self.addr).await.unwrap()
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.server.context().shutdown();
        self.accept.abort();
        let _ = std::fs::remove_file(&self.routes_path);
    }
}

/// Incremental reader that frames responses by their Content-Length so
/// pipelined responses on one connection can be pulled apart.
struct ResponseReader {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl ResponseReader {
    fn new(stream: TcpStream) -> Self {
        ResponseReader {
            stream,
            buf: Vec::new(),
        }
    }

    async fn read_one(&mut self) -> (String, Vec<u8>) {
        let mut tmp = [0u8; 4096];
        let header_end = loop {
            if let Some(i) = find_subslice(&self.buf, b"\r\n\r\n") {
                break i;
            }
            let n = self.stream.read(&mut tmp).await.unwrap();
            assert!(n > 0, "connection closed before response head");
            self.buf.extend_from_slice(&tmp[..n]);
        };
        let head = String::from_utf8_lossy(&self.buf[..header_end]).to_string();
        let content_length = content_length_of(&head);
        let total = header_end + 4 + content_length;
        while self.buf.len() < total {
            let n = self.stream.read(&mut tmp).await.unwrap();
            assert!(n > 0, "connection closed before response body");
            self.buf.extend_from_slice(&tmp[..n]);
        }
        let body = self.buf[header_end + 4..total].to_vec();
        self.buf.drain(..total);
        (head, body)
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn content_length_of(head: &str) -> usize {
    head.lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.trim().eq_ignore_ascii_case("content-length") {
                value.trim().parse().ok()
            } else {
                None
            }
        })
        .unwrap_or(0)
}

/// Read one full HTTP request (head plus Content-Length body) as raw bytes.
async fn read_http_request(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];
    let header_end = loop {
        if let Some(i) = find_subslice(&buf, b"\r\n\r\n") {
            break i;
        }
        let n = stream.read(&mut tmp).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&tmp[..n]);
    };
    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let total = header_end + 4 + content_length_of(&head);
    while buf.len() < total {
        let n = stream.read(&mut tmp).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&tmp[..n]);
    }
    buf.truncate(total);
    Some(buf)
}

struct Upstream {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<Vec<u8>>>>,
    accepted: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl Drop for Upstream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Upstream that answers every request on every connection with the same
/// canned bytes, capturing each request it saw.
async fn spawn_upstream_fixed(response: &'static [u8]) -> Upstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let accepted = Arc::new(AtomicUsize::new(0));

    let captured = requests.clone();
    let count = accepted.clone();
    let task = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            count.fetch_add(1, Ordering::Relaxed);
            let captured = captured.clone();
            tokio::spawn(async move {
                while let Some(request) = read_http_request(&mut stream).await {
                    captured.lock().push(request);
                    if stream.write_all(response).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    Upstream {
        addr,
        requests,
        accepted,
        task,
    }
}

/// Upstream that echoes each request's path back as the response body.
async fn spawn_upstream_echo_path() -> Upstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let accepted = Arc::new(AtomicUsize::new(0));

    let captured = requests.clone();
    let count = accepted.clone();
    let task = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            count.fetch_add(1, Ordering::Relaxed);
            let captured = captured.clone();
            tokio::spawn(async move {
                while let Some(request) = read_http_request(&mut stream).await {
                    let head = String::from_utf8_lossy(&request).to_string();
                    let path = head
                        .split_whitespace()
                        .nth(1)
                        .unwrap_or("/")
                        .to_string();
                    captured.lock().push(request);
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                        path.len(),
                        path
                    );
                    if stream.write_all(response.as_bytes()).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    Upstream {
        addr,
        requests,
        accepted,
        task,
    }
}

async fn wait_until(mut probe: impl FnMut() -> bool) {
    for _ in 0..100 {
        if probe() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached within 2s");
}

fn routes_for(host: &str, addr: SocketAddr) -> String {
    format!("{{\"{}\":\"127.0.0.1:{}\"}}", host, addr.port())
}

#[tokio::test]
async fn test_basic_route_hit() {
    let upstream = spawn_upstream_fixed(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK").await;
    let proxy = TestProxy::start(&routes_for("example.test", upstream.addr), |_| {}).await;

    let mut client = proxy.connect().await;
    client
        .write_all(b"GET /p HTTP/1.1\r\nHost: example.test\r\n\r\n")
        .await
        .unwrap();

    let expected: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK";
    let mut received = vec![0u8; expected.len()];
    client.read_exact(&mut received).await.unwrap();
    assert_eq!(received, expected);

    let captured = upstream.requests.lock();
    let forwarded = String::from_utf8_lossy(&captured[0]).to_string();
    assert!(forwarded.starts_with("GET /p HTTP/1.1\r\n"));
    assert!(forwarded.contains("Host: localhost\r\n"));
    assert!(forwarded.contains("X-Forwarded-Host: example.test\r\n"));
    assert!(forwarded.contains("X-Forwarded-Proto: http\r\n"));
    assert!(forwarded.contains("Connection: keep-alive\r\n"));
    assert!(forwarded.contains("Content-Length: 0\r\n"));
    assert!(!forwarded.contains("Host: example.test\r\n"));
}

#[tokio::test]
async fn test_missing_route_is_404() {
    let proxy = TestProxy::start(r#"{"known.test":"127.0.0.1:1"}"#, |_| {}).await;

    let mut reader = ResponseReader::new(proxy.connect().await);
    reader
        .stream
        .write_all(b"GET / HTTP/1.1\r\nHost: unknown.test\r\n\r\n")
        .await
        .unwrap();

    let (head, body) = reader.read_one().await;
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(head.contains("X-Flow-Domainsd: 1"));
    assert!(head.contains("Connection: close"));
    assert_eq!(body, b"No local route configured for unknown.test\n");
}

#[tokio::test]
async fn test_missing_host_is_400() {
    let proxy = TestProxy::start("{}", |_| {}).await;

    let mut reader = ResponseReader::new(proxy.connect().await);
    reader
        .stream
        .write_all(b"GET / HTTP/1.1\r\n\r\n")
        .await
        .unwrap();

    let (head, body) = reader.read_one().await;
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert_eq!(body, b"Missing Host header\n");
}

#[tokio::test]
async fn test_malformed_request_line_is_400() {
    let proxy = TestProxy::start("{}", |_| {}).await;

    let mut reader = ResponseReader::new(proxy.connect().await);
    reader.stream.write_all(b"NOT-HTTP\r\n\r\n").await.unwrap();

    let (head, body) = reader.read_one().await;
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert_eq!(body, b"invalid request line\n");
}

#[tokio::test]
async fn test_oversized_headers_are_400() {
    let proxy = TestProxy::start("{}", |_| {}).await;

    let mut client = proxy.connect().await;
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: big.test\r\n")
        .await
        .unwrap();
    // Push the accumulated head just past the 1 MiB cap, never terminating
    // it. The proxy may answer and close before the last lines land, so
    // write errors here are expected.
    let filler = format!("X-Filler: {}\r\n", "a".repeat(4096 - 13));
    for _ in 0..260 {
        if client.write_all(filler.as_bytes()).await.is_err() {
            break;
        }
    }

    let mut reader = ResponseReader::new(client);
    let (head, body) = reader.read_one().await;
    assert!(head.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert_eq!(body, b"request headers too large\n");
}

#[tokio::test]
async fn test_invalid_route_target_is_502() {
    let proxy = TestProxy::start(r#"{"bad.test":"not-a-target"}"#, |_| {}).await;

    let mut reader = ResponseReader::new(proxy.connect().await);
    reader
        .stream
        .write_all(b"GET / HTTP/1.1\r\nHost: bad.test\r\n\r\n")
        .await
        .unwrap();

    let (head, body) = reader.read_one().await;
    assert!(head.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
    assert_eq!(body, b"Invalid target route\n");
}

#[tokio::test]
async fn test_refused_upstream_is_502() {
    // Bind then drop to find a port with nothing listening.
    let vacant = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = vacant.local_addr().unwrap();
    drop(vacant);

    let proxy = TestProxy::start(&routes_for("gone.test", addr), |_| {}).await;

    let mut reader = ResponseReader::new(proxy.connect().await);
    reader
        .stream
        .write_all(b"GET / HTTP/1.1\r\nHost: gone.test\r\n\r\n")
        .await
        .unwrap();

    let (head, body) = reader.read_one().await;
    assert!(head.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
    assert_eq!(body, b"Upstream connection failed\n");
}

#[tokio::test]
async fn test_health_endpoint_honors_keepalive() {
    let proxy = TestProxy::start("{}", |config| {
        config.max_active_clients = 7;
    })
    .await;

    let mut reader = ResponseReader::new(proxy.connect().await);
    reader
        .stream
        .write_all(b"GET /_flow/domains/health HTTP/1.1\r\nHost: whatever\r\n\r\n")
        .await
        .unwrap();

    let (head, body) = reader.read_one().await;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(head.contains("Connection: keep-alive"));
    let text = String::from_utf8(body).unwrap();
    assert!(text.starts_with("ok active_clients=1 overload_rejections=0"));
    assert!(text.contains("max_active_clients=7"));
    assert!(text.ends_with('\n'));

    // Same connection must serve a second health request.
    reader
        .stream
        .write_all(b"GET /_flow/domains/health HTTP/1.0\r\nConnection: keep-alive\r\n\r\n")
        .await
        .unwrap();
    let (head, _) = reader.read_one().await;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
}

#[tokio::test]
async fn test_overload_rejection() {
    let proxy = TestProxy::start("{}", |config| {
        config.max_active_clients = 1;
    })
    .await;
    let ctx = proxy.server.context().clone();

    // First client occupies the only slot by never finishing its request.
    let mut holder = proxy.connect().await;
    holder.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
    wait_until(|| ctx.active_clients() == 1).await;

    let mut reader = ResponseReader::new(proxy.connect().await);
    let (head, body) = reader.read_one().await;
    assert!(head.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));
    assert_eq!(body, b"Proxy overloaded, retry shortly\n");

    // Free the slot, then confirm the counter through the health endpoint.
    drop(holder);
    wait_until(|| ctx.active_clients() == 0).await;

    let mut reader = ResponseReader::new(proxy.connect().await);
    reader
        .stream
        .write_all(b"GET /_flow/domains/health HTTP/1.1\r\n\r\n")
        .await
        .unwrap();
    let (_, body) = reader.read_one().await;
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("overload_rejections=1"), "got: {text}");
}

#[tokio::test]
async fn test_chunked_response_relayed_byte_exact_and_pooled() {
    let upstream = spawn_upstream_fixed(
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
    )
    .await;
    let proxy = TestProxy::start(&routes_for("chunky.test", upstream.addr), |_| {}).await;
    let pool = proxy.server.pool().clone();

    let mut client = proxy.connect().await;
    client
        .write_all(b"GET /c HTTP/1.1\r\nHost: chunky.test\r\n\r\n")
        .await
        .unwrap();

    let expected: &[u8] = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n";
    let mut received = vec![0u8; expected.len()];
    client.read_exact(&mut received).await.unwrap();
    assert_eq!(received, expected);

    // Ending the client session parks the cached upstream socket in the pool.
    drop(client);
    wait_until(|| pool.idle_total() == 1).await;
}

#[tokio::test]
async fn test_keepalive_client_reuses_one_upstream_connection() {
    let upstream = spawn_upstream_echo_path().await;
    let proxy = TestProxy::start(&routes_for("app.test", upstream.addr), |_| {}).await;

    let mut reader = ResponseReader::new(proxy.connect().await);
    for path in ["/first", "/second", "/third"] {
        let request = format!("GET {path} HTTP/1.1\r\nHost: app.test\r\n\r\n");
        reader.stream.write_all(request.as_bytes()).await.unwrap();
        let (head, body) = reader.read_one().await;
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(body, path.as_bytes());
    }

    assert_eq!(upstream.accepted.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_pipelined_requests_answered_in_order() {
    let upstream = spawn_upstream_echo_path().await;
    let proxy = TestProxy::start(&routes_for("pipe.test", upstream.addr), |_| {}).await;

    let mut reader = ResponseReader::new(proxy.connect().await);
    reader
        .stream
        .write_all(
            b"GET /a HTTP/1.1\r\nHost: pipe.test\r\n\r\nGET /b HTTP/1.1\r\nHost: pipe.test\r\n\r\n",
        )
        .await
        .unwrap();

    let (_, body) = reader.read_one().await;
    assert_eq!(body, b"/a");
    let (_, body) = reader.read_one().await;
    assert_eq!(body, b"/b");
}

#[tokio::test]
async fn test_chunked_request_body_reframed_with_content_length() {
    let upstream = spawn_upstream_echo_path().await;
    let proxy = TestProxy::start(&routes_for("post.test", upstream.addr), |_| {}).await;

    let mut reader = ResponseReader::new(proxy.connect().await);
    reader
        .stream
        .write_all(
            b"POST /upload HTTP/1.1\r\nHost: post.test\r\nTransfer-Encoding: chunked\r\n\r\n6\r\nhello \r\n5\r\nworld\r\n0\r\n\r\n",
        )
        .await
        .unwrap();
    let (head, _) = reader.read_one().await;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));

    let captured = upstream.requests.lock();
    let forwarded = String::from_utf8_lossy(&captured[0]).to_string();
    assert!(forwarded.contains("Content-Length: 11\r\n"));
    assert!(!forwarded.to_ascii_lowercase().contains("transfer-encoding"));
    assert!(forwarded.ends_with("hello world"));
}

#[tokio::test]
async fn test_upgrade_tunnel_relays_both_directions() {
    // Upstream speaks the upgrade handshake, then echoes raw bytes.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let upstream = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut tmp = [0u8; 4096];
        while find_subslice(&buf, b"\r\n\r\n").is_none() {
            let n = stream.read(&mut tmp).await.unwrap();
            buf.extend_from_slice(&tmp[..n]);
        }
        let head = String::from_utf8_lossy(&buf).to_string();
        assert!(head.contains("Connection: Upgrade\r\n"));
        assert!(head.contains("Upgrade: websocket\r\n"));

        stream
            .write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n")
            .await
            .unwrap();
        loop {
            let n = stream.read(&mut tmp).await.unwrap();
            if n == 0 {
                break;
            }
            stream.write_all(&tmp[..n]).await.unwrap();
        }
    });

    let proxy = TestProxy::start(&routes_for("ws.test", addr), |_| {}).await;

    let mut client = proxy.connect().await;
    client
        .write_all(
            b"GET /socket HTTP/1.1\r\nHost: ws.test\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
        )
        .await
        .unwrap();

    let mut buf = Vec::new();
    let mut tmp = [0u8; 4096];
    while find_subslice(&buf, b"\r\n\r\n").is_none() {
        let n = client.read(&mut tmp).await.unwrap();
        buf.extend_from_slice(&tmp[..n]);
    }
    assert!(buf.starts_with(b"HTTP/1.1 101 Switching Protocols\r\n"));

    for payload in [&b"ping-one"[..], &b"frame-2"[..]] {
        client.write_all(payload).await.unwrap();
        let mut echoed = vec![0u8; payload.len()];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(echoed, payload);
    }

    drop(client);
    let _ = upstream.await;
}

#[tokio::test]
async fn test_stale_cached_upstream_write_retries_on_fresh_socket() {
    // First connection serves one response, then dies with an RST so the
    // proxy's next write on the cached socket fails outright. The second
    // connection behaves normally.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let upstream = tokio::spawn(async move {
        let (mut first, _) = listener.accept().await.unwrap();
        read_http_request(&mut first).await.unwrap();
        first
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\none")
            .await
            .unwrap();
        // Linger(0) turns the close into an RST instead of a FIN.
        socket2::SockRef::from(&first)
            .set_linger(Some(Duration::from_secs(0)))
            .unwrap();
        drop(first);

        let (mut second, _) = listener.accept().await.unwrap();
        read_http_request(&mut second).await.unwrap();
        second
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\ntwo")
            .await
            .unwrap();
    });

    let proxy = TestProxy::start(&routes_for("flaky.test", addr), |_| {}).await;

    let mut reader = ResponseReader::new(proxy.connect().await);
    reader
        .stream
        .write_all(b"GET /1 HTTP/1.1\r\nHost: flaky.test\r\n\r\n")
        .await
        .unwrap();
    let (_, body) = reader.read_one().await;
    assert_eq!(body, b"one");

    // Let the RST land before the cached socket is written to again.
    tokio::time::sleep(Duration::from_millis(200)).await;

    reader
        .stream
        .write_all(b"GET /2 HTTP/1.1\r\nHost: flaky.test\r\n\r\n")
        .await
        .unwrap();
    let (head, body) = reader.read_one().await;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
    assert_eq!(body, b"two");

    let _ = upstream.await;
}

#[tokio::test]
async fn test_connection_close_response_ends_client_session() {
    let upstream = spawn_upstream_fixed(
        b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nOK",
    )
    .await;
    let proxy = TestProxy::start(&routes_for("oneshot.test", upstream.addr), |_| {}).await;

    let mut client = proxy.connect().await;
    client
        .write_all(b"GET / HTTP/1.1\r\nHost: oneshot.test\r\n\r\n")
        .await
        .unwrap();

    let mut received = Vec::new();
    client.read_to_end(&mut received).await.unwrap();
    assert!(received.ends_with(b"OK"));
    // read_to_end returning proves the proxy closed the client connection.

    let pool = proxy.server.pool().clone();
    assert_eq!(pool.idle_total(), 0, "closed upstream must not be pooled");
}

#[tokio::test]
async fn test_route_reload_picks_up_rewritten_file() {
    let upstream = spawn_upstream_echo_path().await;
    let proxy = TestProxy::start(r#"{"old.test":"127.0.0.1:1"}"#, |_| {}).await;

    // First lookup loads the original file: new.test is unknown.
    let mut reader = ResponseReader::new(proxy.connect().await);
    reader
        .stream
        .write_all(b"GET / HTTP/1.1\r\nHost: new.test\r\n\r\n")
        .await
        .unwrap();
    let (head, _) = reader.read_one().await;
    assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));

    // Rewrite the routes file the way the orchestrator would, then get past
    // the 100 ms stat gate. The sleep before the rewrite keeps the new mtime
    // distinct on filesystems with coarse timestamps.
    tokio::time::sleep(Duration::from_millis(50)).await;
    std::fs::write(&proxy.routes_path, routes_for("new.test", upstream.addr)).unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let mut reader = ResponseReader::new(proxy.connect().await);
    reader
        .stream
        .write_all(b"GET /fresh HTTP/1.1\r\nHost: new.test\r\n\r\n")
        .await
        .unwrap();
    let (head, body) = reader.read_one().await;
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "got: {head}");
    assert_eq!(body, b"/fresh");
}
