//! Host-to-upstream route table with lazy mtime-gated reload.
//!
//! The backing file is rewritten atomically by an external orchestrator, so
//! reloads are cheap to detect: the table stats the file at most every 100 ms
//! and re-reads it only when the modification time changed. Stat or read
//! failures are silent and keep the previous map authoritative.
//!
//! The parser is deliberately permissive: it scans the raw bytes for
//! `"key":"value"` pairs (double quotes, optional whitespace around the
//! colon, no escape processing) and ignores everything else, so the file may
//! be JSON, a fragment of one, or any text carrying such pairs.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime};
use tracing::debug;

const RELOAD_CHECK_INTERVAL: Duration = Duration::from_millis(100);

pub struct RouteTable {
    path: PathBuf,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    routes: HashMap<String, String>,
    mtime: Option<SystemTime>,
    last_check: Option<Instant>,
    loaded: bool,
}

impl RouteTable {
    pub fn new(path: PathBuf) -> Self {
        RouteTable {
            path,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Look up the upstream `host:port` for a case-insensitive host.
    pub fn lookup(&self, host: &str) -> Option<String> {
        self.reload_if_needed();
        let inner = self.inner.lock();
        inner.routes.get(&host.to_ascii_lowercase()).cloned()
    }

    pub fn size(&self) -> usize {
        self.reload_if_needed();
        self.inner.lock().routes.len()
    }

    fn reload_if_needed(&self) {
        let now = Instant::now();
        {
            let mut inner = self.inner.lock();
            let recently_checked = inner
                .last_check
                .is_some_and(|at| now.duration_since(at) < RELOAD_CHECK_INTERVAL);
            if inner.loaded && recently_checked {
                return;
            }
            inner.last_check = Some(now);
        }

        // File I/O happens outside the lock; the lock is reacquired only to
        // publish the freshly parsed map.
        let Ok(mtime) = fs::metadata(&self.path).and_then(|meta| meta.modified()) else {
            return;
        };

        {
            let inner = self.inner.lock();
            if inner.loaded && inner.mtime == Some(mtime) {
                return;
            }
        }

        let Ok(content) = fs::read_to_string(&self.path) else {
            return;
        };
        let routes = parse_routes(&content);
        debug!(entries = routes.len(), path = %self.path.display(), "route table reloaded");

        let mut inner = self.inner.lock();
        inner.routes = routes;
        inner.mtime = Some(mtime);
        inner.loaded = true;
    }
}

/// Scan `content` for `"key":"value"` pairs. Keys are lowercased, values
/// trimmed; empty keys or values are dropped.
fn parse_routes(content: &str) -> HashMap<String, String> {
    let bytes = content.as_bytes();
    let mut routes = HashMap::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'"' {
            i += 1;
            continue;
        }
        let Some((key, after_key)) = scan_quoted(bytes, i) else {
            // Unterminated quote: nothing further can match.
            break;
        };
        let mut j = after_key;
        while j < bytes.len() && bytes[j].is_ascii_whitespace() {
            j += 1;
        }
        if j >= bytes.len() || bytes[j] != b':' {
            i = after_key;
            continue;
        }
        j += 1;
        while j < bytes.len() && bytes[j].is_ascii_whitespace() {
            j += 1;
        }
        if j >= bytes.len() || bytes[j] != b'"' {
            i = after_key;
            continue;
        }
        let Some((value, after_value)) = scan_quoted(bytes, j) else {
            break;
        };
        let host = key.trim().to_ascii_lowercase();
        let target = value.trim().to_string();
        if !host.is_empty() && !target.is_empty() {
            routes.insert(host, target);
        }
        i = after_value;
    }
    routes
}

/// Read a double-quoted run starting at `start` (which must index a `"`).
/// Returns the unquoted text and the index just past the closing quote.
fn scan_quoted(bytes: &[u8], start: usize) -> Option<(&str, usize)> {
    let mut end = start + 1;
    while end < bytes.len() && bytes[end] != b'"' {
        end += 1;
    }
    if end >= bytes.len() {
        return None;
    }
    std::str::from_utf8(&bytes[start + 1..end])
        .ok()
        .map(|text| (text, end + 1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn temp_routes_file(content: &str) -> PathBuf {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let n = COUNTER.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "domainsd-routes-test-{}-{}.json",
            std::process::id(),
            n
        ));
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_parse_plain_json_object() {
        let routes = parse_routes(r#"{"app.test":"127.0.0.1:9000","API.test" : "127.0.0.1:9001"}"#);
        assert_eq!(routes.len(), 2);
        assert_eq!(routes["app.test"], "127.0.0.1:9000");
        assert_eq!(routes["api.test"], "127.0.0.1:9001");
    }

    #[test]
    fn test_parse_ignores_surrounding_noise() {
        let content = "# generated file\n\"a.test\":\"127.0.0.1:9000\"\nsomething else\n\"b.test\"\n:\n\"127.0.0.1:9001\"\n";
        let routes = parse_routes(content);
        assert_eq!(routes.len(), 2);
        assert_eq!(routes["b.test"], "127.0.0.1:9001");
    }

    #[test]
    fn test_parse_drops_empty_values() {
        let routes = parse_routes(r#""a.test":"" "":"127.0.0.1:1" "b.test":"  ""#);
        assert!(routes.is_empty());
    }

    #[test]
    fn test_parse_trims_values_and_lowercases_keys() {
        let routes = parse_routes(r#""WWW.Example.Test":"  127.0.0.1:9000  ""#);
        assert_eq!(routes["www.example.test"], "127.0.0.1:9000");
    }

    #[test]
    fn test_parse_last_pair_wins_for_duplicate_keys() {
        let routes = parse_routes(r#""a.test":"127.0.0.1:1" "A.TEST":"127.0.0.1:2""#);
        assert_eq!(routes.len(), 1);
        assert_eq!(routes["a.test"], "127.0.0.1:2");
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let path = temp_routes_file(r#"{"app.test":"127.0.0.1:9000"}"#);
        let table = RouteTable::new(path.clone());
        assert_eq!(table.lookup("APP.Test").as_deref(), Some("127.0.0.1:9000"));
        assert_eq!(table.lookup("missing.test"), None);
        assert_eq!(table.size(), 1);
        let _ = fs::remove_file(path);
    }

    #[test]
    fn test_lost_file_keeps_previous_map() {
        let path = temp_routes_file(r#"{"app.test":"127.0.0.1:9000"}"#);
        let table = RouteTable::new(path.clone());
        assert!(table.lookup("app.test").is_some());

        fs::remove_file(&path).unwrap();
        // Get past the 100 ms check gate so a reload is actually attempted.
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(table.lookup("app.test").as_deref(), Some("127.0.0.1:9000"));
    }

    #[test]
    fn test_missing_file_resolves_nothing() {
        let table = RouteTable::new(PathBuf::from("/nonexistent/domainsd-routes.json"));
        assert_eq!(table.lookup("app.test"), None);
        assert_eq!(table.size(), 0);
    }
}
