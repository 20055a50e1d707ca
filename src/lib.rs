//! domainsd - host-routed HTTP/1.1 reverse proxy for local development domains
//!
//! Terminates cleartext HTTP/1.x on a loopback listener, picks a loopback
//! upstream by the request's Host header via a hot-reloadable routes file,
//! and forwards the exchange end-to-end with keep-alive on both sides, a
//! keyed idle connection pool, and opaque tunneling for protocol upgrades.
//!
//! # Architecture
//!
//! ```text
//!  client ──> server/ (accept + admission)
//!                │
//!                v
//!          server::handler (per-client loop)
//!           │         │          │
//!           v         v          v
//!         http1     routes     pool ──> upstream
//!       (framing)  (lookup)  (idle conns)
//! ```
//!
//! The handler reads one request at a time, rewrites the forwarding headers,
//! and relays the response byte-exact while deciding whether either socket
//! stays reusable. Everything shared between tasks lives in a single
//! [`ServerContext`].

pub mod config;
pub mod context;
pub mod error;
pub mod http1;
pub mod net;
pub mod pool;
pub mod routes;
pub mod server;

pub use config::ProxyConfig;
pub use context::ServerContext;
pub use error::{Error, Result};
pub use routes::RouteTable;
pub use server::{Server, HEALTH_PATH};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
