//! domainsd - CLI entry point.
//!
//! Wires the edges around the proxy core: argument parsing, pidfile
//! lifecycle, signal handling, and the listener (bound directly or inherited
//! from launchd). Exit codes: 0 normal, 1 startup I/O failure, 2 argument
//! validation failure.

// Use mimalloc as global allocator for better p99 latency
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::Parser;
use domainsd::config::{
    DEFAULT_CLIENT_IO_TIMEOUT_MS, DEFAULT_LISTEN, DEFAULT_MAX_ACTIVE_CLIENTS,
    DEFAULT_POOL_IDLE_TIMEOUT_MS, DEFAULT_POOL_MAX_AGE_MS, DEFAULT_POOL_MAX_IDLE_PER_KEY,
    DEFAULT_POOL_MAX_IDLE_TOTAL, DEFAULT_UPSTREAM_CONNECT_TIMEOUT_MS,
    DEFAULT_UPSTREAM_IO_TIMEOUT_MS,
};
use domainsd::{net, ProxyConfig, Server, VERSION};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "domainsd")]
#[command(version = VERSION)]
#[command(about = "Host-routed HTTP/1.1 reverse proxy for local development domains")]
struct Args {
    /// Address to bind the client listener to (IPv4 host:port)
    #[arg(long, default_value = DEFAULT_LISTEN)]
    listen: String,

    /// Routes file scanned for "host":"target" pairs
    #[arg(long)]
    routes: PathBuf,

    /// Pidfile written at startup and removed on exit
    #[arg(long)]
    pidfile: PathBuf,

    /// Inherit the listener from a launchd socket with this name (macOS only)
    #[arg(long = "launchd-socket")]
    launchd_socket: Option<String>,

    /// Cap on concurrently served clients
    #[arg(long, default_value_t = DEFAULT_MAX_ACTIVE_CLIENTS as u64, value_parser = clap::value_parser!(u64).range(1..))]
    max_active_clients: u64,

    #[arg(long, default_value_t = DEFAULT_UPSTREAM_CONNECT_TIMEOUT_MS, value_parser = clap::value_parser!(u64).range(1..))]
    upstream_connect_timeout_ms: u64,

    #[arg(long, default_value_t = DEFAULT_UPSTREAM_IO_TIMEOUT_MS, value_parser = clap::value_parser!(u64).range(1..))]
    upstream_io_timeout_ms: u64,

    #[arg(long, default_value_t = DEFAULT_CLIENT_IO_TIMEOUT_MS, value_parser = clap::value_parser!(u64).range(1..))]
    client_io_timeout_ms: u64,

    #[arg(long, default_value_t = DEFAULT_POOL_MAX_IDLE_PER_KEY as u64, value_parser = clap::value_parser!(u64).range(1..))]
    pool_max_idle_per_key: u64,

    #[arg(long, default_value_t = DEFAULT_POOL_MAX_IDLE_TOTAL as u64, value_parser = clap::value_parser!(u64).range(1..))]
    pool_max_idle_total: u64,

    #[arg(long, default_value_t = DEFAULT_POOL_IDLE_TIMEOUT_MS, value_parser = clap::value_parser!(u64).range(1..))]
    pool_idle_timeout_ms: u64,

    #[arg(long, default_value_t = DEFAULT_POOL_MAX_AGE_MS, value_parser = clap::value_parser!(u64).range(1..))]
    pool_max_age_ms: u64,
}

impl Args {
    fn into_config(self) -> ProxyConfig {
        let mut config = ProxyConfig {
            listen: self.listen,
            routes: self.routes,
            pidfile: self.pidfile,
            launchd_socket: self.launchd_socket,
            max_active_clients: self.max_active_clients as usize,
            upstream_connect_timeout: Duration::from_millis(self.upstream_connect_timeout_ms),
            upstream_io_timeout: Duration::from_millis(self.upstream_io_timeout_ms),
            client_io_timeout: Duration::from_millis(self.client_io_timeout_ms),
            pool_max_idle_per_key: self.pool_max_idle_per_key as usize,
            pool_max_idle_total: self.pool_max_idle_total as usize,
            pool_idle_timeout: Duration::from_millis(self.pool_idle_timeout_ms),
            pool_max_age: Duration::from_millis(self.pool_max_age_ms),
        };
        config.normalize();
        config
    }
}

/// Pidfile that removes itself when dropped.
struct Pidfile {
    path: PathBuf,
}

impl Pidfile {
    fn create(path: &Path) -> std::io::Result<Self> {
        std::fs::write(path, format!("{}\n", std::process::id()))?;
        Ok(Pidfile { path: path.to_path_buf() })
    }
}

impl Drop for Pidfile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    // Clap reports its own parse failures with exit code 2.
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("domainsd=info")),
        )
        .init();

    let config = args.into_config();

    let listen = match parse_listen(&config.listen) {
        Some(listen) => listen,
        None => {
            error!("Invalid --listen value: {}", config.listen);
            return 2;
        }
    };

    let pidfile = match Pidfile::create(&config.pidfile) {
        Ok(pidfile) => pidfile,
        Err(e) => {
            error!("Failed to write pid file {}: {}", config.pidfile.display(), e);
            return 1;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().max(2))
        .enable_all()
        .thread_name("domainsd-worker")
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to build runtime: {}", e);
            return 1;
        }
    };

    let code = runtime.block_on(serve(config, listen));
    drop(pidfile);
    code
}

/// The default listener path accepts IPv4 literals only; anything else has to
/// come in through launchd.
fn parse_listen(listen: &str) -> Option<(Ipv4Addr, u16)> {
    let (host, port) = net::parse_host_port(listen)?;
    let addr: Ipv4Addr = host.parse().ok()?;
    Some((addr, port))
}

async fn serve(config: ProxyConfig, listen: (Ipv4Addr, u16)) -> i32 {
    info!("domainsd v{}", VERSION);

    let std_listener = if let Some(name) = config.launchd_socket.clone() {
        match net::listener_from_launchd(&name) {
            Ok(listener) => {
                info!("listening via launchd socket '{}'", name);
                listener
            }
            Err(e) => {
                error!("Failed to activate launchd socket '{}': {}", name, e);
                return 1;
            }
        }
    } else {
        match net::bind_listener(listen.0, listen.1) {
            Ok(listener) => {
                info!("listening on {}:{}", listen.0, listen.1);
                listener
            }
            Err(e) => {
                error!("Failed to bind {}:{}: {}", listen.0, listen.1, e);
                return 1;
            }
        }
    };

    let listener = match TcpListener::from_std(std_listener) {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to register listener with the runtime: {}", e);
            return 1;
        }
    };

    let server = Server::new(config);
    let ctx = server.context().clone();
    let accept = tokio::spawn(async move { server.run(listener).await });

    shutdown_signal().await;
    info!("received shutdown signal");

    // Clear the running flag so in-flight handlers stop after their current
    // request, then close the listener by tearing down the accept task.
    ctx.shutdown();
    accept.abort();
    let _ = accept.await;

    info!("proxy stopped");
    0
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
