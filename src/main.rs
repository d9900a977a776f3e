//! FlashProxy - A Sharding Proxy for Redis-Protocol Backends
//!
//! This is the main entry point for the proxy.
//! It loads the configuration, waits for the initial topology, and then
//! accepts client connections.

use anyhow::Context;
use flashproxy::backend::{BackendPool, TcpConnector};
use flashproxy::commands::CommandHandler;
use flashproxy::config::Config;
use flashproxy::connection::handle_connection;
use flashproxy::routing::{ShardTable, SharedShardTable, TopologyEvent, TopologyUpdater};
use flashproxy::Proxy;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Command-line options. Host and port override the config file.
#[derive(Debug, Default)]
struct CliArgs {
    host: Option<String>,
    port: Option<u16>,
    config: Option<PathBuf>,
}

impl CliArgs {
    /// Parse configuration from command-line arguments
    fn from_args() -> Self {
        let mut cli = CliArgs::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--host" | "-h" => {
                    cli.host = Some(required_value(&args, i, "--host"));
                    i += 2;
                }
                "--port" | "-p" => {
                    let value = required_value(&args, i, "--port");
                    cli.port = Some(value.parse().unwrap_or_else(|_| {
                        eprintln!("Error: invalid port number");
                        std::process::exit(1);
                    }));
                    i += 2;
                }
                "--config" | "-c" => {
                    cli.config = Some(PathBuf::from(required_value(&args, i, "--config")));
                    i += 2;
                }
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("FlashProxy version {}", flashproxy::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {}", args[i]);
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        cli
    }

    /// Loads the config file, if any, and applies the command-line overrides.
    fn load_config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        config.validate()?;
        Ok(config)
    }
}

fn required_value(args: &[String], i: usize, flag: &str) -> String {
    match args.get(i + 1) {
        Some(value) => value.clone(),
        None => {
            eprintln!("Error: {} requires a value", flag);
            std::process::exit(1);
        }
    }
}

fn print_help() {
    println!(
        r#"
FlashProxy - A Sharding Proxy for Redis-Protocol Backends

USAGE:
    flashproxy [OPTIONS]

OPTIONS:
    -c, --config <FILE>  TOML configuration file (server, backend, topology)
    -h, --host <HOST>    Host to bind to (default: 127.0.0.1)
    -p, --port <PORT>    Port to listen on (default: 6380)
    -v, --version        Print version information
        --help           Print this help message

EXAMPLES:
    flashproxy --config config.toml              # Route per config.toml
    flashproxy --config config.toml --port 7777  # Same, on another port

SIGNALS:
    SIGHUP   Re-read the [topology] section of the config file
    SIGINT   Shut down

LOGGING:
    Set RUST_LOG to adjust verbosity, e.g. RUST_LOG=flashproxy=debug
"#
    );
}

fn print_banner(config: &Config) {
    println!(
        r#"
FlashProxy v{}
──────────────────────────────────────────────────────────────
Listening on   {}:{}
Shards         {}
Server sets    {}
Ready to accept connections.

Use Ctrl+C to shutdown gracefully.
"#,
        flashproxy::VERSION,
        config.server.host,
        config.server.port,
        config.topology.shard_count,
        config.topology.sets.len(),
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CliArgs::from_args();

    // Set up logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    let config = cli.load_config()?;

    // Routing table, fed by the configuration acting as topology source
    let table = SharedShardTable::new(ShardTable::new(config.topology.shard_count));
    let updater = TopologyUpdater::new(table.clone());
    let (events_tx, events_rx) = mpsc::channel(16);
    let _topology_task = updater.clone().spawn(events_rx);

    events_tx
        .send(TopologyEvent::Snapshot(config.topology_snapshot()?))
        .await
        .context("topology updater stopped")?;
    if let Err(e) = updater.wait_ready(config.handshake_timeout()).await {
        error!(error = %e, "Cannot route without a topology");
        return Err(e.into());
    }

    if let Some(path) = cli.config.clone() {
        watch_for_reload(path, config.topology.shard_count, events_tx);
    }

    // Backend pool and shared proxy state
    let mut pool = BackendPool::new(TcpConnector::new(config.connect_timeout()));
    if let Some(keepalive) = config.keepalive() {
        pool = pool.with_keepalive(keepalive);
    }
    let proxy = Arc::new(Proxy::new(table, pool).with_max_pending(config.server.max_pending));

    let bind_address = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", bind_address))?;
    print_banner(&config);
    info!("Listening on {}", bind_address);

    // Set up graceful shutdown
    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received, stopping proxy...");
    };

    // Main accept loop
    tokio::select! {
        _ = accept_loop(listener, Arc::clone(&proxy)) => {}
        _ = shutdown => {}
    }

    proxy.pool().close_all();
    info!("Proxy shutdown complete");
    Ok(())
}

/// Main loop that accepts incoming connections
async fn accept_loop(listener: TcpListener, proxy: Arc<Proxy>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!(client = %addr, error = %e, "Failed to set TCP_NODELAY");
                }
                let handler = CommandHandler::new(Arc::clone(&proxy));

                // Spawn a task to handle this connection
                tokio::spawn(handle_connection(stream, addr, handler));
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

#[cfg(unix)]
fn watch_for_reload(path: PathBuf, shard_count: u32, events: mpsc::Sender<TopologyEvent>) {
    tokio::spawn(reload_on_sighup(path, shard_count, events));
}

#[cfg(not(unix))]
fn watch_for_reload(_path: PathBuf, _shard_count: u32, _events: mpsc::Sender<TopologyEvent>) {}

/// Re-reads the topology from `path` on every SIGHUP.
#[cfg(unix)]
async fn reload_on_sighup(path: PathBuf, shard_count: u32, events: mpsc::Sender<TopologyEvent>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangups = match signal(SignalKind::hangup()) {
        Ok(hangups) => hangups,
        Err(e) => {
            warn!(error = %e, "SIGHUP reload unavailable");
            return;
        }
    };

    while hangups.recv().await.is_some() {
        info!(path = %path.display(), "SIGHUP received, reloading topology");
        match reload_topology(&path, shard_count) {
            Ok(event) => {
                if events.send(event).await.is_err() {
                    return;
                }
            }
            Err(e) => error!(error = %format!("{:#}", e), "Topology reload failed, keeping current"),
        }
    }
}

#[cfg(unix)]
fn reload_topology(path: &std::path::Path, shard_count: u32) -> anyhow::Result<TopologyEvent> {
    let config = Config::from_file(path)?;
    if config.topology.shard_count != shard_count {
        anyhow::bail!(
            "shard_count changed from {} to {}; a restart is required",
            shard_count,
            config.topology.shard_count
        );
    }
    Ok(TopologyEvent::Snapshot(config.topology_snapshot()?))
}
