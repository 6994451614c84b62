//! Socket Hub CLI - WebSocket fan-out server.
//!
//! This is the main binary entry point. See the `socket_hub` library for the
//! core functionality.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use mimalloc::MiMalloc;
use socket_hub::{feed, Config, Hub, HubSettings, LineSource, OverflowPolicy, Server};

/// Global allocator configured per M-MIMALLOC-APPS guideline.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// How long shutdown waits for client tasks before giving up.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "socket-hub")]
#[command(version)]
#[command(about = "WebSocket fan-out hub with ping/pong liveness")]
struct Cli {
    /// JSON config file (overrides SOCKET_HUB_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server until SIGINT/SIGTERM
    Serve(ServeArgs),
    /// Print the effective configuration as JSON
    Config,
}

#[derive(Args)]
struct ServeArgs {
    /// Address to listen on
    #[arg(long)]
    bind_address: Option<String>,
    /// Port to listen on
    #[arg(long)]
    bind_port: Option<u16>,
    /// Path upgraded to a WebSocket
    #[arg(long)]
    ws_path: Option<String>,
    /// Frames each client outbox can hold
    #[arg(long)]
    outbox_capacity: Option<usize>,
    /// Pending Hub commands before callers wait
    #[arg(long)]
    command_capacity: Option<usize>,
    /// Full-outbox behaviour: drop or evict
    #[arg(long)]
    overflow: Option<OverflowPolicy>,
    /// Seconds between server pings (0 disables)
    #[arg(long)]
    ping_interval: Option<u64>,
    /// Seconds of client silence before disconnecting (0 disables)
    #[arg(long)]
    idle_timeout: Option<u64>,
    /// Default log filter when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,
    /// Broadcast each line read from stdin as a test message
    #[arg(long)]
    stdin_feed: bool,
}

impl ServeArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(address) = &self.bind_address {
            config.bind_address.clone_from(address);
        }
        if let Some(port) = self.bind_port {
            config.bind_port = port;
        }
        if let Some(path) = &self.ws_path {
            config.ws_path.clone_from(path);
        }
        if let Some(capacity) = self.outbox_capacity {
            config.outbox_capacity = capacity;
        }
        if let Some(capacity) = self.command_capacity {
            config.command_capacity = capacity;
        }
        if let Some(overflow) = self.overflow {
            config.overflow = overflow;
        }
        if let Some(secs) = self.ping_interval {
            config.ping_interval_secs = secs;
        }
        if let Some(secs) = self.idle_timeout {
            config.idle_timeout_secs = secs;
        }
        if let Some(level) = &self.log_level {
            config.log_level.clone_from(level);
        }
    }
}

fn init_logging(level: &str) -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));
    builder.format_timestamp_millis();
    if let Ok(path) = std::env::var("SOCKET_HUB_LOG_FILE") {
        let log_file = std::fs::File::create(&path)
            .with_context(|| format!("Failed to create log file at {path}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }
    builder.init();
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("Failed to listen for SIGINT")?,
            _ = sigterm.recv() => log::info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    Ok(())
}

async fn serve(config: Config, stdin_feed: bool) -> Result<()> {
    let (hub, handle) = Hub::new(HubSettings::from_config(&config));
    let hub_task = tokio::spawn(hub.run());

    let server = match Server::bind(&config, handle.clone()).await {
        Ok(server) => server,
        Err(e) => {
            handle.shutdown();
            let _ = hub_task.await;
            return Err(e);
        }
    };

    let feed_task = stdin_feed.then(|| {
        let handle = handle.clone();
        tokio::spawn(async move {
            let mut source = LineSource::new(tokio::io::BufReader::new(tokio::io::stdin()));
            feed::pump(&mut source, &handle).await
        })
    });

    log::info!("Socket Hub v{} ready", env!("CARGO_PKG_VERSION"));

    tokio::select! {
        result = shutdown_signal() => result?,
        () = handle.closed() => log::warn!("Hub stopped unexpectedly"),
    }

    log::info!("Shutting down...");
    server.shutdown().await;
    handle.shutdown();
    if let Some(feed_task) = feed_task {
        // Blocked on stdin; nothing to flush.
        feed_task.abort();
    }
    match tokio::time::timeout(SHUTDOWN_GRACE, hub_task).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::error!("Hub task failed: {e}"),
        Err(_elapsed) => log::warn!(
            "{} client tasks still running after {}s",
            handle.active_tasks(),
            SHUTDOWN_GRACE.as_secs()
        ),
    }

    let stats = handle.stats();
    log::info!(
        "Served {} clients, {} broadcasts, {} frames delivered, {} dropped",
        stats.admitted,
        stats.broadcasts,
        stats.delivered,
        stats.dropped
    );
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve(args) => {
            args.apply(&mut config);
            config.validate()?;
            init_logging(&config.log_level)?;

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to build tokio runtime")?;
            let result = runtime.block_on(serve(config, args.stdin_feed));
            runtime.shutdown_timeout(Duration::from_secs(1));
            result?;
        }
        Commands::Config => {
            for rejected in config.rejected_overrides() {
                eprintln!("Warning: ignoring {rejected}");
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
