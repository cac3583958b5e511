//! WolfSync - Firewall Connection-State Replication
//!
//! Runs the sync engine as a standalone daemon: binds the sync transport,
//! requests a bulk update from peers and serves the management API.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfsync::api::HttpServer;
use wolfsync::config::{LoggingConfig, WolfSyncConfig};
use wolfsync::error::Result;
use wolfsync::failover::{DemotionCounter, FailoverHook};
use wolfsync::network::{Transport, UdpTransport};
use wolfsync::state::{MemoryStateTable, StateTable};
use wolfsync::sync::SyncEngine;
use wolfsync::tuning::{auto_tune, tuning_summary};

/// Rows in the state table per engine bucket
const TABLE_ROWS_PER_BUCKET: usize = 64;

/// WolfSync - Firewall Connection-State Replication
#[derive(Parser)]
#[command(name = "wolfsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfsync.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the sync daemon
    Start {
        /// Skip the bulk update request at startup
        #[arg(long)]
        no_bulk: bool,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfsync.toml")]
        output: PathBuf,

        /// Ruleset identity shared by the cluster
        #[arg(long, default_value = "default")]
        ruleset: String,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging settings come from the config file when it can be read
    let logging = WolfSyncConfig::from_file(&cli.config)
        .map(|c| c.logging)
        .unwrap_or_default();
    init_logging(cli.log_level.as_deref(), &logging);

    match cli.command {
        Commands::Start { no_bulk } => run_start(cli.config, no_bulk).await,
        Commands::Init { output, ruleset } => run_init(output, ruleset),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: Option<&str>, logging: &LoggingConfig) {
    let level = level.unwrap_or(&logging.level);
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start the sync daemon
async fn run_start(config_path: PathBuf, no_bulk: bool) -> Result<()> {
    tracing::info!("Starting WolfSync...");

    let mut config = match WolfSyncConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };

    let tuned = auto_tune();
    for line in tuning_summary(&tuned).lines() {
        tracing::info!("{}", line);
    }
    config.sync.apply_tuning(&tuned);

    let host_id = config.host_id();
    tracing::info!(
        "Host id {:08x}, ruleset digest {}",
        host_id,
        hex::encode(config.digest())
    );

    let table = Arc::new(MemoryStateTable::new(
        config.sync.bucket_count() * TABLE_ROWS_PER_BUCKET,
        config.sync.state_limit,
    ));
    let failover = Arc::new(DemotionCounter::new());
    let (engine, rx) = SyncEngine::new(
        config.sync.clone(),
        host_id,
        config.digest(),
        table as Arc<dyn StateTable>,
        failover as Arc<dyn FailoverHook>,
    )?;

    let transport: Arc<dyn Transport> = Arc::new(UdpTransport::bind(&config).await?);
    let shutdown = CancellationToken::new();

    let transmit = tokio::spawn(engine.clone().run(transport.clone(), rx, shutdown.clone()));
    let receive = tokio::spawn(engine.clone().run_receiver(transport, shutdown.clone()));

    let api = {
        let server = HttpServer::new(config.api.clone(), engine.clone());
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = server.start(shutdown).await {
                tracing::error!("HTTP API error: {}", e);
            }
        })
    };

    if no_bulk {
        tracing::info!("Skipping bulk update");
    } else {
        engine.request_bulk();
    }

    tracing::info!("WolfSync running, press Ctrl+C to stop");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();

    for (name, task) in [("transmit", transmit), ("receive", receive)] {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("Sync {} task failed: {}", name, e),
            Err(e) => tracing::error!("Sync {} task panicked: {}", name, e),
        }
    }
    let _ = api.await;

    let stats = engine.stats().snapshot();
    tracing::info!(
        ipackets = stats.ipackets,
        opackets = stats.opackets,
        "WolfSync shutdown complete"
    );
    Ok(())
}

/// Initialize a new configuration file
fn run_init(output: PathBuf, ruleset: String) -> Result<()> {
    let config_content = format!(
        r#"# WolfSync Configuration
# Generated configuration file

[node]
# host_id = 1            # random when unset
ruleset = "{ruleset}"

[sync]
bind_address = "0.0.0.0:8240"
multicast_group = "224.0.0.240"
# interface = "192.168.10.1"
# peer = "192.168.10.2:8240"   # unicast instead of multicast
schema_version = "v2"
mtu = 1472
max_updates = 128
defer = false
defer_timeout_ms = 20
flush_interval_ms = 1000
bulk_retry_ms = 5000
bulk_max_tries = 12
failover_demote = 240
# buckets = 0              # auto from CPU count
# send_queue_len = 0       # auto from bucket count

[api]
enabled = true
bind_address = "127.0.0.1:8241"
cors_enabled = false

[logging]
level = "info"
format = "pretty"
"#
    );

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to set the sync interface and peers.");
    println!("Then start with: wolfsync --config {} start", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfSyncConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Sync Address: {}", config.sync.bind_address);
            println!("  Destination:  {}", config.destination()?);
            println!("  Schema:       {}", config.sync.schema_version);
            println!("  Deferral:     {}", config.sync.defer);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = WolfSyncConfig::from_file(&config_path)?;
    let tuned = auto_tune();

    println!("WolfSync Node Information");
    println!("=========================");
    println!();
    match config.node.host_id {
        Some(id) => println!("Host ID:          {:08x}", id),
        None => println!("Host ID:          (random at start)"),
    }
    println!("Ruleset:          {}", config.node.ruleset);
    println!("Digest:           {}", hex::encode(config.digest()));
    println!();
    println!("Sync Configuration:");
    println!("  Bind Address:   {}", config.sync.bind_address);
    println!("  Destination:    {}", config.destination()?);
    println!("  Schema:         {}", config.sync.schema_version);
    println!("  MTU:            {}", config.sync.mtu);
    println!("  Buckets:        {}", config.sync.bucket_count());
    println!("  Send Queue:     {}", config.sync.queue_len());
    println!("  Max Updates:    {}", config.sync.max_updates);
    println!("  Deferral:       {} ({} ms)", config.sync.defer, config.sync.defer_timeout_ms);
    println!("  Bulk Retry:     {} ms x {}", config.sync.bulk_retry_ms, config.sync.bulk_max_tries);
    println!();
    println!("API:              {}", if config.api.enabled { config.api.bind_address.as_str() } else { "disabled" });
    println!();
    println!("{}", tuning_summary(&tuned));

    Ok(())
}
