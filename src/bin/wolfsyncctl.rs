//! WolfSyncCtl - Command line tool for a running WolfSync daemon
//!
//! Usage:
//!   wolfsyncctl status        - Show engine status
//!   wolfsyncctl stats         - Show protocol counters
//!   wolfsyncctl bulk          - Request a full resync from peers
//!   wolfsyncctl clear         - Tell peers to drop states
//!   wolfsyncctl check-config  - Check a configuration file

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Deserialize;

use wolfsync::api::ClearRequest;
use wolfsync::config::WolfSyncConfig;
use wolfsync::sync::StatsSnapshot;

const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8241";

/// WolfSync Control Tool
#[derive(Parser)]
#[command(name = "wolfsyncctl")]
#[command(about = "Control and monitor a WolfSync daemon", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "/etc/wolfsync/wolfsync.toml")]
    config: PathBuf,

    /// API endpoint to connect to (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show engine status
    Status,
    /// Show protocol counters
    Stats {
        /// Only show counters that are non-zero
        #[arg(long)]
        nonzero: bool,
    },
    /// Request a full resync from peers
    Bulk,
    /// Tell peers to drop states created by a host
    Clear {
        /// Creator host id in hex (defaults to the daemon's own)
        #[arg(long)]
        creator: Option<String>,
        /// Only states on this interface
        #[arg(long, default_value = "")]
        ifname: String,
    },
    /// Check configuration file for errors
    CheckConfig {
        /// Path to config file to check (defaults to --config path)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

// ============ API Response Types ============

#[derive(Debug, Deserialize)]
struct StatusResponse {
    started_at: chrono::DateTime<chrono::Utc>,
    uptime_seconds: i64,
    host_id: u32,
    digest: String,
    schema_version: String,
    buckets: usize,
    states: usize,
    queued_bytes: usize,
    deferrals: usize,
    bulk: BulkStatus,
}

#[derive(Debug, Deserialize)]
struct BulkStatus {
    synchronized: bool,
    #[serde(default)]
    request_pending: bool,
    #[serde(default)]
    tries: u32,
    #[serde(default)]
    serving: bool,
}

#[derive(Debug, Deserialize)]
struct ActionResponse {
    message: String,
}

// ============ Main ============

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let endpoint = cli
        .endpoint
        .clone()
        .unwrap_or_else(|| endpoint_from_config(&cli.config));

    let result = match &cli.command {
        Commands::Status => show_status(&endpoint).await,
        Commands::Stats { nonzero } => show_stats(&endpoint, *nonzero).await,
        Commands::Bulk => request_bulk(&endpoint).await,
        Commands::Clear { creator, ifname } => clear(&endpoint, creator.as_deref(), ifname).await,
        Commands::CheckConfig { file } => {
            let path = file.clone().unwrap_or_else(|| cli.config.clone());
            check_config(&path)
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// API endpoint from the config file, with wildcard binds mapped to localhost
fn endpoint_from_config(path: &PathBuf) -> String {
    match WolfSyncConfig::from_file(path) {
        Ok(config) => {
            let addr = config.api.bind_address;
            match addr.strip_prefix("0.0.0.0:") {
                Some(port) => format!("http://127.0.0.1:{}", port),
                None => format!("http://{}", addr),
            }
        }
        Err(_) => DEFAULT_ENDPOINT.to_string(),
    }
}

// ============ Commands ============

async fn show_status(endpoint: &str) -> anyhow::Result<()> {
    let url = format!("{}/status", endpoint);
    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("Failed to reach {}", url))?;
    if !response.status().is_success() {
        bail!("API error: {}", response.status());
    }
    let status: StatusResponse = response.json().await?;

    println!();
    println!("WolfSync Status");
    println!("===============");
    println!();
    println!("Host ID:       {:08x}", status.host_id);
    println!("Digest:        {}", status.digest);
    println!("Schema:        {}", status.schema_version);
    println!("Started:       {}", status.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("Uptime:        {}s", status.uptime_seconds);
    println!();
    println!("States:        {}", status.states);
    println!("Buckets:       {}", status.buckets);
    println!("Queued:        {} bytes", status.queued_bytes);
    println!("Deferred:      {}", status.deferrals);
    println!(
        "Synchronized:  {}",
        if status.bulk.synchronized { "yes" } else { "NO" }
    );
    if status.bulk.request_pending {
        println!("Bulk request:  pending (try {})", status.bulk.tries + 1);
    }
    if status.bulk.serving {
        println!("Bulk send:     in progress");
    }
    println!();

    Ok(())
}

async fn show_stats(endpoint: &str, nonzero: bool) -> anyhow::Result<()> {
    let url = format!("{}/stats", endpoint);
    let response = reqwest::get(&url)
        .await
        .with_context(|| format!("Failed to reach {}", url))?;
    if !response.status().is_success() {
        bail!("API error: {}", response.status());
    }
    let stats: StatsSnapshot = response.json().await?;

    // Listed by name
    let counters = serde_json::to_value(&stats)?;
    if let serde_json::Value::Object(map) = counters {
        for (name, value) in map {
            let value = value.as_u64().unwrap_or(0);
            if nonzero && value == 0 {
                continue;
            }
            println!("{:<24} {}", name, value);
        }
    }

    Ok(())
}

async fn request_bulk(endpoint: &str) -> anyhow::Result<()> {
    let url = format!("{}/bulk", endpoint);
    let response = reqwest::Client::new()
        .post(&url)
        .send()
        .await
        .with_context(|| format!("Failed to reach {}", url))?;
    if !response.status().is_success() {
        bail!("API error: {}", response.status());
    }
    let result: ActionResponse = response.json().await?;
    println!("{}", result.message);
    Ok(())
}

async fn clear(endpoint: &str, creator: Option<&str>, ifname: &str) -> anyhow::Result<()> {
    let creator_id = creator
        .map(|c| u32::from_str_radix(c.trim_start_matches("0x"), 16))
        .transpose()
        .context("Creator must be a hex host id")?;

    let url = format!("{}/states/clear", endpoint);
    let response = reqwest::Client::new()
        .post(&url)
        .json(&ClearRequest {
            creator_id,
            ifname: ifname.to_string(),
        })
        .send()
        .await
        .with_context(|| format!("Failed to reach {}", url))?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        bail!("API error: {} {}", status, body);
    }
    let result: ActionResponse = response.json().await?;
    println!("{}", result.message);
    Ok(())
}

fn check_config(path: &PathBuf) -> anyhow::Result<()> {
    println!("Checking {}", path.display());
    let config = WolfSyncConfig::from_file(path)
        .with_context(|| format!("Invalid configuration {}", path.display()))?;

    println!("✓ Configuration is valid");
    println!("  Ruleset:      {}", config.node.ruleset);
    println!("  Sync Address: {}", config.sync.bind_address);
    println!("  Destination:  {}", config.destination()?);
    println!("  MTU:          {}", config.sync.mtu);
    if config.sync.defer {
        println!("  Deferral:     {} ms", config.sync.defer_timeout_ms);
    }
    Ok(())
}
