//! ShardCtl - Command line tool for operating a ShardMaster
//!
//! Usage:
//!   shardctl status              - Show master health
//!   shardctl nodes               - Show data node health
//!   shardctl pause <node>        - Pause a node and wait for it to drain
//!   shardctl recover start <node>

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;

/// ShardMaster Control Tool
#[derive(Parser)]
#[command(name = "shardctl")]
#[command(about = "Control and monitor a ShardMaster", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "/etc/shardmaster/config.toml")]
    config: PathBuf,

    /// API endpoint to connect to (overrides config)
    #[arg(short, long)]
    endpoint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show master health summary
    Status,
    /// List data nodes and their health
    Nodes,
    /// Show one data node
    Node {
        /// Node address (host:port)
        name: String,
    },
    /// Pause nodes; returns once in-flight operations drained
    Pause {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Resume paused nodes
    Resume {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Exclude a node from all dispatch
    Dead { name: String },
    /// Return a dead or paused node to service
    Arrive { name: String },
    /// Recovery mode control
    Recover {
        #[command(subcommand)]
        action: RecoveryAction,
    },
    /// Show the master version
    Version,
    /// Watch node health (updates every second, Ctrl+C to exit)
    Watch,
}

#[derive(Subcommand)]
enum RecoveryAction {
    /// Force a node into dispatch while it resynchronizes
    Start { name: String },
    /// Clear the recovery flag
    End { name: String },
}

// ============ API Types ============

#[derive(Debug, Deserialize)]
struct HealthResponse {
    healthy: bool,
    node_id: String,
    #[serde(default)]
    uptime_seconds: u64,
    summary: HealthSummary,
}

#[derive(Debug, Deserialize)]
struct HealthSummary {
    total: usize,
    arrived: usize,
    paused: usize,
    dead: usize,
    recovering: usize,
}

#[derive(Debug, Deserialize)]
struct NodeReport {
    name: String,
    health: String,
    recovering: bool,
    eligible: bool,
    in_flight: usize,
    consecutive_failures: u32,
    changed_at: String,
}

#[derive(Debug, Deserialize)]
struct ControlResponse {
    success: bool,
    node: String,
    message: Option<String>,
    report: Option<NodeReport>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Debug, Deserialize)]
struct VersionResponse {
    version: String,
}

// ============ Config ============

#[derive(Debug, Deserialize)]
struct Config {
    #[serde(default)]
    api: ApiConfig,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfig {
    #[serde(default = "default_api_bind")]
    bind_address: String,
}

fn default_api_bind() -> String {
    "0.0.0.0:8080".to_string()
}

// ============ Main ============

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let endpoint = match &cli.endpoint {
        Some(e) => e.clone(),
        None => endpoint_from_config(&cli.config),
    };

    let result = match &cli.command {
        Commands::Status => show_status(&endpoint).await,
        Commands::Nodes => list_nodes(&endpoint).await,
        Commands::Node { name } => show_node(&endpoint, name).await,
        Commands::Pause { names } => control_all(&endpoint, names, "pause").await,
        Commands::Resume { names } => control_all(&endpoint, names, "resume").await,
        Commands::Dead { name } => control(&endpoint, name, "dead").await,
        Commands::Arrive { name } => control(&endpoint, name, "arrive").await,
        Commands::Recover { action } => match action {
            RecoveryAction::Start { name } => control(&endpoint, name, "recovery/start").await,
            RecoveryAction::End { name } => control(&endpoint, name, "recovery/end").await,
        },
        Commands::Version => show_version(&endpoint).await,
        Commands::Watch => watch(&endpoint).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// API endpoint from the config file, localhost when it binds all interfaces
fn endpoint_from_config(path: &PathBuf) -> String {
    let fallback = "http://127.0.0.1:8080".to_string();
    let Ok(content) = std::fs::read_to_string(path) else {
        return fallback;
    };
    match toml::from_str::<Config>(&content) {
        Ok(config) => {
            let addr = config.api.bind_address;
            if addr.starts_with("0.0.0.0") {
                format!("http://127.0.0.1:{}", addr.split(':').nth(1).unwrap_or("8080"))
            } else {
                format!("http://{}", addr)
            }
        }
        Err(_) => fallback,
    }
}

// ============ Commands ============

async fn show_status(endpoint: &str) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/health", endpoint);
    let response = reqwest::Client::new().get(&url).send().await?;

    if !response.status().is_success() {
        return Err(format!("API error: {}", response.status()).into());
    }

    let health: HealthResponse = response.json().await?;

    println!();
    println!("Master Status");
    println!("=============");
    println!();
    println!("Master ID:    {}", health.node_id);
    println!("Healthy:      {}", if health.healthy { "yes" } else { "NO" });
    println!("Uptime:       {}s", health.uptime_seconds);
    println!(
        "Nodes:        {} total  |  {} arrived  |  {} paused  |  {} dead  |  {} recovering",
        health.summary.total,
        health.summary.arrived,
        health.summary.paused,
        health.summary.dead,
        health.summary.recovering
    );
    println!();

    Ok(())
}

async fn list_nodes(endpoint: &str) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/nodes", endpoint);
    let response = reqwest::Client::new().get(&url).send().await?;

    if !response.status().is_success() {
        return Err(format!("API error: {}", response.status()).into());
    }

    let nodes: Vec<NodeReport> = response.json().await?;

    println!();
    println!("Data Nodes (shardctl v{})", env!("CARGO_PKG_VERSION"));
    println!("=========================");
    println!();
    print_table(&nodes);
    println!();

    Ok(())
}

async fn show_node(endpoint: &str, name: &str) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/nodes/{}", endpoint, name);
    let response = reqwest::Client::new().get(&url).send().await?;

    if !response.status().is_success() {
        return Err(api_error(response).await);
    }

    let node: NodeReport = response.json().await?;

    println!();
    println!("Node:         {}", node.name);
    println!("Health:       {}", colored_health(&node.health, 0));
    println!("Recovering:   {}", node.recovering);
    println!("Eligible:     {}", node.eligible);
    println!("In Flight:    {}", node.in_flight);
    println!("Failures:     {}", node.consecutive_failures);
    println!("Changed At:   {}", node.changed_at);
    println!();

    Ok(())
}

async fn control(endpoint: &str, name: &str, action: &str) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/nodes/{}/{}", endpoint, name, action);
    let response = reqwest::Client::new().post(&url).send().await?;

    if !response.status().is_success() {
        return Err(api_error(response).await);
    }

    let result: ControlResponse = response.json().await?;

    if result.success {
        match &result.report {
            Some(report) => println!(
                "{}: {} {}",
                result.node,
                report.health,
                if report.recovering { "(recovering)" } else { "" }
            ),
            None => println!("{}: {} requested", result.node, action),
        }
    } else {
        println!("{}: {} failed", result.node, action);
    }
    if let Some(msg) = result.message {
        println!("{}", msg);
    }

    Ok(())
}

/// Apply one action to several nodes concurrently
async fn control_all(endpoint: &str, names: &[String], action: &str) -> Result<(), Box<dyn std::error::Error>> {
    let results = futures::future::join_all(names.iter().map(|name| control(endpoint, name, action))).await;
    let failed = results.into_iter().filter_map(|r| r.err()).map(|e| e.to_string()).collect::<Vec<_>>();
    if failed.is_empty() {
        Ok(())
    } else {
        Err(failed.join("; ").into())
    }
}

async fn show_version(endpoint: &str) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/version", endpoint);
    let response = reqwest::Client::new().get(&url).send().await?;

    if !response.status().is_success() {
        return Err(format!("API error: {}", response.status()).into());
    }

    let version: VersionResponse = response.json().await?;
    println!("shardmaster {}", version.version);
    println!("shardctl    {}", env!("CARGO_PKG_VERSION"));

    Ok(())
}

async fn watch(endpoint: &str) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/nodes", endpoint);
    let client = reqwest::Client::new();

    // Hide cursor
    print!("\x1b[?25l");

    let running = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, std::sync::atomic::Ordering::SeqCst);
    })?;

    while running.load(std::sync::atomic::Ordering::SeqCst) {
        // Clear screen and move cursor to top
        print!("\x1b[H\x1b[J");

        println!();
        println!("  \x1b[1;36mShardMaster Node Health\x1b[0m");
        println!("  {}", "=".repeat(50));
        println!();

        match client.get(&url).send().await {
            Ok(response) if response.status().is_success() => match response.json::<Vec<NodeReport>>().await {
                Ok(nodes) => print_table(&nodes),
                Err(e) => println!("  \x1b[31mBad response: {}\x1b[0m", e),
            },
            Ok(response) => println!("  \x1b[31mAPI error: {}\x1b[0m", response.status()),
            Err(e) => println!("  \x1b[31mCannot reach {}: {}\x1b[0m", endpoint, e),
        }

        println!();
        println!("  Ctrl+C to exit");
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }

    // Show cursor
    print!("\x1b[?25h");
    println!();

    Ok(())
}

// ============ Output ============

fn print_table(nodes: &[NodeReport]) {
    println!(
        "{:<24} {:<10} {:<11} {:<9} {:<9}",
        "NODE", "HEALTH", "RECOVERING", "IN FLIGHT", "FAILURES"
    );
    println!("{}", "-".repeat(67));

    for node in nodes {
        println!(
            "{:<24} {} {:<11} {:<9} {:<9}",
            node.name,
            colored_health(&node.health, 10),
            if node.recovering { "yes" } else { "" },
            node.in_flight,
            node.consecutive_failures
        );
    }
}

/// Pad to width before adding color codes
fn colored_health(health: &str, width: usize) -> String {
    let padded = format!("{:<width$}", health.to_uppercase(), width = width);
    match health {
        "Arrived" => format!("\x1b[32m{}\x1b[0m", padded),
        "Paused" => format!("\x1b[33m{}\x1b[0m", padded),
        "Dead" => format!("\x1b[31m{}\x1b[0m", padded),
        _ => padded,
    }
}

async fn api_error(response: reqwest::Response) -> Box<dyn std::error::Error> {
    let status = response.status();
    match response.json::<ErrorResponse>().await {
        Ok(body) => format!("{} ({})", body.error, status).into(),
        Err(_) => format!("API error: {}", status).into(),
    }
}
