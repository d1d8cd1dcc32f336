//! ShardMaster - Coordination tier for a replicated key-value store
//!
//! Routes client requests to data-node replica groups, replicates writes,
//! resolves reads and tracks node health.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use shardmaster::api::HttpServer;
use shardmaster::config::{LoggingConfig, MasterConfig};
use shardmaster::error::Result;
use shardmaster::master::{MasterEngine, VERSION};
use shardmaster::network::{NodeClient, NodeTransport};
use shardmaster::server::RequestDispatchLoop;
use shardmaster::state::HealthProbe;

/// Idle pooled connections older than this are closed
const STALE_CONNECTION_AGE: Duration = Duration::from_secs(60);

/// ShardMaster - Coordination tier for a replicated key-value store
#[derive(Parser)]
#[command(name = "shardmaster")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "shardmaster.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides [logging]
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the master
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "shardmaster.toml")]
        output: PathBuf,

        /// Master ID
        #[arg(long, default_value = "master-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,

    /// Show configuration summary
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging settings come from the config file when it is readable
    let logging = MasterConfig::from_file(&cli.config)
        .map(|c| c.logging)
        .unwrap_or_default();
    init_logging(cli.log_level.as_deref().unwrap_or(&logging.level), &logging);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str, logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "compact" {
        registry.with(tracing_subscriber::fmt::layer().compact()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start the master
async fn run_start(config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting ShardMaster {}...", VERSION);

    let config = match MasterConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Please check that the config file exists and is valid TOML");
            return Err(e);
        }
    };
    tracing::info!("Loaded configuration for master: {}", config.node.id);

    let client = Arc::new(NodeClient::from_config(&config));
    let transport: Arc<dyn NodeTransport> = client.clone();
    let engine = Arc::new(MasterEngine::new(&config, Arc::clone(&transport))?);

    // Health probe
    let probe = config.probe_interval().map(|period| {
        Arc::new(HealthProbe::new(
            Arc::clone(engine.directory()),
            Arc::clone(&transport),
            period,
        ))
    });
    let probe_handle = probe.as_ref().map(|probe| {
        let probe = Arc::clone(probe);
        tokio::spawn(async move { probe.run().await })
    });
    if probe.is_none() {
        tracing::info!("Health probe disabled");
    }

    // Idle connection cleanup
    let cleanup_client = Arc::clone(&client);
    let cleanup_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STALE_CONNECTION_AGE);
        loop {
            ticker.tick().await;
            cleanup_client.cleanup_stale(STALE_CONNECTION_AGE).await;
        }
    });

    // HTTP API
    let http_server = HttpServer::new(config.api.clone(), config.node.id.clone(), Arc::clone(&engine));
    let http_handle = tokio::spawn(async move {
        if let Err(e) = http_server.start().await {
            tracing::error!("HTTP server error: {}", e);
        }
    });

    // Client server
    let listener = match TcpListener::bind(&config.node.bind_address).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", config.node.bind_address, e);
            return Err(e.into());
        }
    };
    let dispatch = Arc::new(RequestDispatchLoop::new(Arc::clone(&engine), &config.workers));
    let serving = Arc::clone(&dispatch);
    let mut dispatch_handle = tokio::spawn(async move { serving.serve(listener).await });

    tokio::select! {
        result = &mut dispatch_handle => {
            match result {
                Ok(Err(e)) => tracing::error!("Client server error: {}", e),
                Err(e) => tracing::error!("Client server task failed: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    // Cleanup
    dispatch.stop();
    if let Some(probe) = &probe {
        probe.stop();
    }
    if let Some(handle) = probe_handle {
        let _ = handle.await;
    }
    cleanup_handle.abort();
    http_handle.abort();
    let _ = tokio::time::timeout(Duration::from_secs(5), dispatch_handle).await;
    client.close_all().await;

    tracing::info!("ShardMaster shutdown complete");
    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf, node_id: String) -> Result<()> {
    let config_content = format!(r#"# ShardMaster Configuration
# Generated configuration file

[node]
id = "{node_id}"
bind_address = "0.0.0.0:5552"

[dispatch]
# weak, medium or strong
consistency = "weak"
# isolation_prefix = "app1_"

# Newest generation receives writes; older ones are read fallbacks.
[[rules]]
generation = 1
algorithm = "consistent_hash"

[[rules.groups]]
primary = "10.0.0.1:5553"
secondary = "10.0.0.2:5553"
# tertiary = "10.0.0.3:5553"

[transaction]
enabled = false
# manager = "10.0.0.9:6655"
lock_gate_timeout_ms = 5000
lock_poll_interval_ms = 10

[limits]
max_key_length = 486
max_value_length = 1048576

[timeouts]
connect_ms = 4000
request_ms = 8000
long_request_ms = 16000
ping_ms = 2500

[failover]
failure_threshold = 3
drain_poll_ms = 50
probe_interval_ms = 5000
max_idle_connections = 16

[workers]
count = 16
queue_capacity = 1024
fairness_threshold = 2
idle_poll_ms = 200

[api]
enabled = true
bind_address = "0.0.0.0:8080"
cors_enabled = false

[logging]
level = "info"
format = "pretty"
"#);

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to describe your data nodes and placement rules.");
    println!("Then start with: shardmaster start --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match MasterConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Master ID: {}", config.node.id);
            println!("  Bind Address: {}", config.node.bind_address);
            println!("  Rule Generations: {}", config.rules.len());
            println!("  Data Nodes: {}", config.data_nodes().len());
            println!("  Consistency: {}", config.dispatch.consistency);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show configuration summary
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = MasterConfig::from_file(&config_path)?;

    println!("ShardMaster Information");
    println!("=======================");
    println!();
    println!("Master ID:        {}", config.node.id);
    println!("Bind Address:     {}", config.node.bind_address);
    println!("Version:          {}", VERSION);
    println!();
    println!("Dispatch:");
    println!("  Consistency:    {}", config.dispatch.consistency);
    println!(
        "  Prefix:         {}",
        config.dispatch.isolation_prefix.as_deref().unwrap_or("(none)")
    );
    println!();
    println!("Placement Rules:");
    let mut rules: Vec<_> = config.rules.iter().collect();
    rules.sort_by(|a, b| b.generation.cmp(&a.generation));
    for rule in rules {
        println!(
            "  Generation {:<4} {:?}, {} groups",
            rule.generation,
            rule.algorithm,
            rule.groups.len()
        );
        for group in &rule.groups {
            println!("    {}", group.addresses().collect::<Vec<_>>().join(" / "));
        }
    }
    println!();
    println!("Transactions:");
    println!("  Enabled:        {}", config.transaction.enabled);
    println!(
        "  Manager:        {}",
        config.transaction.manager.as_deref().unwrap_or("(none)")
    );
    println!();
    println!("Workers:          {}", config.workers.count);
    println!("Failure Limit:    {}", config.failover.failure_threshold);

    Ok(())
}
