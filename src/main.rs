//! Listing Radar - real-time crypto listing detection and signal fusion
//!
//! Correlates exchange feeds, Telegram channels, news and on-chain probes
//! into trigger decisions within seconds of the earliest evidence.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::time::Duration;
use tracing::{error, info, warn};

use listing_radar::config::Config;
use listing_radar::runtime::{Component, RunOptions, Runtime};

/// Listing Radar - multi-source listing detection
#[derive(Parser)]
#[command(name = "radar")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the unified runner
    Start {
        /// Run without outbound delivery (no webhook sends)
        #[arg(long)]
        dry_run: bool,

        /// Run a single component: monitors, fusion, pusher
        #[arg(long)]
        only: Option<String>,
    },

    /// Show current configuration (secrets masked)
    Config,

    /// Probe configured endpoints and report reachability
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("listing_radar=info".parse().unwrap()),
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration; invalid configuration refuses to start
    let config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Start { dry_run, only } => {
            let only = match only {
                Some(name) => match Component::parse(&name) {
                    Some(c) => Some(c),
                    None => {
                        error!("Unknown component: {} (monitors, fusion, pusher)", name);
                        std::process::exit(1);
                    }
                },
                None => None,
            };
            if dry_run {
                warn!("Running in DRY-RUN mode - no outbound messages will be sent");
            }
            start(config, RunOptions { dry_run, only }).await
        }
        Commands::Config => {
            println!("{}", config.masked_display());
            Ok(())
        }
        Commands::Health => health(&config).await,
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}

async fn start(config: Config, options: RunOptions) -> Result<()> {
    info!("Starting listing radar...");
    info!(
        "Aggregation window: {}s, score threshold: {}",
        config.aggregation.window_secs, config.trigger.score_threshold
    );
    let runtime = Runtime::new(config);
    runtime.run(options).await?;
    Ok(())
}

/// Probe configured sources and report reachability
async fn health(config: &Config) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeouts.rest_secs))
        .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
        .build()?;

    let mut failures = 0;

    for endpoint in &config.monitors.exchanges {
        if !endpoint.enabled || endpoint.rest_url.is_empty() {
            continue;
        }
        match client.get(&endpoint.rest_url).send().await {
            Ok(resp) if resp.status().is_success() => {
                println!("OK    {:10} {}", endpoint.name, endpoint.rest_url);
            }
            Ok(resp) => {
                println!(
                    "WARN  {:10} {} (status {})",
                    endpoint.name,
                    endpoint.rest_url,
                    resp.status().as_u16()
                );
            }
            Err(e) => {
                failures += 1;
                println!("FAIL  {:10} {} ({})", endpoint.name, endpoint.rest_url, e);
            }
        }
    }

    for probe in &config.chain.probes {
        if !probe.enabled {
            continue;
        }
        let payload =
            serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "eth_blockNumber", "params": []});
        match client.post(&probe.rpc_url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {
                println!("OK    {:10} {}", probe.name, probe.rpc_url);
            }
            Ok(resp) => {
                println!(
                    "WARN  {:10} {} (status {})",
                    probe.name,
                    probe.rpc_url,
                    resp.status().as_u16()
                );
            }
            Err(e) => {
                failures += 1;
                println!("FAIL  {:10} {} ({})", probe.name, probe.rpc_url, e);
            }
        }
    }

    if config.pusher.webhook_url.is_empty() {
        println!("WARN  webhook    (not configured)");
    }

    if failures > 0 {
        warn!("{} endpoints unreachable", failures);
    } else {
        info!("All probed endpoints reachable");
    }
    Ok(())
}
