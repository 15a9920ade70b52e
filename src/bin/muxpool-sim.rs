use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use muxpool::loopback::{LoopbackConnector, PeerScript};
use muxpool::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "muxpool-sim")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long)]
    log_level: Option<String>,

    /// Pool configuration file (TOML, JSON or YAML)
    #[arg(short, long)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive exchanges through a pool backed by a loopback peer
    Run {
        #[arg(short, long, default_value_t = 200)]
        exchanges: usize,

        #[arg(short, long, default_value_t = 32)]
        parallelism: usize,

        /// SETTINGS_MAX_CONCURRENT_STREAMS advertised by the peer
        #[arg(long, default_value_t = 10)]
        peer_max_streams: u32,

        /// Simulated exchange duration in milliseconds
        #[arg(long, default_value_t = 5)]
        hold_ms: u64,

        /// Make the peer select HTTP/1.1 through ALPN
        #[arg(long)]
        http1: bool,
    },

    /// Print the effective configuration
    Config,
}

fn load_config(path: Option<&str>) -> Result<PoolConfig> {
    let config = match path {
        Some(path) => PoolConfig::load_from_file(path)
            .with_context(|| format!("loading configuration from {}", path))?,
        None => PoolConfig::default(),
    };
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::filter::LevelFilter::from_level(config.tracing_level()))
        .init();

    match cli.command {
        Commands::Run {
            exchanges,
            parallelism,
            peer_max_streams,
            hold_ms,
            http1,
        } => {
            let script = if http1 {
                PeerScript::http1()
            } else {
                PeerScript::http2(Some(peer_max_streams))
            };
            run(config, script, exchanges, parallelism, Duration::from_millis(hold_ms)).await?;
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

async fn run(
    config: PoolConfig,
    script: PeerScript,
    exchanges: usize,
    parallelism: usize,
    hold: Duration,
) -> Result<()> {
    info!("muxpool-sim v{} starting {} exchanges", env!("CARGO_PKG_VERSION"), exchanges);

    let connector = Arc::new(LoopbackConnector::new(script));
    let pool = Arc::new(PoolBuilder::new(connector.clone()).config(config).build()?);

    let workers = parallelism.max(1);
    let per_worker = exchanges.div_ceil(workers);
    let mut handles = Vec::with_capacity(workers);
    for worker in 0..workers {
        let pool = pool.clone();
        let count = per_worker.min(exchanges.saturating_sub(worker * per_worker));
        handles.push(tokio::spawn(async move {
            let mut failures = 0usize;
            for _ in 0..count {
                match pool.acquire().await {
                    Ok(channel) => {
                        tokio::time::sleep(hold).await;
                        if let Err(err) = pool.release(channel).await {
                            warn!("Release failed: {}", err);
                            failures += 1;
                        }
                    }
                    Err(err) => {
                        warn!("Acquire failed: {}", err);
                        failures += 1;
                    }
                }
            }
            failures
        }));
    }

    let mut failures = 0;
    for handle in handles {
        failures += handle.await?;
    }

    let mut snapshot = MetricSnapshot::new();
    pool.collect_metrics(&mut snapshot);
    let report = serde_json::json!({
        "protocol": pool.protocol(),
        "exchanges": exchanges,
        "failures": failures,
        "connections": connector.connect_count(),
        "metrics": snapshot,
        "raw_pool": pool.raw_stats(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    pool.close().await?;
    info!("Simulation complete");
    Ok(())
}
