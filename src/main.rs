use clap::{Parser, Subcommand};
use color_eyre::eyre::eyre;
use fuzzgrid::agent::remote::serve_agent;
use fuzzgrid::campaign::manager::CampaignManager;
use fuzzgrid::campaign::Collaborators;
use fuzzgrid::config::FuzzConfig;
use fuzzgrid::dedup::fingerprint;
use fuzzgrid::execution::ExecutionRequest;
use fuzzgrid::harness::Harness;
use fuzzgrid::markov::{MutationGenerator, SeedPool};
use fuzzgrid::process_monitor::TargetMonitor;
use fuzzgrid::protocol::ProtocolRegistry;
use fuzzgrid::store::FileStore;
use rand::{thread_rng, Rng};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    subcommand: SubCommands,
    /// Serve tokio-console instead of logging to stdout
    #[arg(long, default_value_t = false)]
    console: bool,
}

#[derive(Subcommand, Debug)]
enum SubCommands {
    /// Run a campaign with the built-in mutation generator
    Fuzz {
        #[arg(short, long, default_value = "fuzzgrid.toml")]
        config: PathBuf,
        /// Payloads per target
        #[arg(short, long)]
        iterations: Option<u64>,
        #[arg(long)]
        seed: Option<u64>,
        /// Request timeout in milliseconds
        #[arg(long)]
        timeout: Option<u64>,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Serve a remote execution agent
    Agent {
        #[arg(short, long, default_value = "0.0.0.0:7070")]
        listen: String,
        #[arg(long, default_value = "agent-0")]
        id: String,
        /// Config with a target process to supervise
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Send the payload of a stored crash again
    Replay {
        #[arg(long)]
        crash: PathBuf,
        #[arg(short, long, default_value = "fuzzgrid.toml")]
        config: PathBuf,
        /// Request timeout in milliseconds
        #[arg(long)]
        timeout: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    if cli.console {
        console_subscriber::init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .init();
    }
    match cli.subcommand {
        SubCommands::Fuzz {
            config,
            iterations,
            seed,
            timeout,
            output,
        } => {
            let mut config = FuzzConfig::read_from_file(&config).await?;
            if let Some(iterations) = iterations {
                config.iterations = iterations;
            }
            if let Some(seed) = seed {
                config.seed = Some(seed);
            }
            if let Some(timeout) = timeout {
                config.request_timeout_ms = timeout;
            }
            if let Some(output) = output {
                config.output = output;
            }
            fuzz(config).await?;
        }
        SubCommands::Agent { listen, id, config } => {
            let registry = Arc::new(ProtocolRegistry::with_builtin());
            let harness = Arc::new(Harness::new(registry));
            let monitor = match config {
                Some(path) => supervise_target(&FuzzConfig::read_from_file(path).await?, &harness).await?,
                None => None,
            };
            let listener = TcpListener::bind(&listen).await?;
            info!("Agent {id} listening on {}", listener.local_addr()?);
            let shutdown = CancellationToken::new();
            let interrupt = shutdown.clone();
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                interrupt.cancel();
            });
            serve_agent(listener, id, harness, shutdown).await?;
            if let Some(monitor) = monitor {
                monitor.shutdown();
            }
        }
        SubCommands::Replay {
            crash,
            config,
            timeout,
        } => {
            let config = FuzzConfig::read_from_file(&config).await?;
            let record = FileStore::read_crash(&crash).await?;
            let target = config
                .target(&record.target)
                .cloned()
                .ok_or_else(|| eyre!("target {} is not in the config", record.target))?;
            let harness = Harness::new(Arc::new(ProtocolRegistry::with_builtin()));
            let monitor = supervise_target(&config, &harness).await?;
            let request = ExecutionRequest::new(
                record.representative_request_id,
                target,
                record.representative_payload.clone(),
            );
            let timeout = Duration::from_millis(timeout.unwrap_or(config.request_timeout_ms));
            let result = harness.execute(&request, timeout).await;
            match &result.signal {
                Some(signal) if fingerprint(&record.target, signal) == record.fingerprint => {
                    info!("Crash {} reproduced: {}", record.fingerprint, signal.diagnostic);
                }
                Some(signal) => {
                    warn!(
                        "Target crashed differently ({}): {}",
                        fingerprint(&record.target, signal),
                        signal.diagnostic
                    );
                }
                None => info!("No crash, outcome was {}", result.outcome),
            }
            if let Some(monitor) = monitor {
                monitor.shutdown();
            }
        }
    }
    Ok(())
}

async fn fuzz(config: FuzzConfig) -> color_eyre::Result<()> {
    if config.targets.is_empty() {
        return Err(eyre!("no targets configured"));
    }
    let registry = Arc::new(ProtocolRegistry::with_builtin());
    let harness = Arc::new(Harness::new(registry.clone()));
    let monitor = supervise_target(&config, &harness).await?;
    let pool = match &config.seed_pool {
        Some(path) => SeedPool::read_from_file(path).await?,
        None => SeedPool::new(),
    };
    let seed = config.seed.unwrap_or_else(|| thread_rng().gen());
    info!("Fuzzing with seed {seed}, {} learned seeds", pool.len());
    let generator = Arc::new(MutationGenerator::new(
        registry.clone(),
        pool,
        seed,
        config.iterations,
    ));
    let collaborators = Collaborators::new(generator.clone())
        .with_feedback(generator.clone())
        .with_store(Arc::new(FileStore::new(config.output.clone())));
    let manager = CampaignManager::new(registry, config.build_agents(&harness), collaborators)
        .with_scheduler_config(config.scheduler_config())
        .with_settings(config.campaign_settings());

    let id = manager.create_campaign(config.targets.clone())?;
    manager.start_campaign(&id)?;
    let summary = tokio::select! {
        summary = manager.wait_campaign(&id) => summary?,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, draining {id}");
            manager.stop_campaign(&id)?;
            manager.wait_campaign(&id).await?
        }
    };
    if let Some(monitor) = monitor {
        monitor.shutdown();
    }
    info!(
        "{id} {}: {} executions, {} crashes, {} unique, {:.1} exec/s",
        summary.state, summary.executions, summary.crash_count, summary.fingerprint_count, summary.throughput
    );
    info!("Results written to {}", config.output.join(&id).display());
    Ok(())
}

/// Starts the configured target process and lets the harness watch it.
async fn supervise_target(config: &FuzzConfig, harness: &Harness) -> color_eyre::Result<Option<TargetMonitor>> {
    let Some(process) = &config.target_process else {
        return Ok(None);
    };
    let monitor = TargetMonitor::spawn(
        &process.command,
        &process.args,
        process.restart,
        Duration::from_millis(process.startup_delay_ms),
    )
    .await?;
    harness.attach_monitor(process.target.clone(), monitor.clone());
    info!("Supervising {} for target {}", process.command, process.target);
    Ok(Some(monitor))
}
