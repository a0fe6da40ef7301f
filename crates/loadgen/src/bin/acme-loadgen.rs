//! ACME Load Generator CLI
//!
//! Drive an ACME service with simulated accounts, or run the HTTP-01
//! challenge responder the load generator starts for itself.
//!
//! # Example
//!
//! ```bash
//! # 60s at 10 actions/s, warming up 100 accounts first
//! acme-loadgen run --directory-url https://localhost:4431/directory \
//!     --rate 10 --runtime 60 --warmup-actors 100 --warmup-workers 8
//!
//! # Ramp: 30s at 5/s then 30s at 50/s, keeping accounts for the next run
//! acme-loadgen run --config loadgen.toml --plan 30:5,30:50 --save actors.json
//!
//! # Challenge responder only
//! acme-loadgen chall-srv --rpc-addr 127.0.0.1:6060 --http-one-addr 0.0.0.0:5002
//! ```

use acme_loadgen::challsrv;
use acme_loadgen::{ActorStore, LoadGenerator, LoadgenConfig, RatePeriod};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// ACME load generator
#[derive(Parser, Debug)]
#[command(name = "acme-loadgen")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Log level used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a load test
    Run(RunArgs),
    /// Run the HTTP-01 challenge responder
    ChallSrv(ChallSrvArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// ACME directory URL
    #[arg(long)]
    directory_url: Option<String>,

    /// Base actions per second
    #[arg(long)]
    rate: Option<u64>,

    /// Rate plan as comma-separated <secs>:<rate> segments, e.g. 30:5,30:50
    #[arg(long, value_delimiter = ',')]
    plan: Vec<RatePeriod>,

    /// Total dispatch time in seconds
    #[arg(long)]
    runtime: Option<u64>,

    /// Population cap (0 = unbounded)
    #[arg(long)]
    max_actors: Option<usize>,

    /// Accounts to create before dispatch begins
    #[arg(long)]
    warmup_actors: Option<usize>,

    /// Concurrent warmup workers
    #[arg(long)]
    warmup_workers: Option<usize>,

    /// Value for the X-Real-IP header
    #[arg(long)]
    real_ip: Option<String>,

    /// Seed for action selection
    #[arg(long)]
    seed: Option<u64>,

    /// Don't start the challenge responder
    #[arg(long)]
    skip_chall_srv: bool,

    /// Binary to run as the challenge responder (defaults to this one)
    #[arg(long)]
    chall_srv_binary: Option<PathBuf>,

    /// Restore accounts from this snapshot before the run
    #[arg(long)]
    restore: Option<PathBuf>,

    /// Save accounts to this snapshot after the run
    #[arg(long)]
    save: Option<PathBuf>,

    /// Write latency results to this JSON file
    #[arg(long)]
    results: Option<PathBuf>,
}

impl RunArgs {
    fn load_config(&self) -> Result<LoadgenConfig> {
        let mut config = match &self.config {
            Some(path) => LoadgenConfig::from_toml_file(path)
                .with_context(|| format!("Failed to load config file: {}", path.display()))?,
            None => LoadgenConfig::default(),
        };

        if let Some(url) = &self.directory_url {
            config.directory_url = url.clone();
        }
        if let Some(rate) = self.rate {
            config.rate = rate;
        }
        if !self.plan.is_empty() {
            config.run_plan = self.plan.clone();
        }
        if let Some(runtime) = self.runtime {
            config.runtime_secs = runtime;
        }
        if let Some(max) = self.max_actors {
            config.max_actors = max;
        }
        if let Some(actors) = self.warmup_actors {
            config.warmup_actors = actors;
        }
        if let Some(workers) = self.warmup_workers {
            config.warmup_workers = workers;
        }
        if let Some(ip) = &self.real_ip {
            config.real_ip = ip.clone();
        }
        if let Some(seed) = self.seed {
            config.seed = Some(seed);
        }
        if self.skip_chall_srv {
            config.challenge.skip = true;
        }
        if let Some(binary) = &self.chall_srv_binary {
            config.challenge.binary = Some(binary.clone());
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

#[derive(Args, Debug)]
struct ChallSrvArgs {
    /// Address for token registration requests
    #[arg(long, default_value = "127.0.0.1:6060")]
    rpc_addr: String,

    /// Address for HTTP-01 validation requests
    #[arg(long, default_value = "0.0.0.0:5002")]
    http_one_addr: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    match cli.command {
        Command::Run(args) => run(args, cancel).await,
        Command::ChallSrv(args) => chall_srv(args, cancel).await,
    }
}

async fn run(args: RunArgs, cancel: CancellationToken) -> Result<()> {
    let config = args.load_config()?;

    let actors = Arc::new(ActorStore::new(config.max_actors));
    if let Some(path) = &args.restore {
        let summary = actors
            .restore(path)
            .with_context(|| format!("Failed to restore actors from {}", path.display()))?;
        info!(
            restored = summary.restored,
            skipped = summary.skipped,
            "Restored actors"
        );
    }

    info!(
        directory = %config.directory_url,
        rate = config.rate,
        runtime_secs = config.runtime_secs,
        plan_segments = config.run_plan.len(),
        max_actors = config.max_actors,
        warmup_actors = config.effective_warmup_target(),
        warmup_workers = config.warmup_workers,
        skip_chall_srv = config.challenge.skip,
        "Starting load generator"
    );

    let mut generator = LoadGenerator::from_config(&config, Arc::clone(&actors))
        .context("Failed to create load generator")?;
    let report = generator
        .run_until_cancelled(cancel)
        .await
        .context("Load generator run failed")?;

    report.print();
    if let Some(latency) = generator.latency() {
        latency.print_summary();
        if let Some(path) = &args.results {
            latency
                .dump(path)
                .with_context(|| format!("Failed to write results to {}", path.display()))?;
        }
    }

    if let Some(path) = &args.save {
        actors
            .snapshot(path)
            .with_context(|| format!("Failed to save actors to {}", path.display()))?;
    }
    Ok(())
}

async fn chall_srv(args: ChallSrvArgs, cancel: CancellationToken) -> Result<()> {
    let rpc_addr: SocketAddr = args
        .rpc_addr
        .parse()
        .with_context(|| format!("Invalid RPC address: {}", args.rpc_addr))?;
    let http_one_addr: SocketAddr = args
        .http_one_addr
        .parse()
        .with_context(|| format!("Invalid HTTP-01 address: {}", args.http_one_addr))?;

    challsrv::serve(rpc_addr, http_one_addr, cancel)
        .await
        .context("Challenge server failed")
}

/// Cancel `cancel` on Ctrl+C or SIGTERM.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C"),
            _ = terminate => info!("Received SIGTERM"),
        }

        info!("Stopping, waiting for in-flight actions");
        cancel.cancel();

        // A second signal exits without draining.
        if signal::ctrl_c().await.is_ok() {
            warn!("Received second Ctrl+C, exiting immediately");
            std::process::exit(130);
        }
    });
}
