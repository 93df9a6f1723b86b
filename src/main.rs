use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use flowtap::capture::replay::ReplaySource;
use flowtap::center::sink::StorageSink;
use flowtap::center::Center;
use flowtap::config::{CenterConfig, ProbeConfig};
use flowtap::health::Liveness;
use flowtap::probe::Probe;
use flowtap::record::FlowRecord;

/// Network flow telemetry: capture probes and the central collector.
#[derive(Parser)]
#[command(name = "flowtap", about)]
struct Cli {
    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a capture probe.
    Probe {
        /// Path to the YAML configuration file.
        #[arg(short, long)]
        config: PathBuf,

        /// Frame feed to capture from: a file of length-prefixed raw
        /// Ethernet frames.
        #[arg(long)]
        replay: PathBuf,
    },
    /// Run the central collector.
    Center {
        /// Path to the YAML configuration file.
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Print version information and exit.
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::Version = &cli.command {
        println!("flowtap {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    fmt().with_env_filter(filter).with_target(true).init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cli.command))
}

async fn run(command: Command) -> Result<()> {
    let cancel = CancellationToken::new();
    let liveness = Liveness::new();
    spawn_signal_handler(cancel.clone(), liveness.clone());

    match command {
        Command::Probe { config, replay } => {
            let cfg = ProbeConfig::load(&config)?;
            tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting probe");

            let source = ReplaySource::open(&replay)
                .with_context(|| format!("opening frame feed {}", replay.display()))?;
            Probe::new(cfg).run(source, cancel).await?;
        }
        Command::Center { config } => {
            let cfg = CenterConfig::load(&config)?;
            tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting center");

            let storage: Arc<dyn StorageSink> = Arc::new(LogSink);
            Center::new(cfg).run(storage, liveness, cancel).await?;
        }
        Command::Version => unreachable!("handled before runtime startup"),
    }

    tracing::info!("flowtap stopped");
    Ok(())
}

/// Flips liveness unhealthy, then cancels, on SIGINT or SIGTERM.
fn spawn_signal_handler(cancel: CancellationToken, liveness: Liveness) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::error!(error = %e, "registering SIGTERM handler failed");
                return;
            }
        };

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        liveness.set_live(false);
        cancel.cancel();
    });
}

/// Default sink: logs each record. Real deployments wire a database-backed
/// `StorageSink` in its place.
struct LogSink;

#[async_trait::async_trait]
impl StorageSink for LogSink {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn write(&self, record: &FlowRecord) -> Result<()> {
        tracing::info!(
            probe = %record.probe_ip,
            src = %record.src_ip,
            dst = %record.dst_ip,
            size = record.size,
            timestamp = record.timestamp,
            "flow record",
        );
        Ok(())
    }

    async fn write_batch(&self, records: &[FlowRecord]) -> Result<()> {
        for record in records {
            self.write(record).await?;
        }
        Ok(())
    }
}
