//! The probe process: capture, rotation, analysis, and delivery wired
//! together over bounded queues.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::capture::rotate::{ensure_dump_dir, Rotator};
use crate::capture::{PacketFilter, PacketSource};
use crate::config::ProbeConfig;
use crate::report::cache::FlowCache;
use crate::report::deliver::{DeliveryClient, TcpConnector};
use crate::report::Analyzer;

pub struct Probe {
    cfg: ProbeConfig,
}

impl Probe {
    pub fn new(cfg: ProbeConfig) -> Self {
        Self { cfg }
    }

    /// Runs the probe pipeline until cancellation.
    ///
    /// Startup failures (dump directory, center resolution, initial capture
    /// file) and an exhausted delivery retry budget are fatal; external
    /// supervision restarts the process. Everything else is absorbed inside
    /// the individual stages.
    pub async fn run<S: PacketSource + 'static>(
        self,
        source: S,
        cancel: CancellationToken,
    ) -> Result<()> {
        ensure_dump_dir(&self.cfg.dump_dir).await?;

        let center_addrs = resolve_center_addrs(&self.cfg).await?;
        info!(
            interface = %self.cfg.interface,
            center = %self.cfg.center_addr,
            "probe starting",
        );

        let (sample_tx, sample_rx) = mpsc::channel(self.cfg.sample_queue_capacity);
        let (file_tx, file_rx) = mpsc::channel(self.cfg.file_queue_capacity);

        let filter = PacketFilter::new(self.cfg.local_addrs.iter().copied(), center_addrs);
        let filter_task = tokio::task::spawn_blocking({
            let cancel = cancel.clone();
            move || filter.run(source, sample_tx, cancel)
        });

        let rotator = Rotator::new(
            self.cfg.interface.clone(),
            self.cfg.dump_dir.clone(),
            self.cfg.rotate_interval,
        );
        let mut rotator_task = tokio::spawn(rotator.run(sample_rx, file_tx, cancel.clone()));

        let cache = Arc::new(FlowCache::new());
        let analyzer = Analyzer::new(
            self.cfg.dump_dir.clone(),
            self.cfg.local_addrs.iter().copied(),
            self.cfg.auto_clear,
            Arc::clone(&cache),
        );
        let analyzer_task = tokio::spawn({
            let cancel = cancel.clone();
            async move { analyzer.run(file_rx, cancel).await }
        });

        let delivery = DeliveryClient::new(
            TcpConnector::new(self.cfg.center_addr.clone()),
            cache,
            self.cfg.report_interval,
            self.cfg.max_attempts,
            self.cfg.backoff.clone(),
        );
        let mut delivery_task = tokio::spawn({
            let cancel = cancel.clone();
            async move { delivery.run(cancel).await }
        });

        // A rotator error (it can only fail at startup) is fatal; a clean
        // rotator end just means capture finished, and delivery keeps
        // draining whatever is still cache-resident until cancellation.
        let mut rotator_running = true;
        let result = loop {
            tokio::select! {
                joined = &mut delivery_task => {
                    break flatten_join("delivery", joined).context("delivery loop failed");
                }
                joined = &mut rotator_task, if rotator_running => {
                    rotator_running = false;
                    match flatten_join("rotator", joined) {
                        Ok(()) => info!("capture ended, delivery draining"),
                        Err(e) => break Err(e),
                    }
                }
            }
        };

        cancel.cancel();

        if !delivery_task.is_finished() {
            if let Err(e) = flatten_join("delivery", delivery_task.await) {
                warn!(error = %e, "delivery ended with error");
            }
        }
        if rotator_running {
            if let Err(e) = flatten_join("rotator", rotator_task.await) {
                warn!(error = %e, "rotator ended with error");
            }
        }
        if let Err(e) = analyzer_task.await {
            warn!(error = %e, "analyzer task panicked");
        }
        if let Err(e) = filter_task.await {
            warn!(error = %e, "packet filter task panicked");
        }

        info!("probe stopped");
        result
    }
}

fn flatten_join(task: &str, joined: Result<Result<()>, tokio::task::JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result.with_context(|| format!("{task} task failed")),
        Err(e) => Err(anyhow::Error::from(e)).with_context(|| format!("{task} task panicked")),
    }
}

/// Resolves the center endpoint and unions it with any statically configured
/// center addresses. The filter drops traffic touching these so the probe
/// never records its own reporting channel.
async fn resolve_center_addrs(cfg: &ProbeConfig) -> Result<HashSet<Ipv4Addr>> {
    let mut addrs: HashSet<Ipv4Addr> = cfg.center_addrs.iter().copied().collect();

    let resolved = tokio::net::lookup_host(&cfg.center_addr)
        .await
        .with_context(|| format!("resolving center endpoint {}", cfg.center_addr))?;
    for addr in resolved {
        if let SocketAddr::V4(v4) = addr {
            addrs.insert(*v4.ip());
        }
    }

    Ok(addrs)
}
