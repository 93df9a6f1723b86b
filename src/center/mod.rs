//! Center ingest: receives record streams from probes and forwards them to
//! the storage sink, with the recovery log backing failed writes.

pub mod sink;

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::CenterConfig;
use crate::health::{HealthServer, Liveness};
use crate::record::FlowRecord;
use crate::recovery::{RecordPoster, RecoveryLog};
use crate::wire::{self, DeliveryReply, FlowUpdate};

use sink::StorageSink;

/// Adapts the storage sink to the recovery log's poster seam.
pub struct SinkPoster {
    sink: Arc<dyn StorageSink>,
}

impl SinkPoster {
    pub fn new(sink: Arc<dyn StorageSink>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl RecordPoster for SinkPoster {
    async fn post(&self, record: &FlowRecord) -> Result<()> {
        self.sink.write(record).await
    }
}

/// Stream handler state shared by all probe connections.
pub struct IngestServer {
    local_addrs: HashSet<String>,
    sink: Arc<dyn StorageSink>,
    recovery: Arc<RecoveryLog>,
}

impl IngestServer {
    pub fn new(
        local_addrs: impl IntoIterator<Item = Ipv4Addr>,
        sink: Arc<dyn StorageSink>,
        recovery: Arc<RecoveryLog>,
    ) -> Self {
        Self {
            local_addrs: local_addrs.into_iter().map(|a| a.to_string()).collect(),
            sink,
            recovery,
        }
    }

    /// Accept loop over an already-bound listener. Per-connection handlers
    /// run as independent tasks; a handler failure never ends the server.
    pub async fn run(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("ingest server stopping");
                    return;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(peer = %peer, "probe connected");
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = server.handle_stream(stream).await {
                                    warn!(peer = %peer, error = %e, "probe stream ended with error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "accepting probe connection failed");
                        }
                    }
                }
            }
        }
    }

    /// Reads records until the probe closes its write half, then replies
    /// once. Transport or decode errors propagate and end the stream
    /// without a reply.
    async fn handle_stream(&self, mut stream: TcpStream) -> Result<()> {
        loop {
            let update: Option<FlowUpdate> = wire::read_frame(&mut stream)
                .await
                .context("reading record frame")?;

            let Some(update) = update else {
                let reply = DeliveryReply {
                    success: true,
                    detail: "connection close".to_string(),
                };
                wire::write_frame(&mut stream, &reply)
                    .await
                    .context("writing delivery reply")?;
                return Ok(());
            };

            // Probe/center control traffic must not observe itself.
            if self.local_addrs.contains(&update.src_ip)
                || self.local_addrs.contains(&update.dst_ip)
            {
                continue;
            }

            let record = to_record(update);
            if let Err(e) = self.sink.write(&record).await {
                warn!(error = %e, "sink write failed, record sent to recovery");
                self.recovery.add(record).await;
            }
        }
    }
}

fn to_record(update: FlowUpdate) -> FlowRecord {
    FlowRecord {
        timestamp: i64::try_from(update.timestamp).unwrap_or(i64::MAX),
        probe_ip: update.probe_ip,
        src_ip: update.src_ip,
        dst_ip: update.dst_ip,
        size: update.size,
    }
}

/// The center process: sink, recovery subsystem, liveness endpoint, and the
/// ingest listener, wired together with explicit handles.
pub struct Center {
    cfg: CenterConfig,
}

impl Center {
    pub fn new(cfg: CenterConfig) -> Self {
        Self { cfg }
    }

    /// Runs the center until cancellation. Bind and sink-connect failures
    /// are fatal at startup.
    pub async fn run(
        self,
        storage: Arc<dyn StorageSink>,
        liveness: Liveness,
        cancel: CancellationToken,
    ) -> Result<()> {
        storage
            .connect()
            .await
            .context("connecting to storage sink")?;

        let (recovery, flush) = RecoveryLog::open(&self.cfg.recovery)?;
        tokio::spawn(flush.run(cancel.clone()));

        let poster: Arc<dyn RecordPoster> = Arc::new(SinkPoster::new(Arc::clone(&storage)));
        tokio::spawn(Arc::clone(&recovery).run_repost_timer(
            poster,
            self.cfg.recovery.repost_interval,
            cancel.clone(),
        ));

        let health = HealthServer::new(self.cfg.health_addr.clone(), liveness);
        health
            .start(cancel.clone())
            .await
            .context("starting health server")?;

        let listener = TcpListener::bind(&self.cfg.listen_addr)
            .await
            .with_context(|| format!("binding ingest listener on {}", self.cfg.listen_addr))?;
        info!(addr = %self.cfg.listen_addr, "center listening for probes");

        let server = Arc::new(IngestServer::new(
            self.cfg.local_addrs.clone(),
            Arc::clone(&storage),
            recovery,
        ));
        server.run(listener, cancel).await;

        if let Err(e) = storage.close().await {
            warn!(error = %e, "closing storage sink failed");
        }

        Ok(())
    }
}
