//! Crash-safe recovery log for records that failed their first write to the
//! storage sink.
//!
//! Per-record life cycle: Pending (in-memory cache) -> Flushed (appended to
//! the log file) -> Reposted (success, dropped) or Requeued (rewritten at the
//! log tail for the next pass). A position file holds the byte offset of the
//! log consumed so far; once the consumed offset passes the configured size
//! limit, log and position are truncated to zero. That cap bounds storage,
//! not correctness: data before the cut is gone.
//!
//! The log file and the position file share one exclusive lock. The flush
//! task and repost passes fully exclude each other; no lock nesting exists
//! anywhere in the subsystem.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::RecoveryConfig;
use crate::record::FlowRecord;

/// Re-post behaviour injected into recovery passes. The center wires this to
/// the storage sink; tests script it.
#[async_trait]
pub trait RecordPoster: Send + Sync {
    async fn post(&self, record: &FlowRecord) -> Result<()>;
}

/// Durable, position-tracked append log.
///
/// Constructed once at startup; components hold an explicit `Arc` handle.
pub struct RecoveryLog {
    log_path: PathBuf,
    pos_path: PathBuf,
    size_limit: u64,
    tx: mpsc::Sender<FlowRecord>,
    /// Single lock covering both the log file and the position file.
    file_lock: Mutex<()>,
}

impl RecoveryLog {
    /// Creates the log and position files and the background flush task
    /// handle. File creation failure is a startup error.
    pub fn open(cfg: &RecoveryConfig) -> Result<(Arc<Self>, FlushTask)> {
        std::fs::create_dir_all(&cfg.dir)
            .with_context(|| format!("creating recovery directory {}", cfg.dir.display()))?;

        let log_path = cfg.dir.join("recovery.log");
        let pos_path = cfg.dir.join("recovery.pos");

        for path in [&log_path, &pos_path] {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("creating recovery file {}", path.display()))?;
        }

        let (tx, rx) = mpsc::channel(cfg.cache_capacity);

        let log = Arc::new(Self {
            log_path,
            pos_path,
            size_limit: cfg.size_limit,
            tx,
            file_lock: Mutex::new(()),
        });

        let flush = FlushTask {
            log: Arc::clone(&log),
            rx,
            cache_capacity: cfg.cache_capacity,
            flush_interval: cfg.flush_interval,
        };

        Ok((log, flush))
    }

    /// Enqueues a record for durable flushing.
    ///
    /// Never fails observably: a full queue blocks the caller (deliberate
    /// backpressure, since loss here is permanent), and a closed queue is
    /// logged as data loss.
    pub async fn add(&self, record: FlowRecord) {
        if self.tx.send(record).await.is_err() {
            error!("recovery queue closed, record lost");
        }
    }

    /// One recovery pass: repost everything unconsumed since the saved
    /// position, requeue failures at the tail, persist the new position.
    /// File I/O failure aborts the pass; the next scheduled pass retries.
    pub async fn repost(&self, poster: &dyn RecordPoster) {
        let _guard = self.file_lock.lock().await;
        if let Err(e) = self.repost_locked(poster).await {
            error!(error = %e, "recovery pass aborted");
        }
    }

    /// Runs recovery passes on a fixed interval until cancellation.
    pub async fn run_repost_timer(
        self: Arc<Self>,
        poster: Arc<dyn RecordPoster>,
        interval: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("recovery repost timer stopping");
                    return;
                }
                _ = ticker.tick() => {
                    self.repost(poster.as_ref()).await;
                }
            }
        }
    }

    async fn repost_locked(&self, poster: &dyn RecordPoster) -> Result<()> {
        let mut pos = self.read_position().await;

        let mut file = File::open(&self.log_path)
            .await
            .with_context(|| format!("opening recovery log {}", self.log_path.display()))?;
        file.seek(SeekFrom::Start(pos))
            .await
            .context("seeking recovery log")?;

        let mut reader = BufReader::new(file);
        let mut line = String::new();
        let mut requeued: Vec<FlowRecord> = Vec::new();
        let mut reposted = 0usize;

        loop {
            line.clear();
            let n = reader
                .read_line(&mut line)
                .await
                .context("scanning recovery log")?;
            if n == 0 {
                break;
            }

            // The offset advances past every scanned line, decodable or not.
            pos += n as u64;

            let trimmed = line.trim_end_matches('\n');
            if trimmed.is_empty() {
                continue;
            }

            let record: FlowRecord = match serde_json::from_str(trimmed) {
                Ok(record) => record,
                Err(e) => {
                    warn!(error = %e, "undecodable recovery line skipped");
                    continue;
                }
            };

            match poster.post(&record).await {
                Ok(()) => reposted += 1,
                Err(e) => {
                    warn!(error = %e, "repost failed, requeueing record");
                    requeued.push(record);
                }
            }
        }

        if pos > self.size_limit {
            info!(
                consumed = pos,
                limit = self.size_limit,
                "recovery log over size limit, truncating",
            );
            File::create(&self.log_path)
                .await
                .context("truncating recovery log")?;
            pos = 0;
        }

        if !requeued.is_empty() {
            append_records(&self.log_path, &requeued)
                .await
                .context("requeueing failed records")?;
        }

        self.write_position(pos)
            .await
            .context("persisting recovery position")?;

        if reposted > 0 || !requeued.is_empty() {
            info!(reposted, requeued = requeued.len(), "recovery pass finished");
        }

        Ok(())
    }

    /// Reads the saved position. Unreadable or unparsable content degrades
    /// to zero with a warning: worst case the pass reprocesses old lines.
    async fn read_position(&self) -> u64 {
        let data = match tokio::fs::read_to_string(&self.pos_path).await {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "reading recovery position failed, assuming start");
                return 0;
            }
        };

        let trimmed = data.trim();
        if trimmed.is_empty() {
            return 0;
        }

        match trimmed.parse() {
            Ok(pos) => pos,
            Err(e) => {
                warn!(error = %e, "unparsable recovery position, assuming start");
                0
            }
        }
    }

    async fn write_position(&self, pos: u64) -> Result<()> {
        tokio::fs::write(&self.pos_path, pos.to_string())
            .await
            .with_context(|| format!("writing {}", self.pos_path.display()))
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn position_path(&self) -> &Path {
        &self.pos_path
    }
}

/// Background task draining the bounded input queue into the in-memory
/// cache and flushing the cache to the log file.
pub struct FlushTask {
    log: Arc<RecoveryLog>,
    rx: mpsc::Receiver<FlowRecord>,
    cache_capacity: usize,
    flush_interval: Duration,
}

impl FlushTask {
    /// Runs until cancellation or queue closure; flushes whatever remains
    /// before returning.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut cache: Vec<FlowRecord> = Vec::with_capacity(self.cache_capacity);
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Drain whatever already reached the queue so shutdown
                    // does not drop pending records.
                    while let Ok(record) = self.rx.try_recv() {
                        cache.push(record);
                    }
                    self.flush(&mut cache).await;
                    info!("recovery flush task stopping");
                    return;
                }
                record = self.rx.recv() => match record {
                    Some(record) => {
                        cache.push(record);
                        if cache.len() > self.cache_capacity {
                            self.flush(&mut cache).await;
                        }
                    }
                    None => {
                        self.flush(&mut cache).await;
                        info!("recovery queue closed, flush task ending");
                        return;
                    }
                },
                _ = ticker.tick() => {
                    self.flush(&mut cache).await;
                }
            }
        }
    }

    /// Appends the cached records to the log under the file lock. On append
    /// failure the cache is kept for the next flush opportunity.
    async fn flush(&self, cache: &mut Vec<FlowRecord>) {
        if cache.is_empty() {
            return;
        }

        let _guard = self.log.file_lock.lock().await;
        match append_records(&self.log.log_path, cache).await {
            Ok(()) => cache.clear(),
            Err(e) => {
                error!(error = %e, pending = cache.len(), "recovery flush failed, retaining cache");
            }
        }
    }
}

/// Appends records as JSON lines. Callers hold the file lock.
async fn append_records(path: &Path, records: &[FlowRecord]) -> Result<()> {
    let mut buf = String::new();
    for record in records {
        match serde_json::to_string(record) {
            Ok(line) => {
                buf.push_str(&line);
                buf.push('\n');
            }
            Err(e) => {
                // Serialization of a plain record cannot realistically fail;
                // skip rather than poison the whole batch.
                warn!(error = %e, "unserializable record skipped");
            }
        }
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("opening {}", path.display()))?;
    file.write_all(buf.as_bytes())
        .await
        .with_context(|| format!("appending to {}", path.display()))?;
    file.flush().await.context("flushing recovery log")?;

    Ok(())
}
