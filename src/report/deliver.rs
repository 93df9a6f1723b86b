//! Streamed delivery of aggregated records to the center.
//!
//! One persistent stream per connection attempt. Retry is purely
//! cache-residency based: a record that fails to send simply stays resident
//! and rides the next drain cycle. The outer loop re-dials with doubling
//! backoff up to a configured attempt budget.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::BackoffConfig;
use crate::record::FlowRecord;
use crate::report::cache::{FlowCache, RecordSender};
use crate::wire::{self, DeliveryReply, FlowUpdate, WireError};

/// Dials the center and yields a record stream. The seam exists so tests can
/// script connection outcomes.
pub trait Connector: Send + Sync {
    type Stream: RecordStream;

    fn connect(&self) -> impl Future<Output = Result<Self::Stream>> + Send;
}

/// One established delivery stream.
pub trait RecordStream: Send {
    /// Sends a single record. An error means the transport is suspect; the
    /// record stays cache-resident either way.
    fn send(&mut self, update: FlowUpdate) -> impl Future<Output = Result<(), WireError>> + Send;

    /// Half-closes the stream and waits for the center's single reply.
    fn close(self) -> impl Future<Output = Result<Option<DeliveryReply>>> + Send;
}

/// TCP connector speaking the framed wire protocol.
pub struct TcpConnector {
    addr: String,
}

impl TcpConnector {
    pub fn new(addr: String) -> Self {
        Self { addr }
    }
}

impl Connector for TcpConnector {
    type Stream = TcpRecordStream;

    async fn connect(&self) -> Result<TcpRecordStream> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .with_context(|| format!("connecting to center at {}", self.addr))?;
        Ok(TcpRecordStream { stream })
    }
}

/// Framed record stream over TCP.
pub struct TcpRecordStream {
    stream: TcpStream,
}

impl RecordStream for TcpRecordStream {
    async fn send(&mut self, update: FlowUpdate) -> Result<(), WireError> {
        wire::write_frame(&mut self.stream, &update).await
    }

    async fn close(mut self) -> Result<Option<DeliveryReply>> {
        self.stream
            .shutdown()
            .await
            .context("closing delivery stream")?;
        let reply = wire::read_frame(&mut self.stream)
            .await
            .context("reading delivery reply")?;
        Ok(reply)
    }
}

/// Why a delivery session ended.
enum SessionEnd {
    Cancelled,
    TransportFailed,
}

/// Streams the aggregation cache to the center on a fixed interval.
pub struct DeliveryClient<C: Connector> {
    connector: C,
    cache: Arc<FlowCache>,
    interval: Duration,
    /// 0 = retry forever at `backoff.fixed_delay`.
    max_attempts: u32,
    backoff: BackoffConfig,
}

impl<C: Connector> DeliveryClient<C> {
    pub fn new(
        connector: C,
        cache: Arc<FlowCache>,
        interval: Duration,
        max_attempts: u32,
        backoff: BackoffConfig,
    ) -> Self {
        Self {
            connector,
            cache,
            interval,
            max_attempts,
            backoff,
        }
    }

    /// Runs the delivery loop until cancellation.
    ///
    /// Returns an error only when a nonzero attempt budget is exhausted;
    /// the probe process treats that as fatal and relies on external
    /// supervision to restart it.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut consecutive_failures = 0u32;
        let mut delay = self.backoff.base_delay;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            match self.connector.connect().await {
                Ok(stream) => {
                    info!("delivery stream established");
                    consecutive_failures = 0;
                    delay = self.backoff.base_delay;

                    match self.session(stream, &cancel).await {
                        SessionEnd::Cancelled => return Ok(()),
                        SessionEnd::TransportFailed => {
                            warn!("delivery stream failed, re-dialing");
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "center connection failed");
                }
            }

            consecutive_failures += 1;

            if self.max_attempts == 0 {
                warn!(
                    delay = ?self.backoff.fixed_delay,
                    "retrying center connection",
                );
                if wait_or_cancelled(self.backoff.fixed_delay, &cancel).await {
                    return Ok(());
                }
                continue;
            }

            if consecutive_failures >= self.max_attempts {
                bail!(
                    "giving up on center after {} connection attempts",
                    consecutive_failures,
                );
            }

            warn!(
                attempt = consecutive_failures,
                budget = self.max_attempts,
                delay = ?delay,
                "retrying center connection",
            );
            if wait_or_cancelled(delay, &cancel).await {
                return Ok(());
            }
            delay = (delay * 2).min(self.backoff.max_delay);
        }
    }

    /// Drains the cache through one established stream on a fixed interval.
    /// Any failed send during a drain marks the transport suspect and ends
    /// the session; the affected entries stay resident.
    async fn session(&self, mut stream: C::Stream, cancel: &CancellationToken) -> SessionEnd {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    match stream.close().await {
                        Ok(Some(reply)) => {
                            info!(success = reply.success, detail = %reply.detail, "delivery stream closed");
                        }
                        Ok(None) => info!("delivery stream closed without reply"),
                        Err(e) => warn!(error = %e, "closing delivery stream failed"),
                    }
                    return SessionEnd::Cancelled;
                }
                _ = ticker.tick() => {
                    let outcome = self.cache.drain(&mut StreamSender(&mut stream)).await;

                    if outcome.delivered > 0 {
                        info!(delivered = outcome.delivered, "records delivered");
                    }
                    if outcome.retained > 0 {
                        return SessionEnd::TransportFailed;
                    }
                }
            }
        }
    }
}

/// Bridges one drain pass onto an established stream.
struct StreamSender<'a, S: RecordStream>(&'a mut S);

impl<S: RecordStream> RecordSender for StreamSender<'_, S> {
    type Error = WireError;

    async fn send_record(&mut self, record: FlowRecord) -> Result<(), WireError> {
        self.0.send(to_update(record)).await
    }
}

fn to_update(record: FlowRecord) -> FlowUpdate {
    FlowUpdate {
        timestamp: record.timestamp.max(0) as u64,
        src_ip: record.src_ip,
        dst_ip: record.dst_ip,
        size: record.size,
        probe_ip: record.probe_ip,
    }
}

/// Sleeps unless cancelled first; true means cancelled.
async fn wait_or_cancelled(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    /// Connector that always refuses, counting attempts.
    struct RefusingConnector {
        attempts: Arc<AtomicU32>,
    }

    impl Connector for RefusingConnector {
        type Stream = NullStream;

        async fn connect(&self) -> Result<NullStream> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            bail!("connection refused")
        }
    }

    struct NullStream;

    impl RecordStream for NullStream {
        async fn send(&mut self, _update: FlowUpdate) -> Result<(), WireError> {
            Ok(())
        }

        async fn close(self) -> Result<Option<DeliveryReply>> {
            Ok(None)
        }
    }

    fn fast_backoff() -> BackoffConfig {
        BackoffConfig {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(80),
            fixed_delay: Duration::from_millis(10),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausting_attempt_budget_is_fatal() {
        let attempts = Arc::new(AtomicU32::new(0));
        let client = DeliveryClient::new(
            RefusingConnector {
                attempts: Arc::clone(&attempts),
            },
            Arc::new(FlowCache::new()),
            Duration::from_secs(1),
            3,
            fast_backoff(),
        );

        let result = client.run(CancellationToken::new()).await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_budget_retries_indefinitely() {
        let attempts = Arc::new(AtomicU32::new(0));
        let client = DeliveryClient::new(
            RefusingConnector {
                attempts: Arc::clone(&attempts),
            },
            Arc::new(FlowCache::new()),
            Duration::from_secs(1),
            0,
            fast_backoff(),
        );

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { client.run(cancel).await }
        });

        // Paused time auto-advances through the fixed delays; wait until the
        // loop has dialed well past any plausible budget.
        while attempts.load(Ordering::SeqCst) < 10 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        cancel.cancel();
        let result = task.await.expect("join");
        assert!(result.is_ok());
        assert!(attempts.load(Ordering::SeqCst) >= 10);
    }

    /// Connector whose streams fail sends after a scripted count.
    struct FlakyConnector {
        connects: Arc<AtomicU32>,
        fail_sends: bool,
    }

    struct FlakyStream {
        fail_sends: bool,
    }

    impl Connector for FlakyConnector {
        type Stream = FlakyStream;

        async fn connect(&self) -> Result<FlakyStream> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(FlakyStream {
                fail_sends: self.fail_sends,
            })
        }
    }

    impl RecordStream for FlakyStream {
        async fn send(&mut self, _update: FlowUpdate) -> Result<(), WireError> {
            if self.fail_sends {
                Err(WireError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "broken pipe",
                )))
            } else {
                Ok(())
            }
        }

        async fn close(self) -> Result<Option<DeliveryReply>> {
            Ok(None)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_sends_keep_records_resident_and_redial() {
        let cache = Arc::new(FlowCache::new());
        cache
            .merge([FlowRecord {
                timestamp: 1,
                probe_ip: "10.0.0.1".to_string(),
                src_ip: "10.0.0.1".to_string(),
                dst_ip: "10.0.0.2".to_string(),
                size: 800,
            }])
            .await;

        let connects = Arc::new(AtomicU32::new(0));
        let client = DeliveryClient::new(
            FlakyConnector {
                connects: Arc::clone(&connects),
                fail_sends: true,
            },
            Arc::clone(&cache),
            Duration::from_millis(10),
            0,
            fast_backoff(),
        );

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { client.run(cancel).await }
        });

        while connects.load(Ordering::SeqCst) < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        cancel.cancel();
        task.await.expect("join").expect("run ok");

        // The record survived every failed session.
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_drain_evicts_records() {
        let cache = Arc::new(FlowCache::new());
        cache
            .merge([FlowRecord {
                timestamp: 1,
                probe_ip: "10.0.0.1".to_string(),
                src_ip: "10.0.0.1".to_string(),
                dst_ip: "10.0.0.2".to_string(),
                size: 800,
            }])
            .await;

        let connects = Arc::new(AtomicU32::new(0));
        let client = DeliveryClient::new(
            FlakyConnector {
                connects: Arc::clone(&connects),
                fail_sends: false,
            },
            Arc::clone(&cache),
            Duration::from_millis(10),
            3,
            fast_backoff(),
        );

        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { client.run(cancel).await }
        });

        while cache.len().await > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        cancel.cancel();
        task.await.expect("join").expect("run ok");
    }
}
