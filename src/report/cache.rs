//! In-memory flow aggregation cache.
//!
//! The single shared mutable resource on the reporting side. The lock is an
//! implementation detail: callers only see atomic merge and drain
//! operations, never the mutex itself.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::warn;

use crate::record::FlowRecord;

/// One delivery attempt per record, driven by [`FlowCache::drain`].
pub trait RecordSender {
    type Error: Display;

    fn send_record(
        &mut self,
        record: FlowRecord,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Exclusive-lock-protected mapping from aggregation key to flow record.
#[derive(Default)]
pub struct FlowCache {
    entries: Mutex<HashMap<String, FlowRecord>>,
}

/// Result of one drain pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainOutcome {
    pub delivered: usize,
    pub retained: usize,
}

impl FlowCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges records into the cache. An existing entry accumulates byte
    /// size and keeps its timestamp (first-seen time of the current window);
    /// a new entry is stamped with the current time.
    pub async fn merge(&self, records: impl IntoIterator<Item = FlowRecord>) {
        let now = Utc::now().timestamp();
        let mut entries = self.entries.lock().await;

        for mut record in records {
            let key = record.aggregation_key();
            match entries.get_mut(&key) {
                Some(resident) => {
                    resident.size += record.size;
                }
                None => {
                    record.timestamp = now;
                    entries.insert(key, record);
                }
            }
        }
    }

    /// Attempts delivery of every resident entry under the lock.
    ///
    /// Entries whose send succeeds are removed in place; failures stay for
    /// the next drain cycle. Iteration order is unspecified.
    pub async fn drain<S: RecordSender>(&self, sender: &mut S) -> DrainOutcome {
        let mut entries = self.entries.lock().await;
        let keys: Vec<String> = entries.keys().cloned().collect();

        let mut outcome = DrainOutcome {
            delivered: 0,
            retained: 0,
        };

        for key in keys {
            let Some(record) = entries.get(&key) else {
                continue;
            };

            match sender.send_record(record.clone()).await {
                Ok(()) => {
                    entries.remove(&key);
                    outcome.delivered += 1;
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "record delivery failed, retained");
                    outcome.retained += 1;
                }
            }
        }

        outcome
    }

    /// Number of resident entries.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Snapshot of resident entries, for inspection in tests and logs.
    pub async fn snapshot(&self) -> Vec<FlowRecord> {
        self.entries.lock().await.values().cloned().collect()
    }
}
