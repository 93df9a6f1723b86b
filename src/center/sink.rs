//! Storage sink seam.
//!
//! Driver implementations (time-series databases, document stores) live
//! outside this crate; the center only depends on this capability.

use anyhow::Result;
use async_trait::async_trait;

use crate::record::FlowRecord;

/// The injected storage backend.
#[async_trait]
pub trait StorageSink: Send + Sync {
    /// Establishes the backend connection. Failure at startup is fatal.
    async fn connect(&self) -> Result<()>;

    /// Releases the backend connection.
    async fn close(&self) -> Result<()>;

    /// Writes one record. A failed write is handed to the recovery log.
    async fn write(&self, record: &FlowRecord) -> Result<()>;

    /// Writes a batch of records.
    async fn write_batch(&self, records: &[FlowRecord]) -> Result<()>;
}
