//! Reporting: capture file analysis, flow aggregation, and delivery.

pub mod analyze;
pub mod cache;
pub mod deliver;

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::report::cache::FlowCache;

/// Consumes completed capture files and merges their records into the
/// aggregation cache.
pub struct Analyzer {
    dump_dir: PathBuf,
    local_addrs: HashSet<String>,
    auto_clear: bool,
    cache: Arc<FlowCache>,
}

impl Analyzer {
    pub fn new(
        dump_dir: PathBuf,
        local_addrs: impl IntoIterator<Item = Ipv4Addr>,
        auto_clear: bool,
        cache: Arc<FlowCache>,
    ) -> Self {
        Self {
            dump_dir,
            local_addrs: local_addrs.into_iter().map(|a| a.to_string()).collect(),
            auto_clear,
            cache,
        }
    }

    /// Runs the analyzer loop until cancellation or queue closure.
    ///
    /// A file that cannot be read is logged and skipped; the pipeline keeps
    /// going. Auto-clear removes the file after processing regardless of
    /// per-line errors.
    pub async fn run(&self, mut files: mpsc::Receiver<String>, cancel: CancellationToken) {
        loop {
            let name = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("analyzer stopping");
                    return;
                }
                name = files.recv() => match name {
                    Some(name) => name,
                    None => {
                        info!("completed-file queue closed, analyzer ending");
                        return;
                    }
                },
            };

            info!(file = %name, "processing capture file");
            let path = self.dump_dir.join(&name);

            match analyze::analyze_file(&path, &self.local_addrs).await {
                Ok(records) => {
                    if !records.is_empty() {
                        self.cache.merge(records).await;
                    }
                }
                Err(e) => {
                    warn!(error = %e, file = %name, "capture file analysis failed");
                }
            }

            if self.auto_clear {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!(error = %e, file = %name, "removing capture file failed");
                }
            }
        }
    }
}
