//! Packet capture: raw frame filtering and capture file rotation.

pub mod decode;
pub mod replay;
pub mod rotate;

use std::collections::HashSet;
use std::net::Ipv4Addr;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::record::RawFlowSample;

use decode::decode_frame;

/// Injected capture handle. The real implementation wraps whatever packet
/// feed the deployment provides (AF_PACKET ring, pcap, a replay file); the
/// pipeline only requires a blocking frame reader.
pub trait PacketSource: Send {
    /// Blocking read of the next raw frame. `Ok(None)` means the source is
    /// exhausted and the filter loop should end.
    fn next_packet(&mut self) -> std::io::Result<Option<Vec<u8>>>;
}

/// Filters raw frames down to flow samples worth recording.
pub struct PacketFilter {
    local_addrs: HashSet<Ipv4Addr>,
    center_addrs: HashSet<Ipv4Addr>,
}

impl PacketFilter {
    pub fn new(
        local_addrs: impl IntoIterator<Item = Ipv4Addr>,
        center_addrs: impl IntoIterator<Item = Ipv4Addr>,
    ) -> Self {
        Self {
            local_addrs: local_addrs.into_iter().collect(),
            center_addrs: center_addrs.into_iter().collect(),
        }
    }

    /// Classifies one raw frame. `None` means the frame is not ours to record:
    /// neither endpoint is local, both are local, or the flow touches the
    /// center's control channel.
    pub fn classify(&self, frame: &[u8]) -> Option<RawFlowSample> {
        let summary = match decode_frame(frame) {
            Ok(summary) => summary,
            Err(e) => {
                debug!(error = %e, "undecodable frame skipped");
                return None;
            }
        };

        let src_local = self.local_addrs.contains(&summary.src);
        let dst_local = self.local_addrs.contains(&summary.dst);
        if src_local == dst_local {
            return None;
        }

        if self.center_addrs.contains(&summary.src) || self.center_addrs.contains(&summary.dst) {
            return None;
        }

        Some(RawFlowSample {
            src: summary.src,
            dst: summary.dst,
            size: summary.length,
        })
    }

    /// Runs the capture loop until the source is exhausted or cancellation
    /// is observed. Blocking; runs on its own dedicated task.
    ///
    /// Read errors are logged and the loop continues: capture is best-effort
    /// and never fatal. The only suspension points are the source read and
    /// the bounded queue send.
    pub fn run<S: PacketSource>(
        &self,
        mut source: S,
        tx: mpsc::Sender<RawFlowSample>,
        cancel: CancellationToken,
    ) {
        info!(
            local = self.local_addrs.len(),
            center = self.center_addrs.len(),
            "packet filter started",
        );

        loop {
            if cancel.is_cancelled() {
                info!("packet filter stopping");
                return;
            }

            let frame = match source.next_packet() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    info!("packet source exhausted, filter ending");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "packet read failed");
                    continue;
                }
            };

            if let Some(sample) = self.classify(&frame) {
                if tx.blocking_send(sample).is_err() {
                    warn!("sample queue closed, filter ending");
                    return;
                }
            }
        }
    }
}
