//! Flow record types shared by the probe and the center.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// One observed packet, reduced to the fields the pipeline cares about.
///
/// Ephemeral: produced by the packet filter and serialized into the current
/// capture file as soon as the rotator receives it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFlowSample {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub size: u64,
}

impl RawFlowSample {
    /// Textual form written to capture files: `<src> <dst> <size>`.
    pub fn to_line(&self) -> String {
        format!("{} {} {}", self.src, self.dst, self.size)
    }
}

/// An aggregated directional flow record.
///
/// Mutable while resident in the aggregation cache (size accumulates),
/// immutable once handed to delivery or the recovery log. The serde field
/// names define the recovery log's on-disk line format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRecord {
    /// Unix seconds at which the record entered its aggregation window.
    pub timestamp: i64,
    /// Local address of the probe that observed the flow.
    #[serde(rename = "probeIP")]
    pub probe_ip: String,
    #[serde(rename = "srcIP")]
    pub src_ip: String,
    #[serde(rename = "dstIP")]
    pub dst_ip: String,
    /// Accumulated byte size over the window.
    pub size: u64,
}

impl FlowRecord {
    /// Aggregation key: `<src>_<dst>`. Not unique across time; a later
    /// window for the same pair starts fresh after a drain.
    pub fn aggregation_key(&self) -> String {
        format!("{}_{}", self.src_ip, self.dst_ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_line_format() {
        let sample = RawFlowSample {
            src: Ipv4Addr::new(10, 0, 0, 1),
            dst: Ipv4Addr::new(10, 0, 0, 2),
            size: 500,
        };
        assert_eq!(sample.to_line(), "10.0.0.1 10.0.0.2 500");
    }

    #[test]
    fn test_record_json_field_names() {
        let record = FlowRecord {
            timestamp: 1_700_000_000,
            probe_ip: "10.0.0.1".to_string(),
            src_ip: "10.0.0.1".to_string(),
            dst_ip: "10.0.0.2".to_string(),
            size: 800,
        };

        let json = serde_json::to_string(&record).expect("serializes");
        assert!(json.contains("\"probeIP\":\"10.0.0.1\""));
        assert!(json.contains("\"srcIP\":\"10.0.0.1\""));
        assert!(json.contains("\"dstIP\":\"10.0.0.2\""));
        assert!(json.contains("\"timestamp\":1700000000"));
        assert!(json.contains("\"size\":800"));
    }

    #[test]
    fn test_aggregation_key() {
        let record = FlowRecord {
            timestamp: 0,
            probe_ip: "10.0.0.1".to_string(),
            src_ip: "10.0.0.1".to_string(),
            dst_ip: "10.0.0.2".to_string(),
            size: 1,
        };
        assert_eq!(record.aggregation_key(), "10.0.0.1_10.0.0.2");
    }
}
