//! Capture file analysis.
//!
//! Parses a completed capture file back into flow records. Malformed lines
//! are skipped with a warning; only failure to read the file itself is an
//! error (absorbed by the analyzer loop).

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, warn};

use crate::record::FlowRecord;

/// Parses one capture file into flow records.
///
/// Record timestamps are the analysis time, not the capture time; the
/// precision loss is bounded by the rotation interval.
pub async fn analyze_file(path: &Path, local_addrs: &HashSet<String>) -> Result<Vec<FlowRecord>> {
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading capture file {}", path.display()))?;

    let timestamp = Utc::now().timestamp();
    let mut records = Vec::new();

    for line in data.lines() {
        if line.is_empty() {
            continue;
        }

        let Some(record) = parse_line(line, local_addrs, timestamp) else {
            warn!(file = %path.display(), line, "invalid capture line skipped");
            continue;
        };
        records.push(record);
    }

    debug!(file = %path.display(), records = records.len(), "capture file analyzed");
    Ok(records)
}

/// Parses one `src dst size` line. `None` for malformed lines and for lines
/// where neither endpoint is local (the upstream filter should prevent the
/// latter, but a stale or foreign file must not poison the cache).
fn parse_line(line: &str, local_addrs: &HashSet<String>, timestamp: i64) -> Option<FlowRecord> {
    let mut fields = line.split(' ');
    let src = fields.next()?;
    let dst = fields.next()?;
    let size: u64 = fields.next()?.parse().ok()?;
    if fields.next().is_some() {
        return None;
    }

    let probe_ip = if local_addrs.contains(src) {
        src
    } else if local_addrs.contains(dst) {
        dst
    } else {
        return None;
    };

    Some(FlowRecord {
        timestamp,
        probe_ip: probe_ip.to_string(),
        src_ip: src.to_string(),
        dst_ip: dst.to_string(),
        size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locals() -> HashSet<String> {
        ["10.0.0.1".to_string()].into_iter().collect()
    }

    #[test]
    fn test_parse_valid_line_source_local() {
        let record = parse_line("10.0.0.1 10.0.0.2 500", &locals(), 42).expect("parses");
        assert_eq!(record.probe_ip, "10.0.0.1");
        assert_eq!(record.src_ip, "10.0.0.1");
        assert_eq!(record.dst_ip, "10.0.0.2");
        assert_eq!(record.size, 500);
        assert_eq!(record.timestamp, 42);
    }

    #[test]
    fn test_parse_valid_line_destination_local() {
        let record = parse_line("10.0.0.7 10.0.0.1 300", &locals(), 42).expect("parses");
        assert_eq!(record.probe_ip, "10.0.0.1");
    }

    #[test]
    fn test_parse_drops_line_with_no_local_endpoint() {
        assert!(parse_line("10.0.0.7 10.0.0.8 300", &locals(), 42).is_none());
    }

    #[test]
    fn test_parse_rejects_malformed_lines() {
        assert!(parse_line("10.0.0.1 10.0.0.2", &locals(), 42).is_none());
        assert!(parse_line("10.0.0.1 10.0.0.2 12 extra", &locals(), 42).is_none());
        assert!(parse_line("10.0.0.1 10.0.0.2 notanumber", &locals(), 42).is_none());
        assert!(parse_line("10.0.0.1 10.0.0.2 -5", &locals(), 42).is_none());
    }

    #[tokio::test]
    async fn test_analyze_file_skips_bad_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("eth0_20240101000000.cap");
        tokio::fs::write(
            &path,
            "10.0.0.1 10.0.0.2 500\ngarbage\n10.0.0.1 10.0.0.2 300\n",
        )
        .await
        .expect("write");

        let records = analyze_file(&path, &locals()).await.expect("analyzes");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].size, 500);
        assert_eq!(records[1].size, 300);
    }

    #[tokio::test]
    async fn test_analyze_missing_file_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = analyze_file(&dir.path().join("absent.cap"), &locals()).await;
        assert!(result.is_err());
    }
}
