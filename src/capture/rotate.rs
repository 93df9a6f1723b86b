//! Capture file rotation.
//!
//! One writer task multiplexes between the rotation ticker and the raw
//! sample queue. Rotation hands completed file names to the analyzer over a
//! bounded queue; a slow analyzer backpressures rotation, never capture file
//! writes in progress.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::record::RawFlowSample;

/// Timestamp layout embedded in capture file names.
const FILE_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Builds a capture file name: `<interface>_<YYYYMMDDhhmmss>.cap`.
pub fn capture_file_name(interface: &str, now: chrono::DateTime<Utc>) -> String {
    format!("{}_{}.cap", interface, now.format(FILE_TIMESTAMP_FORMAT))
}

/// The capture file rotator task.
pub struct Rotator {
    interface: String,
    dump_dir: PathBuf,
    interval: Duration,
}

struct OpenFile {
    writer: BufWriter<File>,
    name: String,
}

impl Rotator {
    pub fn new(interface: String, dump_dir: PathBuf, interval: Duration) -> Self {
        Self {
            interface,
            dump_dir,
            interval,
        }
    }

    /// Runs the rotation loop until cancellation.
    ///
    /// Returns an error only if the very first capture file cannot be
    /// created (startup failure); mid-run I/O errors are absorbed. A failed
    /// flush/close loses that window's data but never stalls rotation.
    pub async fn run(
        self,
        mut samples: mpsc::Receiver<RawFlowSample>,
        completed: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let mut current = Some(self.open_file().await.with_context(|| {
            format!(
                "creating initial capture file in {}",
                self.dump_dir.display()
            )
        })?);

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick of a tokio interval fires immediately.
        ticker.tick().await;

        info!(interface = %self.interface, dir = %self.dump_dir.display(), "rotator started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if let Some(file) = current.take() {
                        Self::close_file(file).await;
                    }
                    info!("rotator stopping");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if let Some(file) = current.take() {
                        if let Some(name) = Self::close_file(file).await {
                            // Bounded queue: a slow analyzer blocks rotation
                            // handoff, not capture.
                            if completed.send(name).await.is_err() {
                                warn!("completed-file queue closed, rotator ending");
                                return Ok(());
                            }
                        }
                    }

                    match self.open_file().await {
                        Ok(file) => current = Some(file),
                        Err(e) => {
                            // Samples are dropped until the next rotation
                            // attempt succeeds.
                            error!(error = %e, "opening capture file failed");
                        }
                    }
                }
                sample = samples.recv() => {
                    let Some(sample) = sample else {
                        // Capture ended; the final window still goes to the
                        // analyzer.
                        if let Some(file) = current.take() {
                            if let Some(name) = Self::close_file(file).await {
                                let _ = completed.send(name).await;
                            }
                        }
                        info!("sample queue closed, rotator ending");
                        return Ok(());
                    };

                    if let Some(file) = current.as_mut() {
                        let mut line = sample.to_line();
                        line.push('\n');
                        if let Err(e) = file.writer.write_all(line.as_bytes()).await {
                            warn!(error = %e, file = %file.name, "capture file write failed");
                        }
                    }
                }
            }
        }
    }

    async fn open_file(&self) -> Result<OpenFile> {
        let name = capture_file_name(&self.interface, Utc::now());
        let path = self.dump_dir.join(&name);
        let file = File::create(&path)
            .await
            .with_context(|| format!("creating {}", path.display()))?;

        Ok(OpenFile {
            writer: BufWriter::new(file),
            name,
        })
    }

    /// Flushes and closes a capture file, returning its name for handoff.
    /// `None` means the flush failed and the window's data is abandoned.
    async fn close_file(mut file: OpenFile) -> Option<String> {
        if let Err(e) = file.writer.flush().await {
            error!(error = %e, file = %file.name, "capture file flush failed, window lost");
            return None;
        }
        if let Err(e) = file.writer.shutdown().await {
            error!(error = %e, file = %file.name, "capture file close failed, window lost");
            return None;
        }
        Some(file.name)
    }
}

/// Ensures the dump directory exists; part of probe startup.
pub async fn ensure_dump_dir(dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating dump directory {}", dir.display()))
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use chrono::TimeZone;

    use super::*;

    #[test]
    fn test_capture_file_name_layout() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(capture_file_name("eth0", ts), "eth0_20240101000000.cap");
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_hands_off_completed_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rotator = Rotator::new(
            "eth0".to_string(),
            dir.path().to_path_buf(),
            Duration::from_secs(1),
        );

        let (sample_tx, sample_rx) = mpsc::channel(16);
        let (file_tx, mut file_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(rotator.run(sample_rx, file_tx, cancel.clone()));

        sample_tx
            .send(RawFlowSample {
                src: Ipv4Addr::new(10, 0, 0, 1),
                dst: Ipv4Addr::new(10, 0, 0, 2),
                size: 500,
            })
            .await
            .expect("send");

        let name = file_rx.recv().await.expect("completed file");
        assert!(name.starts_with("eth0_"));
        assert!(name.ends_with(".cap"));

        let content = tokio::fs::read_to_string(dir.path().join(&name))
            .await
            .expect("read capture file");
        assert_eq!(content, "10.0.0.1 10.0.0.2 500\n");

        cancel.cancel();
        task.await.expect("join").expect("rotator ok");
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_window_handed_off_when_capture_ends() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rotator = Rotator::new(
            "eth0".to_string(),
            dir.path().to_path_buf(),
            Duration::from_secs(3600),
        );

        let (sample_tx, sample_rx) = mpsc::channel(16);
        let (file_tx, mut file_rx) = mpsc::channel(16);

        let task = tokio::spawn(rotator.run(sample_rx, file_tx, CancellationToken::new()));

        sample_tx
            .send(RawFlowSample {
                src: Ipv4Addr::new(10, 0, 0, 1),
                dst: Ipv4Addr::new(10, 0, 0, 2),
                size: 42,
            })
            .await
            .expect("send");
        drop(sample_tx);

        let name = file_rx.recv().await.expect("final file");
        let content = tokio::fs::read_to_string(dir.path().join(&name))
            .await
            .expect("read capture file");
        assert_eq!(content, "10.0.0.1 10.0.0.2 42\n");

        task.await.expect("join").expect("rotator ok");
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_windows_still_rotate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rotator = Rotator::new(
            "eth0".to_string(),
            dir.path().to_path_buf(),
            Duration::from_secs(1),
        );

        let (_sample_tx, sample_rx) = mpsc::channel::<RawFlowSample>(1);
        let (file_tx, mut file_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let task = tokio::spawn(rotator.run(sample_rx, file_tx, cancel.clone()));

        // Two idle windows produce two (empty) completed handoffs.
        let first = file_rx.recv().await.expect("first file");
        let second = file_rx.recv().await.expect("second file");
        assert!(first.starts_with("eth0_") && first.ends_with(".cap"));
        assert!(second.starts_with("eth0_") && second.ends_with(".cap"));

        cancel.cancel();
        task.await.expect("join").expect("rotator ok");
    }
}
