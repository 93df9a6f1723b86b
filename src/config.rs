use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Configuration for the capture probe process.
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    /// Interface name used in capture file names (e.g. "eth0").
    pub interface: String,

    /// Addresses owned by this host. A packet is kept only if exactly one
    /// of its endpoints is in this set.
    pub local_addrs: Vec<Ipv4Addr>,

    /// Resolved addresses of the center. Traffic touching any of these is
    /// dropped so the probe never monitors its own control channel.
    #[serde(default)]
    pub center_addrs: Vec<Ipv4Addr>,

    /// Center endpoint to stream aggregated records to (host:port).
    pub center_addr: String,

    /// Directory holding in-flight capture files.
    pub dump_dir: PathBuf,

    /// Delete capture files once analyzed. Default: false.
    #[serde(default)]
    pub auto_clear: bool,

    /// Capture file rotation cadence. Default: 1s.
    #[serde(default = "default_rotate_interval", with = "humantime_serde")]
    pub rotate_interval: Duration,

    /// Cadence of cache drains toward the center. Default: 1s.
    #[serde(default = "default_report_interval", with = "humantime_serde")]
    pub report_interval: Duration,

    /// Connection retry budget. 0 retries forever at a fixed short delay;
    /// exhausting a nonzero budget is fatal to the probe process.
    #[serde(default)]
    pub max_attempts: u32,

    /// Delivery retry backoff tuning.
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Capacity of the raw-sample queue between filter and rotator.
    #[serde(default = "default_queue_capacity")]
    pub sample_queue_capacity: usize,

    /// Capacity of the completed-file queue between rotator and analyzer.
    #[serde(default = "default_queue_capacity")]
    pub file_queue_capacity: usize,
}

/// Backoff policy for re-dialing the center.
#[derive(Debug, Clone, Deserialize)]
pub struct BackoffConfig {
    /// First retry delay. Doubles on each consecutive failure. Default: 2s.
    #[serde(default = "default_backoff_base", with = "humantime_serde")]
    pub base_delay: Duration,

    /// Upper bound on the doubling delay. Default: 5m.
    #[serde(default = "default_backoff_max", with = "humantime_serde")]
    pub max_delay: Duration,

    /// Delay between attempts when the retry budget is unlimited. Default: 2s.
    #[serde(default = "default_backoff_base", with = "humantime_serde")]
    pub fixed_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: default_backoff_base(),
            max_delay: default_backoff_max(),
            fixed_delay: default_backoff_base(),
        }
    }
}

/// Configuration for the center (collector) process.
#[derive(Debug, Clone, Deserialize)]
pub struct CenterConfig {
    /// Address the ingest listener binds to (e.g. "0.0.0.0:4040").
    pub listen_addr: String,

    /// Address the liveness endpoint binds to (e.g. "0.0.0.0:8080").
    pub health_addr: String,

    /// The center's own addresses. Records touching any of these are
    /// discarded to prevent monitoring loops.
    #[serde(default)]
    pub local_addrs: Vec<Ipv4Addr>,

    /// Recovery log settings.
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

/// Recovery log settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RecoveryConfig {
    /// Directory holding the log and position files.
    #[serde(default = "default_recovery_dir")]
    pub dir: PathBuf,

    /// Consumed-offset bound; exceeding it truncates log and position to
    /// zero. Default: 10 MiB.
    #[serde(default = "default_recovery_size_limit")]
    pub size_limit: u64,

    /// In-memory cache capacity; exceeding it forces a flush to the log
    /// file. Also sizes the bounded input queue. Default: 128.
    #[serde(default = "default_recovery_cache_capacity")]
    pub cache_capacity: usize,

    /// Timer-driven flush cadence. Default: 10s.
    #[serde(default = "default_recovery_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Cadence of recovery passes over the log. Default: 60s.
    #[serde(default = "default_recovery_repost_interval", with = "humantime_serde")]
    pub repost_interval: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            dir: default_recovery_dir(),
            size_limit: default_recovery_size_limit(),
            cache_capacity: default_recovery_cache_capacity(),
            flush_interval: default_recovery_flush_interval(),
            repost_interval: default_recovery_repost_interval(),
        }
    }
}

impl ProbeConfig {
    /// Loads and validates a probe configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: ProbeConfig = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validates field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.interface.is_empty() {
            bail!("interface must not be empty");
        }
        if self.local_addrs.is_empty() {
            bail!("local_addrs must list at least one address");
        }
        if self.center_addr.is_empty() {
            bail!("center_addr must not be empty");
        }
        if self.rotate_interval.is_zero() {
            bail!("rotate_interval must be positive");
        }
        if self.report_interval.is_zero() {
            bail!("report_interval must be positive");
        }
        if self.sample_queue_capacity == 0 || self.file_queue_capacity == 0 {
            bail!("queue capacities must be positive");
        }
        Ok(())
    }
}

impl CenterConfig {
    /// Loads and validates a center configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: CenterConfig = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validates field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            bail!("listen_addr must not be empty");
        }
        if self.health_addr.is_empty() {
            bail!("health_addr must not be empty");
        }
        if self.recovery.cache_capacity == 0 {
            bail!("recovery.cache_capacity must be positive");
        }
        if self.recovery.size_limit == 0 {
            bail!("recovery.size_limit must be positive");
        }
        Ok(())
    }
}

fn default_rotate_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_report_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_backoff_base() -> Duration {
    Duration::from_secs(2)
}

fn default_backoff_max() -> Duration {
    Duration::from_secs(300)
}

fn default_queue_capacity() -> usize {
    256
}

fn default_recovery_dir() -> PathBuf {
    PathBuf::from("./recovery")
}

fn default_recovery_size_limit() -> u64 {
    10 * (1 << 20)
}

fn default_recovery_cache_capacity() -> usize {
    128
}

fn default_recovery_flush_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_recovery_repost_interval() -> Duration {
    Duration::from_secs(60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_config_defaults() {
        let yaml = r#"
interface: eth0
local_addrs: ["10.0.0.1"]
center_addr: "center:4040"
dump_dir: /tmp/flowtap
"#;
        let cfg: ProbeConfig = serde_yaml::from_str(yaml).expect("parses");
        cfg.validate().expect("valid");

        assert_eq!(cfg.rotate_interval, Duration::from_secs(1));
        assert_eq!(cfg.max_attempts, 0);
        assert!(!cfg.auto_clear);
        assert_eq!(cfg.sample_queue_capacity, 256);
        assert_eq!(cfg.backoff.base_delay, Duration::from_secs(2));
    }

    #[test]
    fn test_probe_config_rejects_empty_local_addrs() {
        let yaml = r#"
interface: eth0
local_addrs: []
center_addr: "center:4040"
dump_dir: /tmp/flowtap
"#;
        let cfg: ProbeConfig = serde_yaml::from_str(yaml).expect("parses");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_center_config_defaults() {
        let yaml = r#"
listen_addr: "0.0.0.0:4040"
health_addr: "0.0.0.0:8080"
local_addrs: ["192.168.1.5"]
"#;
        let cfg: CenterConfig = serde_yaml::from_str(yaml).expect("parses");
        cfg.validate().expect("valid");

        assert_eq!(cfg.recovery.size_limit, 10 * (1 << 20));
        assert_eq!(cfg.recovery.cache_capacity, 128);
        assert_eq!(cfg.recovery.repost_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_recovery_overrides() {
        let yaml = r#"
listen_addr: "0.0.0.0:4040"
health_addr: "0.0.0.0:8080"
recovery:
  dir: /var/lib/flowtap
  size_limit: 1024
  cache_capacity: 8
  flush_interval: 2s
  repost_interval: 30s
"#;
        let cfg: CenterConfig = serde_yaml::from_str(yaml).expect("parses");
        assert_eq!(cfg.recovery.size_limit, 1024);
        assert_eq!(cfg.recovery.cache_capacity, 8);
        assert_eq!(cfg.recovery.flush_interval, Duration::from_secs(2));
    }
}
