//! Distributed network-traffic telemetry pipeline.
//!
//! Probes capture packets on monitored hosts, rotate them through capture
//! files, aggregate the analyzed flows, and stream the aggregates to a
//! central collector. The collector forwards records to a pluggable storage
//! sink, with a crash-safe recovery log absorbing sink outages.

pub mod capture;
pub mod center;
pub mod config;
pub mod health;
pub mod probe;
pub mod record;
pub mod recovery;
pub mod report;
pub mod wire;
