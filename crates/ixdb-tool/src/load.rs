//! Synthetic series generator for the `load` command

use anyhow::Result;
use ixdb_core::{encode_identity, Scope, Tag, Timestamp, MSECS_PER_DAY};
use ixdb_index::IndexDb;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Instant;
use tracing::info;

const METRIC_GROUPS: &[&str] = &[
    "cpu_usage",
    "mem_used_bytes",
    "disk_io_time",
    "net_rx_bytes",
    "net_tx_bytes",
    "http_requests_total",
];
const REGIONS: &[&str] = &["us-east", "us-west", "eu-central", "ap-south"];

/// Shape of a synthetic dataset
#[derive(Debug, Clone)]
pub struct LoadSpec {
    pub scope: Scope,
    /// Distinct hosts; every host carries every metric group
    pub hosts: usize,
    /// Days ending at `end` on which every series gets a sample
    pub days: u64,
    pub end: Timestamp,
    pub seed: u64,
}

/// Registration counts of one load
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub series: u64,
    pub resolves: u64,
}

/// Register the dataset described by `spec`
pub fn load(db: &IndexDb, spec: &LoadSpec) -> Result<LoadReport> {
    let mut rng = StdRng::seed_from_u64(spec.seed);
    let started = Instant::now();
    let created_before = db.stats().series_created;
    let mut report = LoadReport::default();

    let identities: Vec<Vec<u8>> = (0..spec.hosts)
        .flat_map(|host| {
            let region = REGIONS[rng.gen_range(0..REGIONS.len())];
            let instance = format!("10.{}.{}.{}:9100", host / 65536 % 256, host / 256 % 256, host % 256);
            METRIC_GROUPS
                .iter()
                .map(move |group| {
                    let tags = [
                        Tag::new("host", format!("host-{}", host)),
                        Tag::new("instance", instance.as_str()),
                        Tag::new("job", "node"),
                        Tag::new("region", region),
                    ];
                    encode_identity(spec.scope, group.as_bytes(), &tags)
                })
                .collect::<Vec<_>>()
        })
        .collect::<std::result::Result<_, _>>()?;

    for day in (0..spec.days).rev() {
        let ts = spec.end - day as i64 * MSECS_PER_DAY;
        for encoded in &identities {
            db.get_or_create_tsid(encoded, ts)?;
            report.resolves += 1;
        }
        info!("Loaded day {} of {}", spec.days - day, spec.days);
    }
    db.flush()?;

    report.series = db.stats().series_created - created_before;
    info!(
        "Registered {} new series with {} resolves in {:?}",
        report.series,
        report.resolves,
        started.elapsed()
    );
    Ok(report)
}
