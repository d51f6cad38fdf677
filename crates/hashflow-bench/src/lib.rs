//! Fixtures shared by the Hashflow benchmarks and load tests.

use hashflow_core::{ExternalId, NewRecord, Timestamp};
use hashflow_engine::{Aggregator, AggregatorConfig, RecordStore};
use hashflow_storage_sled::{SledConfig, SledStore};
use tempfile::TempDir;
use time::{Duration, OffsetDateTime};

pub type SledAggregator = Aggregator<SledStore, SledStore, SledStore>;

const TAG_POOL: &[&str] = &[
    "Rust", "AI", "MachineLearning", "BigData", "DevOps", "Kubernetes", "Security", "Startup",
];

/// Body with one to three tags drawn deterministically from a fixed pool.
pub fn sample_body(idx: usize) -> String {
    let tags = idx % 3 + 1;
    let mut body = format!("update {idx}:");
    for n in 0..tags {
        body.push_str(" #");
        body.push_str(TAG_POOL[(idx + n * 3) % TAG_POOL.len()]);
    }
    body
}

/// Temporary sled store plus helpers to seed it.
pub struct BenchCtx {
    _tmp: TempDir,
    pub store: SledStore,
}

impl BenchCtx {
    pub fn new() -> anyhow::Result<Self> {
        let tmp = TempDir::new()?;
        let mut cfg = SledConfig::new(tmp.path());
        cfg.flush_on_write = false;
        let store = SledStore::open(cfg)?;
        Ok(Self { _tmp: tmp, store })
    }

    /// Insert `count` unprocessed records one second apart; returns total tag occurrences.
    pub fn seed(&self, count: usize) -> anyhow::Result<u64> {
        let base = OffsetDateTime::UNIX_EPOCH + Duration::days(19_844);
        let mut occurrences = 0u64;
        for idx in 0..count {
            let created_at = base + Duration::seconds(idx as i64);
            let record = self.store.insert_record(
                NewRecord {
                    external_id: ExternalId::new(format!("bench-{idx}")),
                    author: "bench".into(),
                    body: sample_body(idx),
                    tags: Some(Vec::new()),
                },
                Timestamp::from_datetime(created_at)?,
            )?;
            occurrences += hashflow_core::extract_tags(&record.body).len() as u64;
        }
        Ok(occurrences)
    }

    pub fn aggregator(&self, batch_limit: usize) -> SledAggregator {
        let store = self.store.clone();
        Aggregator::new(store.clone(), store.clone(), store).with_config(AggregatorConfig {
            batch_limit,
            ..AggregatorConfig::default()
        })
    }
}
