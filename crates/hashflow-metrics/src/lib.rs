//! Metrics and tracing facade for Hashflow.
//!
//! Every helper emits through the `metrics` crate and leaves a trace event behind; with
//! no recorder installed the calls are cheap no-ops.

use std::time::Duration;

use metrics::{counter, gauge, histogram};
use tracing::trace;

/// Record wall time of one aggregation run in milliseconds.
pub fn record_job_latency(latency: Duration) {
    let ms = latency.as_secs_f64() * 1_000.0;
    histogram!("hashflow.job.latency_ms").record(ms);
    trace!(latency_ms = ms, "job latency observed");
}

/// Count finished jobs by terminal status (`completed` / `failed`).
pub fn record_job_finished(status: &str) {
    counter!("hashflow.jobs.finished_total", "status" => status.to_string()).increment(1);
    trace!(status, "job finish recorded");
}

/// Records claimed and tag occurrences counted by one run.
pub fn record_batch(records: u64, tags: u64) {
    histogram!("hashflow.job.batch_size").record(records as f64);
    if records > 0 {
        counter!("hashflow.records.processed_total").increment(records);
    }
    if tags > 0 {
        counter!("hashflow.tags.extracted_total").increment(tags);
    }
    trace!(records, tags, "batch recorded");
}

/// Count one counter merge, split by whether the counter was new.
pub fn record_counter_merge(created: bool) {
    let outcome = if created { "created" } else { "incremented" };
    counter!("hashflow.counters.merged_total", "outcome" => outcome).increment(1);
}

/// Count records accepted through ingestion.
pub fn record_ingested(count: u64) {
    if count == 0 {
        return;
    }
    counter!("hashflow.records.ingested_total").increment(count);
    trace!(count, "records ingested");
}

/// Track disk usage for the storage path.
pub fn record_disk_usage(used_bytes: u64, total_bytes: u64) {
    if total_bytes == 0 {
        return;
    }
    let used = used_bytes as f64;
    let total = total_bytes as f64;
    gauge!("hashflow.disk.used_bytes").set(used);
    gauge!("hashflow.disk.total_bytes").set(total);
    gauge!("hashflow.disk.used_percent").set(used / total * 100.0);
    trace!(used_bytes, total_bytes, "disk usage recorded");
}

/// Count change events dropped because a subscriber queue was full.
pub fn record_feed_dropped(dropped: u64) {
    if dropped == 0 {
        return;
    }
    counter!("hashflow.feed.dropped_total").increment(dropped);
    trace!(dropped, "change events dropped");
}

/// Current number of change feed subscribers.
pub fn record_feed_subscribers(count: usize) {
    gauge!("hashflow.feed.subscribers").set(count as f64);
}
