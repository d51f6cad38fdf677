use std::sync::Arc;
use std::time::Instant;

use hashflow_bench::{BenchCtx, SledAggregator};
use hashflow_core::JobStatus;
use hashflow_engine::{CounterStore, JobOutcome, JobStore, RecordStore};

/// Run jobs until the store has nothing pending, returning every outcome.
fn drain(aggregator: Arc<SledAggregator>, ctx: Arc<BenchCtx>) -> Vec<JobOutcome> {
    let mut outcomes = Vec::new();
    while ctx.store.pending_records().unwrap() > 0 {
        outcomes.push(aggregator.run_job().unwrap());
    }
    outcomes
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_runs_count_every_record_once() {
    let ctx = Arc::new(BenchCtx::new().unwrap());
    let occurrences = ctx.seed(400).unwrap();

    let start = Instant::now();
    let runners: Vec<_> = (0..2)
        .map(|_| {
            let aggregator = Arc::new(ctx.aggregator(25));
            let ctx = ctx.clone();
            tokio::task::spawn_blocking(move || drain(aggregator, ctx))
        })
        .collect();

    let mut outcomes = Vec::new();
    for runner in runners {
        outcomes.extend(runner.await.expect("runner"));
    }
    let elapsed_ms = start.elapsed().as_secs_f64() * 1_000.0;

    let processed: u64 = outcomes.iter().map(|o| o.records_processed).sum();
    let tags: u64 = outcomes.iter().map(|o| o.tags_extracted).sum();
    assert_eq!(processed, 400);
    assert_eq!(tags, occurrences);

    let counted: u64 = ctx
        .store
        .top_counters(None, usize::MAX)
        .unwrap()
        .iter()
        .map(|c| c.count)
        .sum();
    assert_eq!(counted, occurrences);

    assert!(ctx.store.fetch_unprocessed(10).unwrap().is_empty());
    assert!(ctx
        .store
        .recent_records(400)
        .unwrap()
        .iter()
        .all(|r| r.processed && !r.tags.is_empty()));

    let jobs = ctx.store.recent_jobs(usize::MAX).unwrap();
    assert_eq!(jobs.len(), outcomes.len());
    assert!(jobs.iter().all(|j| j.status() == JobStatus::Completed));

    println!(
        "[perf] concurrent runs: jobs={}, records={}, elapsed={:.2}ms",
        outcomes.len(),
        processed,
        elapsed_ms
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sequential_rerun_is_a_no_op() {
    let ctx = BenchCtx::new().unwrap();
    let occurrences = ctx.seed(50).unwrap();
    let aggregator = ctx.aggregator(100);

    let first = aggregator.run_job().unwrap();
    assert_eq!(first.records_processed, 50);
    assert_eq!(first.tags_extracted, occurrences);

    let second = aggregator.run_job().unwrap();
    assert_eq!(second.records_processed, 0);
    assert!(second.window.is_none());
}
