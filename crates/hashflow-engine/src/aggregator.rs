//! One aggregation run: fetch a batch, extract and count tags, merge, close the job.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use hashflow_core::{extract_tags, window_key, JobId, WindowKey, JOB_KIND_HASHTAGS};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    ChangeEvent, ChangeNotifier, Clock, CounterStore, HashflowError, JobStore, JobTracker,
    NoopNotifier, RecordStore, Result, SystemClock, WindowMerger,
};

/// Records pulled per run unless configured otherwise.
pub const DEFAULT_BATCH_LIMIT: usize = 100;

#[derive(Clone, Debug, PartialEq)]
pub struct AggregatorConfig {
    pub batch_limit: usize,
    /// Overall bound for one run, checked before every store call.
    pub deadline: Option<Duration>,
    pub job_kind: String,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            batch_limit: DEFAULT_BATCH_LIMIT,
            deadline: None,
            job_kind: JOB_KIND_HASHTAGS.to_string(),
        }
    }
}

/// Summary returned by a successful run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job_id: JobId,
    pub records_processed: u64,
    /// Total tag occurrences, not distinct tags.
    pub tags_extracted: u64,
    pub unique_tags: usize,
    /// Window the counts were merged into; `None` when the batch was empty.
    pub window: Option<WindowKey>,
}

#[derive(Debug, Default)]
struct Batch {
    counts: BTreeMap<String, u64>,
    records_processed: u64,
    tags_extracted: u64,
    merge_started: bool,
}

/// Batch hashtag aggregator over injected record, counter, and job stores.
///
/// `run_job` takes `&self`; several runs may execute at once against the same stores.
pub struct Aggregator<R, C, J, N = NoopNotifier, K = SystemClock> {
    records: R,
    counters: C,
    jobs: J,
    notifier: N,
    clock: K,
    config: AggregatorConfig,
}

impl<R, C, J> Aggregator<R, C, J> {
    pub fn new(records: R, counters: C, jobs: J) -> Self {
        Self {
            records,
            counters,
            jobs,
            notifier: NoopNotifier,
            clock: SystemClock,
            config: AggregatorConfig::default(),
        }
    }
}

impl<R, C, J, N, K> Aggregator<R, C, J, N, K> {
    pub fn with_parts(
        records: R,
        counters: C,
        jobs: J,
        notifier: N,
        clock: K,
        config: AggregatorConfig,
    ) -> Self {
        Self {
            records,
            counters,
            jobs,
            notifier,
            clock,
            config,
        }
    }

    pub fn with_notifier<N2>(self, notifier: N2) -> Aggregator<R, C, J, N2, K> {
        Aggregator {
            records: self.records,
            counters: self.counters,
            jobs: self.jobs,
            notifier,
            clock: self.clock,
            config: self.config,
        }
    }

    pub fn with_clock<K2>(self, clock: K2) -> Aggregator<R, C, J, N, K2> {
        Aggregator {
            records: self.records,
            counters: self.counters,
            jobs: self.jobs,
            notifier: self.notifier,
            clock,
            config: self.config,
        }
    }

    pub fn with_config(mut self, config: AggregatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    pub fn records(&self) -> &R {
        &self.records
    }

    pub fn counters(&self) -> &C {
        &self.counters
    }

    pub fn jobs(&self) -> &J {
        &self.jobs
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }
}

impl<R, C, J, N, K> Aggregator<R, C, J, N, K>
where
    R: RecordStore,
    C: CounterStore,
    J: JobStore,
    N: ChangeNotifier,
    K: Clock,
{
    /// Run one aggregation job.
    ///
    /// Any failure after the job record exists marks the job `failed`. Writes that
    /// already committed stay; records this run claimed have their counts merged
    /// before the job is failed, unless the merge itself was what failed.
    pub fn run_job(&self) -> Result<JobOutcome> {
        let started = Instant::now();
        let tracker = JobTracker::new(&self.jobs, &self.clock);
        let job = tracker.start(&self.config.job_kind)?;
        self.notify(ChangeEvent::JobStarted { job: job.clone() });

        let mut batch = Batch::default();
        let result = match self.process(&mut batch, started) {
            Ok(window) => tracker
                .complete(job.id(), batch.records_processed, batch.tags_extracted)
                .map(|finished| (window, finished)),
            Err(err) => Err(err),
        };

        #[cfg(feature = "metrics")]
        {
            hashflow_metrics::record_job_latency(started.elapsed());
            hashflow_metrics::record_batch(batch.records_processed, batch.tags_extracted);
        }

        match result {
            Ok((window, finished)) => {
                self.notify(ChangeEvent::JobFinished { job: finished });
                Ok(JobOutcome {
                    job_id: job.id().clone(),
                    records_processed: batch.records_processed,
                    tags_extracted: batch.tags_extracted,
                    unique_tags: batch.counts.len(),
                    window,
                })
            }
            Err(err) => Err(self.abort(&tracker, job.id(), &mut batch, err)),
        }
    }

    fn process(&self, batch: &mut Batch, started: Instant) -> Result<Option<WindowKey>> {
        self.check_deadline(started)?;
        let records = self.records.fetch_unprocessed(self.config.batch_limit)?;
        if records.is_empty() {
            debug!("no unprocessed records");
            return Ok(None);
        }
        info!(batch = records.len(), "processing batch");

        for record in records {
            self.check_deadline(started)?;
            // Existing tags are trusted as-is; only empty lists are back-filled.
            let tags = if record.tags.is_empty() {
                let extracted = extract_tags(&record.body);
                if !extracted.is_empty() {
                    self.records.update_tags(&record.id, &extracted)?;
                    self.check_deadline(started)?;
                }
                extracted
            } else {
                record.tags
            };

            if !self.records.mark_processed(&record.id)? {
                debug!(record_id = %record.id, "record already claimed by another run");
                continue;
            }
            batch.records_processed += 1;
            for tag in tags {
                *batch.counts.entry(tag).or_default() += 1;
                batch.tags_extracted += 1;
            }
            self.notify(ChangeEvent::RecordProcessed {
                record_id: record.id,
            });
        }

        self.check_deadline(started)?;
        self.merge(batch).map(Some)
    }

    fn merge(&self, batch: &mut Batch) -> Result<WindowKey> {
        let window = window_key(self.clock.now());
        batch.merge_started = true;
        let summary = WindowMerger::new(&self.counters).merge(&batch.counts, &window)?;
        info!(
            window = %window,
            unique_tags = batch.counts.len(),
            tags_extracted = batch.tags_extracted,
            created = summary.created,
            incremented = summary.incremented,
            "counts merged"
        );
        for counter in summary.counters {
            self.notify(ChangeEvent::CounterMerged { counter });
        }
        Ok(window)
    }

    fn abort(
        &self,
        tracker: &JobTracker<'_, J, K>,
        job_id: &JobId,
        batch: &mut Batch,
        err: HashflowError,
    ) -> HashflowError {
        if batch.records_processed > 0 && !batch.merge_started {
            match self.merge(batch) {
                Ok(window) => info!(
                    job_id = %job_id,
                    window = %window,
                    records = batch.records_processed,
                    "merged counts of claimed records before failing"
                ),
                Err(merge_err) => warn!(
                    job_id = %job_id,
                    error = %merge_err,
                    "merge of claimed records failed; their counts are lost"
                ),
            }
        }

        let message = err.to_string();
        match tracker.fail(job_id, &message) {
            Ok(job) => self.notify(ChangeEvent::JobFinished { job }),
            Err(fail_err) => warn!(
                job_id = %job_id,
                error = %fail_err,
                "could not record job failure"
            ),
        }

        if batch.records_processed > 0 {
            HashflowError::PartialBatch {
                job_id: job_id.clone(),
                records_committed: batch.records_processed,
                message,
            }
        } else {
            HashflowError::JobFailed {
                job_id: job_id.clone(),
                message,
            }
        }
    }

    fn check_deadline(&self, started: Instant) -> Result<()> {
        match self.config.deadline {
            Some(limit) if started.elapsed() >= limit => {
                Err(HashflowError::DeadlineExceeded(limit))
            }
            _ => Ok(()),
        }
    }

    fn notify(&self, event: ChangeEvent) {
        if let Err(err) = self.notifier.publish(&event) {
            warn!(error = %err, kind = ?event.kind(), "change notification dropped");
        }
    }
}
