//! Store traits and the batch aggregation pipeline for Hashflow.
//!
//! The engine never owns persistent state. Records, counters, and job records live
//! behind the [`RecordStore`], [`CounterStore`], and [`JobStore`] traits, which are
//! injected into the [`Aggregator`] once per process. Safety across concurrent runs
//! comes from monotone flag flips and additive merges, never from in-process locks.

use std::sync::Arc;
use std::time::Duration;

use hashflow_core::{
    JobId, JobRecord, NewRecord, Record, RecordError, RecordId, Timestamp, TimestampError,
    TransitionError, WindowCounter, WindowKey,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

mod aggregator;
mod merger;
mod tracker;

#[cfg(test)]
mod testing;

pub use aggregator::{Aggregator, AggregatorConfig, JobOutcome, DEFAULT_BATCH_LIMIT};
pub use merger::{MergeSummary, WindowMerger};
pub use tracker::JobTracker;

pub type Result<T> = std::result::Result<T, HashflowError>;

/// Errors surfaced by the Hashflow engine layer.
#[derive(Debug, Error)]
pub enum HashflowError {
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("job tracker failure: {0}")]
    JobTracker(String),
    #[error("job {job_id} failed after committing {records_committed} records: {message}")]
    PartialBatch {
        job_id: JobId,
        records_committed: u64,
        message: String,
    },
    #[error("job {job_id} failed: {message}")]
    JobFailed { job_id: JobId, message: String },
    #[error("invalid transition: {0}")]
    InvalidTransition(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("run deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),
}

impl HashflowError {
    /// Job the error belongs to, when the run got far enough to open one.
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            HashflowError::PartialBatch { job_id, .. } | HashflowError::JobFailed { job_id, .. } => {
                Some(job_id)
            }
            _ => None,
        }
    }
}

impl From<TransitionError> for HashflowError {
    fn from(err: TransitionError) -> Self {
        HashflowError::InvalidTransition(err.to_string())
    }
}

impl From<RecordError> for HashflowError {
    fn from(err: RecordError) -> Self {
        HashflowError::InvalidInput(err.to_string())
    }
}

impl From<TimestampError> for HashflowError {
    fn from(err: TimestampError) -> Self {
        HashflowError::InvalidInput(err.to_string())
    }
}

/// Raw record storage consumed by the aggregator and fed by ingestion.
pub trait RecordStore {
    /// Persist a validated submission. Fails with `Conflict` on a duplicate external id.
    fn insert_record(&self, new_record: NewRecord, created_at: Timestamp) -> Result<Record>;
    /// Up to `limit` unprocessed records, oldest `created_at` first.
    fn fetch_unprocessed(&self, limit: usize) -> Result<Vec<Record>>;
    fn update_tags(&self, id: &RecordId, tags: &[String]) -> Result<()>;
    /// Flip the processed flag. Returns `true` only for the call that flipped it.
    fn mark_processed(&self, id: &RecordId) -> Result<bool>;
    fn get_record(&self, id: &RecordId) -> Result<Option<Record>>;
    /// Most recently created records first.
    fn recent_records(&self, limit: usize) -> Result<Vec<Record>>;
}

/// How a merge landed in the counter store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOutcome {
    Created,
    Incremented,
}

/// Per-window counter storage with a unique (tag, window) key.
pub trait CounterStore {
    /// Create a counter. Fails with `Conflict` if the pair already exists.
    fn create_counter(&self, tag: &str, window: &WindowKey, count: u64) -> Result<()>;
    /// Current count. Fails with `NotFound` if the pair does not exist.
    fn read_counter(&self, tag: &str, window: &WindowKey) -> Result<u64>;
    fn update_counter(&self, tag: &str, window: &WindowKey, count: u64) -> Result<()>;

    /// Add `delta` to the counter, creating it when absent; returns the new count.
    ///
    /// The default is the create / read / write-back sequence, which can lose an
    /// increment when two writers interleave between the read and the write. Stores
    /// with an atomic insert-or-add primitive must override it.
    fn upsert_add(&self, tag: &str, window: &WindowKey, delta: u64) -> Result<(u64, MergeOutcome)> {
        match self.create_counter(tag, window, delta) {
            Ok(()) => Ok((delta, MergeOutcome::Created)),
            Err(HashflowError::Conflict(_)) => {
                let current = self.read_counter(tag, window)?;
                let next = current.saturating_add(delta);
                self.update_counter(tag, window, next)?;
                Ok((next, MergeOutcome::Incremented))
            }
            Err(err) => Err(err),
        }
    }

    /// Highest counts first (ties broken by tag), optionally restricted to one window.
    fn top_counters(&self, window: Option<&WindowKey>, limit: usize) -> Result<Vec<WindowCounter>>;
}

/// Job record storage; every call is a single-row create or terminal update.
pub trait JobStore {
    fn create_job(&self, kind: &str, started_at: Timestamp) -> Result<JobRecord>;
    fn complete_job(
        &self,
        id: &JobId,
        records_processed: u64,
        tags_extracted: u64,
        completed_at: Timestamp,
    ) -> Result<JobRecord>;
    fn fail_job(&self, id: &JobId, message: &str, completed_at: Timestamp) -> Result<JobRecord>;
    fn get_job(&self, id: &JobId) -> Result<Option<JobRecord>>;
    /// Most recently started jobs first.
    fn recent_jobs(&self, limit: usize) -> Result<Vec<JobRecord>>;
}

/// Change published after a write commits.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeEvent {
    JobStarted { job: JobRecord },
    JobFinished { job: JobRecord },
    CounterMerged { counter: WindowCounter },
    RecordProcessed { record_id: RecordId },
}

/// Discriminant of a [`ChangeEvent`], used for subscription filters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Job,
    Counter,
    Record,
}

impl ChangeEvent {
    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangeEvent::JobStarted { .. } | ChangeEvent::JobFinished { .. } => ChangeKind::Job,
            ChangeEvent::CounterMerged { .. } => ChangeKind::Counter,
            ChangeEvent::RecordProcessed { .. } => ChangeKind::Record,
        }
    }
}

/// Post-commit hook. Delivery is best effort; the engine ignores publish errors.
pub trait ChangeNotifier {
    fn publish(&self, event: &ChangeEvent) -> Result<()>;
}

/// Notifier that drops every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopNotifier;

impl ChangeNotifier for NoopNotifier {
    fn publish(&self, _event: &ChangeEvent) -> Result<()> {
        Ok(())
    }
}

impl<T: ChangeNotifier + ?Sized> ChangeNotifier for Arc<T> {
    fn publish(&self, event: &ChangeEvent) -> Result<()> {
        (**self).publish(event)
    }
}

/// Source of wall-clock time for timestamps and window resolution.
pub trait Clock {
    fn now(&self) -> OffsetDateTime;

    fn timestamp(&self) -> std::result::Result<Timestamp, TimestampError> {
        Timestamp::from_datetime(self.now())
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Clock pinned to a single instant.
#[derive(Clone, Copy, Debug)]
pub struct FixedClock(pub OffsetDateTime);

impl Clock for FixedClock {
    fn now(&self) -> OffsetDateTime {
        self.0
    }
}
