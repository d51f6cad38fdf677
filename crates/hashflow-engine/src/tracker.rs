//! Job lifecycle bookkeeping on top of a [`JobStore`].

use hashflow_core::{JobId, JobRecord};
use tracing::{info, warn};

use crate::{Clock, HashflowError, JobStore, Result};

/// Opens and closes job records, stamping times from the injected clock.
pub struct JobTracker<'a, J, K> {
    jobs: &'a J,
    clock: &'a K,
}

impl<'a, J, K> JobTracker<'a, J, K>
where
    J: JobStore,
    K: Clock,
{
    pub fn new(jobs: &'a J, clock: &'a K) -> Self {
        Self { jobs, clock }
    }

    /// Open a `running` job. Any store error becomes `JobTracker`, which is fatal to a run.
    pub fn start(&self, kind: &str) -> Result<JobRecord> {
        let job = self
            .clock
            .timestamp()
            .map_err(HashflowError::from)
            .and_then(|started_at| self.jobs.create_job(kind, started_at))
            .map_err(|e| HashflowError::JobTracker(e.to_string()))?;
        info!(job_id = %job.id(), kind, "job started");
        Ok(job)
    }

    pub fn complete(
        &self,
        id: &JobId,
        records_processed: u64,
        tags_extracted: u64,
    ) -> Result<JobRecord> {
        let completed_at = self.clock.timestamp()?;
        let job = self
            .jobs
            .complete_job(id, records_processed, tags_extracted, completed_at)?;
        info!(
            job_id = %id,
            records_processed,
            tags_extracted,
            "job completed"
        );
        #[cfg(feature = "metrics")]
        hashflow_metrics::record_job_finished(job.status().as_str());
        Ok(job)
    }

    pub fn fail(&self, id: &JobId, message: &str) -> Result<JobRecord> {
        let job = self.jobs.fail_job(id, message, self.clock.timestamp()?)?;
        warn!(job_id = %id, error = message, "job failed");
        #[cfg(feature = "metrics")]
        hashflow_metrics::record_job_finished(job.status().as_str());
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemStore, Op};
    use crate::FixedClock;
    use hashflow_core::{JobStatus, JOB_KIND_HASHTAGS};
    use time::macros::datetime;

    fn clock() -> FixedClock {
        FixedClock(datetime!(2024-05-01 12:30:00 UTC))
    }

    #[test]
    fn start_then_complete() {
        let store = MemStore::default();
        let clock = clock();
        let tracker = JobTracker::new(&store, &clock);

        let job = tracker.start(JOB_KIND_HASHTAGS).unwrap();
        assert_eq!(job.status(), JobStatus::Running);
        assert_eq!(job.kind(), JOB_KIND_HASHTAGS);
        assert_eq!(job.started_at().0, "2024-05-01T12:30:00Z");

        let done = tracker.complete(job.id(), 4, 7).unwrap();
        assert_eq!(done.status(), JobStatus::Completed);
        assert_eq!(done.records_processed(), 4);
        assert_eq!(done.tags_extracted(), 7);
        assert_eq!(done.completed_at().unwrap().0, "2024-05-01T12:30:00Z");
        assert_eq!(store.get_job(job.id()).unwrap().unwrap(), done);
    }

    #[test]
    fn terminal_jobs_reject_second_transition() {
        let store = MemStore::default();
        let clock = clock();
        let tracker = JobTracker::new(&store, &clock);

        let job = tracker.start(JOB_KIND_HASHTAGS).unwrap();
        let failed = tracker.fail(job.id(), "boom").unwrap();
        assert_eq!(failed.error_message(), Some("boom"));

        assert!(matches!(
            tracker.complete(job.id(), 1, 1),
            Err(HashflowError::InvalidTransition(_))
        ));
        assert!(matches!(
            tracker.fail(job.id(), "again"),
            Err(HashflowError::InvalidTransition(_))
        ));
        let stored = store.get_job(job.id()).unwrap().unwrap();
        assert_eq!(stored.status(), JobStatus::Failed);
        assert_eq!(stored.error_message(), Some("boom"));
    }

    #[test]
    fn create_failure_maps_to_job_tracker_error() {
        let store = MemStore::default();
        store.fail_on(Op::CreateJob, 1);
        let clock = clock();
        let tracker = JobTracker::new(&store, &clock);

        let err = tracker.start(JOB_KIND_HASHTAGS).unwrap_err();
        assert!(matches!(err, HashflowError::JobTracker(_)));
        assert!(store.recent_jobs(10).unwrap().is_empty());
    }
}
