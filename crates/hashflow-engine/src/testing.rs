//! In-memory stores with fault injection for engine tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hashflow_core::{
    ExternalId, JobId, JobRecord, NewRecord, Record, RecordId, Timestamp, WindowCounter,
    WindowKey,
};

use crate::{CounterStore, HashflowError, JobStore, RecordStore, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    InsertRecord,
    FetchUnprocessed,
    UpdateTags,
    MarkProcessed,
    CreateCounter,
    ReadCounter,
    UpdateCounter,
    CreateJob,
    CompleteJob,
    FailJob,
}

#[derive(Debug, Default)]
struct Fault {
    skip: usize,
    times: usize,
}

#[derive(Default)]
struct State {
    records: Vec<Record>,
    counters: BTreeMap<(String, WindowKey), u64>,
    jobs: Vec<JobRecord>,
    faults: HashMap<Op, Fault>,
    delays: HashMap<Op, Duration>,
    calls: HashMap<Op, usize>,
    next_id: u64,
}

/// Shared in-memory store implementing all three store traits.
///
/// Counter merges use the trait's default create / read / write-back path.
#[derive(Clone, Default)]
pub struct MemStore {
    state: Arc<Mutex<State>>,
}

impl MemStore {
    /// Fail the next `times` calls of `op`.
    pub fn fail_on(&self, op: Op, times: usize) {
        self.fail_after(op, 0, times);
    }

    /// Let `skip` calls of `op` succeed, then fail the following `times`.
    pub fn fail_after(&self, op: Op, skip: usize, times: usize) {
        self.state
            .lock()
            .unwrap()
            .faults
            .insert(op, Fault { skip, times });
    }

    pub fn delay_on(&self, op: Op, delay: Duration) {
        self.state.lock().unwrap().delays.insert(op, delay);
    }

    pub fn calls(&self, op: Op) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .get(&op)
            .copied()
            .unwrap_or(0)
    }

    pub fn seed(&self, external_id: &str, body: &str, created_at: &str) -> Record {
        self.insert_record(
            NewRecord {
                external_id: ExternalId::new(external_id),
                author: "tester".into(),
                body: body.into(),
                tags: Some(Vec::new()),
            },
            Timestamp::new(created_at),
        )
        .unwrap()
    }

    pub fn record(&self, id: &RecordId) -> Record {
        self.get_record(id).unwrap().expect("record exists")
    }

    fn check(&self, op: Op) -> Result<()> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            *state.calls.entry(op).or_default() += 1;
            if let Some(fault) = state.faults.get_mut(&op) {
                if fault.skip > 0 {
                    fault.skip -= 1;
                } else if fault.times > 0 {
                    fault.times -= 1;
                    return Err(HashflowError::StoreUnavailable(format!(
                        "injected {op:?} failure"
                    )));
                }
            }
            state.delays.get(&op).copied()
        };
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        Ok(())
    }

    fn sort_key(record: &Record) -> u64 {
        record.created_at.unix_nanos().unwrap_or(0)
    }
}

impl RecordStore for MemStore {
    fn insert_record(&self, new_record: NewRecord, created_at: Timestamp) -> Result<Record> {
        self.check(Op::InsertRecord)?;
        new_record.validate()?;
        let mut state = self.state.lock().unwrap();
        if state
            .records
            .iter()
            .any(|r| r.external_id == new_record.external_id)
        {
            return Err(HashflowError::Conflict(format!(
                "external id {} already exists",
                new_record.external_id
            )));
        }
        state.next_id += 1;
        let id = RecordId::new(format!("rec-{}", state.next_id));
        let record = Record::from_new(id, new_record, created_at);
        state.records.push(record.clone());
        Ok(record)
    }

    fn fetch_unprocessed(&self, limit: usize) -> Result<Vec<Record>> {
        self.check(Op::FetchUnprocessed)?;
        let state = self.state.lock().unwrap();
        let mut pending: Vec<Record> = state
            .records
            .iter()
            .filter(|r| !r.processed)
            .cloned()
            .collect();
        pending.sort_by_key(Self::sort_key);
        pending.truncate(limit);
        Ok(pending)
    }

    fn update_tags(&self, id: &RecordId, tags: &[String]) -> Result<()> {
        self.check(Op::UpdateTags)?;
        let mut state = self.state.lock().unwrap();
        let record = state
            .records
            .iter_mut()
            .find(|r| &r.id == id)
            .ok_or_else(|| HashflowError::NotFound(format!("record {id}")))?;
        record.tags = tags.to_vec();
        Ok(())
    }

    fn mark_processed(&self, id: &RecordId) -> Result<bool> {
        self.check(Op::MarkProcessed)?;
        let mut state = self.state.lock().unwrap();
        let record = state
            .records
            .iter_mut()
            .find(|r| &r.id == id)
            .ok_or_else(|| HashflowError::NotFound(format!("record {id}")))?;
        let flipped = !record.processed;
        record.processed = true;
        Ok(flipped)
    }

    fn get_record(&self, id: &RecordId) -> Result<Option<Record>> {
        let state = self.state.lock().unwrap();
        Ok(state.records.iter().find(|r| &r.id == id).cloned())
    }

    fn recent_records(&self, limit: usize) -> Result<Vec<Record>> {
        let state = self.state.lock().unwrap();
        let mut all = state.records.clone();
        all.sort_by_key(|r| std::cmp::Reverse(Self::sort_key(r)));
        all.truncate(limit);
        Ok(all)
    }
}

impl CounterStore for MemStore {
    fn create_counter(&self, tag: &str, window: &WindowKey, count: u64) -> Result<()> {
        self.check(Op::CreateCounter)?;
        let mut state = self.state.lock().unwrap();
        let key = (tag.to_string(), window.clone());
        if state.counters.contains_key(&key) {
            return Err(HashflowError::Conflict(format!("counter {tag}@{window}")));
        }
        state.counters.insert(key, count);
        Ok(())
    }

    fn read_counter(&self, tag: &str, window: &WindowKey) -> Result<u64> {
        self.check(Op::ReadCounter)?;
        let state = self.state.lock().unwrap();
        state
            .counters
            .get(&(tag.to_string(), window.clone()))
            .copied()
            .ok_or_else(|| HashflowError::NotFound(format!("counter {tag}@{window}")))
    }

    fn update_counter(&self, tag: &str, window: &WindowKey, count: u64) -> Result<()> {
        self.check(Op::UpdateCounter)?;
        let mut state = self.state.lock().unwrap();
        match state.counters.get_mut(&(tag.to_string(), window.clone())) {
            Some(existing) => {
                *existing = count;
                Ok(())
            }
            None => Err(HashflowError::NotFound(format!("counter {tag}@{window}"))),
        }
    }

    fn top_counters(&self, window: Option<&WindowKey>, limit: usize) -> Result<Vec<WindowCounter>> {
        let state = self.state.lock().unwrap();
        let mut out: Vec<WindowCounter> = state
            .counters
            .iter()
            .filter(|((_, w), _)| window.map(|target| target == w).unwrap_or(true))
            .map(|((tag, w), count)| WindowCounter {
                tag: tag.clone(),
                window: w.clone(),
                count: *count,
            })
            .collect();
        out.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.tag.cmp(&b.tag)));
        out.truncate(limit);
        Ok(out)
    }
}

impl JobStore for MemStore {
    fn create_job(&self, kind: &str, started_at: Timestamp) -> Result<JobRecord> {
        self.check(Op::CreateJob)?;
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let job = JobRecord::start(JobId::new(format!("job-{}", state.next_id)), kind, started_at);
        state.jobs.push(job.clone());
        Ok(job)
    }

    fn complete_job(
        &self,
        id: &JobId,
        records_processed: u64,
        tags_extracted: u64,
        completed_at: Timestamp,
    ) -> Result<JobRecord> {
        self.check(Op::CompleteJob)?;
        let mut state = self.state.lock().unwrap();
        let job = state
            .jobs
            .iter_mut()
            .find(|j| j.id() == id)
            .ok_or_else(|| HashflowError::NotFound(format!("job {id}")))?;
        job.complete(records_processed, tags_extracted, completed_at)?;
        Ok(job.clone())
    }

    fn fail_job(&self, id: &JobId, message: &str, completed_at: Timestamp) -> Result<JobRecord> {
        self.check(Op::FailJob)?;
        let mut state = self.state.lock().unwrap();
        let job = state
            .jobs
            .iter_mut()
            .find(|j| j.id() == id)
            .ok_or_else(|| HashflowError::NotFound(format!("job {id}")))?;
        job.fail(message, completed_at)?;
        Ok(job.clone())
    }

    fn get_job(&self, id: &JobId) -> Result<Option<JobRecord>> {
        let state = self.state.lock().unwrap();
        Ok(state.jobs.iter().find(|j| j.id() == id).cloned())
    }

    fn recent_jobs(&self, limit: usize) -> Result<Vec<JobRecord>> {
        let state = self.state.lock().unwrap();
        Ok(state.jobs.iter().rev().take(limit).cloned().collect())
    }
}
