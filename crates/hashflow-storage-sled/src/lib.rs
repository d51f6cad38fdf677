//! Sled-backed record, counter, and job stores for Hashflow.
//!
//! One sled database holds everything under key prefixes:
//! - `records/data/{record_id}` -> serialized `Record`
//! - `records/pending/{created_nanos}/{record_id}` -> `record_id`, present while unprocessed
//! - `records/created/{created_nanos}/{record_id}` -> `record_id`, creation order index
//! - `records/external/{external_id}` -> `record_id`
//! - `counters/{window}/{tag}` -> big-endian `u64`
//! - `jobs/data/{job_id}` -> serialized `JobRecord`
//! - `jobs/started/{seq}` -> `job_id`
//!
//! Numeric key segments are zero-padded decimal so byte order matches numeric order.
//! Every read-modify-write goes through compare-and-swap, so several processes sharing
//! the handle (or several runs in one process) never lose a flag flip or an increment.

use std::path::PathBuf;

use bincode::config::{standard, Configuration};
use hashflow_core::{JobId, JobRecord, NewRecord, Record, RecordId, Timestamp, WindowCounter, WindowKey};
use hashflow_engine::{CounterStore, HashflowError, JobStore, MergeOutcome, RecordStore, Result};
use serde::{de::DeserializeOwned, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::IVec;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

const KEY_WIDTH: usize = 20;
const PENDING_PREFIX: &str = "records/pending/";
const CREATED_PREFIX: &str = "records/created/";
const COUNTER_PREFIX: &str = "counters/";
const JOB_ORDER_PREFIX: &str = "jobs/started/";

#[derive(Debug, Clone)]
pub struct SledConfig {
    pub path: PathBuf,
    pub flush_on_write: bool,
}

impl SledConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            flush_on_write: true,
        }
    }
}

#[derive(Debug, Error)]
enum StorageError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("serialization error: {0}")]
    BincodeEncode(#[from] bincode::error::EncodeError),
    #[error("deserialization error: {0}")]
    BincodeDecode(#[from] bincode::error::DecodeError),
    #[error("utf8 error: {0}")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("corrupt value under {0}")]
    Corrupt(String),
}

impl From<StorageError> for HashflowError {
    fn from(err: StorageError) -> Self {
        HashflowError::StoreUnavailable(err.to_string())
    }
}

/// Sled-backed implementation of all three Hashflow store traits.
///
/// Cloning is cheap and shares the underlying database.
#[derive(Clone)]
pub struct SledStore {
    db: sled::Db,
    flush_on_write: bool,
    codec: Configuration,
}

impl SledStore {
    pub fn open(config: SledConfig) -> Result<Self> {
        let db = sled::open(&config.path).map_err(StorageError::from)?;
        debug!(path = %config.path.display(), "sled store opened");
        Ok(Self {
            db,
            flush_on_write: config.flush_on_write,
            codec: standard(),
        })
    }

    /// Number of records still waiting for an aggregation run.
    pub fn pending_records(&self) -> Result<usize> {
        let mut count = 0;
        for entry in self.db.scan_prefix(PENDING_PREFIX) {
            entry.map_err(StorageError::from)?;
            count += 1;
        }
        Ok(count)
    }

    pub fn size_on_disk(&self) -> Result<u64> {
        Ok(self.db.size_on_disk().map_err(StorageError::from)?)
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush().map_err(StorageError::from)?;
        Ok(())
    }

    fn record_key(id: &RecordId) -> Vec<u8> {
        format!("records/data/{}", id.0).into_bytes()
    }

    fn external_key(external_id: &str) -> Vec<u8> {
        format!("records/external/{external_id}").into_bytes()
    }

    fn ordered_key(prefix: &str, nanos: u64, id: &RecordId) -> Vec<u8> {
        format!(
            "{prefix}{nanos:0width$}/{:0>width$}",
            id.0,
            width = KEY_WIDTH
        )
        .into_bytes()
    }

    fn counter_prefix(window: &WindowKey) -> Vec<u8> {
        format!("{COUNTER_PREFIX}{}/", window.0).into_bytes()
    }

    fn counter_key(tag: &str, window: &WindowKey) -> Vec<u8> {
        format!("{COUNTER_PREFIX}{}/{tag}", window.0).into_bytes()
    }

    fn job_key(id: &JobId) -> Vec<u8> {
        format!("jobs/data/{}", id.0).into_bytes()
    }

    fn job_order_key(seq: u64) -> Vec<u8> {
        format!("{JOB_ORDER_PREFIX}{seq:0width$}", width = KEY_WIDTH).into_bytes()
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(value, self.codec)
            .map_err(StorageError::from)
            .map_err(Into::into)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        bincode::serde::decode_from_slice(bytes, self.codec)
            .map(|(v, _)| v)
            .map_err(StorageError::from)
            .map_err(Into::into)
    }

    fn decode_count(key: &[u8], bytes: &[u8]) -> Result<u64> {
        let raw: [u8; 8] = bytes.try_into().map_err(|_| {
            StorageError::Corrupt(String::from_utf8_lossy(key).into_owned())
        })?;
        Ok(u64::from_be_bytes(raw))
    }

    fn id_from_value(value: &IVec) -> Result<RecordId> {
        let s = std::str::from_utf8(value.as_ref()).map_err(StorageError::from)?;
        Ok(RecordId::new(s))
    }

    fn flush_if_needed(&self) -> Result<()> {
        if self.flush_on_write {
            self.db.flush().map_err(StorageError::from)?;
        }
        Ok(())
    }

    fn load_record(&self, id: &RecordId) -> Result<Option<Record>> {
        match self.db.get(Self::record_key(id)).map_err(StorageError::from)? {
            Some(bytes) => self.decode(bytes.as_ref()).map(Some),
            None => Ok(None),
        }
    }

    /// Compare-and-swap loop over one record. `apply` returns `false` to leave the
    /// stored value untouched; the return value says whether this call wrote it.
    fn modify_record<F>(&self, id: &RecordId, mut apply: F) -> Result<(bool, Record)>
    where
        F: FnMut(&mut Record) -> bool,
    {
        let key = Self::record_key(id);
        loop {
            let current = self
                .db
                .get(&key)
                .map_err(StorageError::from)?
                .ok_or_else(|| HashflowError::NotFound(format!("record {id}")))?;
            let mut record: Record = self.decode(current.as_ref())?;
            if !apply(&mut record) {
                return Ok((false, record));
            }
            let next = self.encode(&record)?;
            let swapped = self
                .db
                .compare_and_swap(&key, Some(current), Some(next))
                .map_err(StorageError::from)?;
            if swapped.is_ok() {
                return Ok((true, record));
            }
        }
    }

    /// Compare-and-swap loop over one job record.
    fn modify_job<F>(&self, id: &JobId, mut apply: F) -> Result<JobRecord>
    where
        F: FnMut(&mut JobRecord) -> Result<()>,
    {
        let key = Self::job_key(id);
        loop {
            let current = self
                .db
                .get(&key)
                .map_err(StorageError::from)?
                .ok_or_else(|| HashflowError::NotFound(format!("job {id}")))?;
            let mut job: JobRecord = self.decode(current.as_ref())?;
            apply(&mut job)?;
            let next = self.encode(&job)?;
            let swapped = self
                .db
                .compare_and_swap(&key, Some(current), Some(next))
                .map_err(StorageError::from)?;
            if swapped.is_ok() {
                self.flush_if_needed()?;
                return Ok(job);
            }
        }
    }

    fn parse_counter_key(key: &[u8]) -> Result<(WindowKey, String)> {
        let s = std::str::from_utf8(key).map_err(StorageError::from)?;
        s.strip_prefix(COUNTER_PREFIX)
            .and_then(|rest| rest.split_once('/'))
            .map(|(window, tag)| (WindowKey::new(window), tag.to_string()))
            .ok_or_else(|| StorageError::Corrupt(s.to_string()).into())
    }
}

impl RecordStore for SledStore {
    fn insert_record(&self, new_record: NewRecord, created_at: Timestamp) -> Result<Record> {
        new_record.validate()?;
        let nanos = created_at.unix_nanos()?;
        let seq = self.db.generate_id().map_err(StorageError::from)?;
        let id = RecordId::new(seq.to_string());
        let record = Record::from_new(id.clone(), new_record, created_at);

        let external_key = Self::external_key(&record.external_id.0);
        let data_key = Self::record_key(&id);
        let pending_key = Self::ordered_key(PENDING_PREFIX, nanos, &id);
        let created_key = Self::ordered_key(CREATED_PREFIX, nanos, &id);
        let bytes = self.encode(&record)?;
        let id_bytes = id.0.as_bytes();

        let committed: std::result::Result<(), TransactionError<()>> =
            self.db.transaction(|tx| {
                if tx.get(external_key.as_slice())?.is_some() {
                    return Err(ConflictableTransactionError::Abort(()));
                }
                tx.insert(external_key.as_slice(), id_bytes)?;
                tx.insert(data_key.as_slice(), bytes.as_slice())?;
                tx.insert(pending_key.as_slice(), id_bytes)?;
                tx.insert(created_key.as_slice(), id_bytes)?;
                Ok(())
            });
        match committed {
            Ok(()) => {}
            Err(TransactionError::Abort(())) => {
                return Err(HashflowError::Conflict(format!(
                    "external id {} already exists",
                    record.external_id
                )))
            }
            Err(TransactionError::Storage(err)) => return Err(StorageError::from(err).into()),
        }
        self.flush_if_needed()?;
        Ok(record)
    }

    fn fetch_unprocessed(&self, limit: usize) -> Result<Vec<Record>> {
        let mut out = Vec::with_capacity(limit.min(1024));
        if limit == 0 {
            return Ok(out);
        }
        for entry in self.db.scan_prefix(PENDING_PREFIX) {
            let (key, value) = entry.map_err(StorageError::from)?;
            let id = Self::id_from_value(&value)?;
            match self.load_record(&id)? {
                Some(record) if !record.processed => out.push(record),
                // flag flipped but index entry left behind
                Some(_) | None => {
                    self.db.remove(key).map_err(StorageError::from)?;
                }
            }
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }

    fn update_tags(&self, id: &RecordId, tags: &[String]) -> Result<()> {
        self.modify_record(id, |record| {
            if record.tags == tags {
                return false;
            }
            record.tags = tags.to_vec();
            true
        })?;
        self.flush_if_needed()
    }

    fn mark_processed(&self, id: &RecordId) -> Result<bool> {
        let (claimed, record) = self.modify_record(id, |record| {
            if record.processed {
                return false;
            }
            record.processed = true;
            true
        })?;
        if claimed {
            let nanos = record.created_at.unix_nanos()?;
            self.db
                .remove(Self::ordered_key(PENDING_PREFIX, nanos, id))
                .map_err(StorageError::from)?;
            self.flush_if_needed()?;
        }
        Ok(claimed)
    }

    fn get_record(&self, id: &RecordId) -> Result<Option<Record>> {
        self.load_record(id)
    }

    fn recent_records(&self, limit: usize) -> Result<Vec<Record>> {
        let mut out = Vec::new();
        for entry in self.db.scan_prefix(CREATED_PREFIX).rev().take(limit) {
            let (_, value) = entry.map_err(StorageError::from)?;
            if let Some(record) = self.load_record(&Self::id_from_value(&value)?)? {
                out.push(record);
            }
        }
        Ok(out)
    }
}

impl CounterStore for SledStore {
    fn create_counter(&self, tag: &str, window: &WindowKey, count: u64) -> Result<()> {
        let swapped = self
            .db
            .compare_and_swap(
                Self::counter_key(tag, window),
                None as Option<&[u8]>,
                Some(count.to_be_bytes().to_vec()),
            )
            .map_err(StorageError::from)?;
        if swapped.is_err() {
            return Err(HashflowError::Conflict(format!("counter {tag}@{window}")));
        }
        self.flush_if_needed()
    }

    fn read_counter(&self, tag: &str, window: &WindowKey) -> Result<u64> {
        let key = Self::counter_key(tag, window);
        match self.db.get(&key).map_err(StorageError::from)? {
            Some(bytes) => Self::decode_count(&key, bytes.as_ref()),
            None => Err(HashflowError::NotFound(format!("counter {tag}@{window}"))),
        }
    }

    fn update_counter(&self, tag: &str, window: &WindowKey, count: u64) -> Result<()> {
        let key = Self::counter_key(tag, window);
        loop {
            let current = self
                .db
                .get(&key)
                .map_err(StorageError::from)?
                .ok_or_else(|| HashflowError::NotFound(format!("counter {tag}@{window}")))?;
            let swapped = self
                .db
                .compare_and_swap(&key, Some(current), Some(count.to_be_bytes().to_vec()))
                .map_err(StorageError::from)?;
            if swapped.is_ok() {
                return self.flush_if_needed();
            }
        }
    }

    /// Atomic insert-or-add through sled's compare-and-swap loop.
    fn upsert_add(&self, tag: &str, window: &WindowKey, delta: u64) -> Result<(u64, MergeOutcome)> {
        let key = Self::counter_key(tag, window);
        loop {
            let current = self.db.get(&key).map_err(StorageError::from)?;
            let (next, outcome) = match &current {
                Some(bytes) => (
                    Self::decode_count(&key, bytes.as_ref())?.saturating_add(delta),
                    MergeOutcome::Incremented,
                ),
                None => (delta, MergeOutcome::Created),
            };
            let swapped = self
                .db
                .compare_and_swap(&key, current, Some(next.to_be_bytes().to_vec()))
                .map_err(StorageError::from)?;
            if swapped.is_ok() {
                self.flush_if_needed()?;
                return Ok((next, outcome));
            }
        }
    }

    fn top_counters(&self, window: Option<&WindowKey>, limit: usize) -> Result<Vec<WindowCounter>> {
        let prefix = match window {
            Some(w) => Self::counter_prefix(w),
            None => COUNTER_PREFIX.as_bytes().to_vec(),
        };
        let mut out = Vec::new();
        for entry in self.db.scan_prefix(prefix) {
            let (key, value) = entry.map_err(StorageError::from)?;
            let (window, tag) = Self::parse_counter_key(key.as_ref())?;
            out.push(WindowCounter {
                tag,
                window,
                count: Self::decode_count(key.as_ref(), value.as_ref())?,
            });
        }
        out.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| a.tag.cmp(&b.tag))
                .then_with(|| b.window.cmp(&a.window))
        });
        out.truncate(limit);
        Ok(out)
    }
}

impl JobStore for SledStore {
    fn create_job(&self, kind: &str, started_at: Timestamp) -> Result<JobRecord> {
        let id = JobId::new(Uuid::new_v4().to_string());
        let job = JobRecord::start(id.clone(), kind, started_at);
        let seq = self.db.generate_id().map_err(StorageError::from)?;
        self.db
            .insert(Self::job_key(&id), self.encode(&job)?)
            .map_err(StorageError::from)?;
        self.db
            .insert(Self::job_order_key(seq), id.0.as_bytes())
            .map_err(StorageError::from)?;
        self.flush_if_needed()?;
        Ok(job)
    }

    fn complete_job(
        &self,
        id: &JobId,
        records_processed: u64,
        tags_extracted: u64,
        completed_at: Timestamp,
    ) -> Result<JobRecord> {
        self.modify_job(id, |job| {
            job.complete(records_processed, tags_extracted, completed_at.clone())
                .map_err(Into::into)
        })
    }

    fn fail_job(&self, id: &JobId, message: &str, completed_at: Timestamp) -> Result<JobRecord> {
        self.modify_job(id, |job| {
            job.fail(message, completed_at.clone()).map_err(Into::into)
        })
    }

    fn get_job(&self, id: &JobId) -> Result<Option<JobRecord>> {
        match self.db.get(Self::job_key(id)).map_err(StorageError::from)? {
            Some(bytes) => self.decode(bytes.as_ref()).map(Some),
            None => Ok(None),
        }
    }

    fn recent_jobs(&self, limit: usize) -> Result<Vec<JobRecord>> {
        let mut out = Vec::new();
        for entry in self.db.scan_prefix(JOB_ORDER_PREFIX).rev().take(limit) {
            let (_, value) = entry.map_err(StorageError::from)?;
            let id = std::str::from_utf8(value.as_ref()).map_err(StorageError::from)?;
            if let Some(job) = self.get_job(&JobId::new(id))? {
                out.push(job);
            }
        }
        Ok(out)
    }
}
