//! Core data model for Hashflow.
//!
//! Records are raw text units waiting to be aggregated, window counters hold the
//! per-hour running totals, and job records track each aggregation run. The pure
//! pieces of the pipeline (tag extraction and window resolution) live here too so
//! every other crate agrees on their exact output.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime, Time, UtcOffset};

/// Kind label written on every hashtag aggregation job.
pub const JOB_KIND_HASHTAGS: &str = "hashtag_processing";

/// Maximum body length of a record, in characters.
pub const MAX_BODY_CHARS: usize = 280;

static HASHTAG: OnceLock<Regex> = OnceLock::new();

fn hashtag_pattern() -> &'static Regex {
    HASHTAG.get_or_init(|| Regex::new(r"#([A-Za-z0-9_]+)").expect("hashtag pattern compiles"))
}

/// Extract normalized hashtags from free text.
///
/// Every `#` followed by one or more ASCII letters, digits, or underscores yields one
/// lower-cased tag without the leading `#`. Order and duplicates are preserved.
pub fn extract_tags(text: &str) -> Vec<String> {
    hashtag_pattern()
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str().to_ascii_lowercase())
        .collect()
}

/// Normalize a caller-supplied tag: optional leading `#`, then one or more ASCII
/// letters, digits, or underscores. Returns the lower-cased tag, or `None` when the
/// input is not a hashtag.
pub fn normalize_tag(raw: &str) -> Option<String> {
    let tag = raw.strip_prefix('#').unwrap_or(raw);
    if tag.is_empty() || !tag.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
        return None;
    }
    Some(tag.to_ascii_lowercase())
}

/// Resolve the aggregation window containing `at`: the start of its UTC hour.
pub fn window_key(at: OffsetDateTime) -> WindowKey {
    let utc = at.to_offset(UtcOffset::UTC);
    let start = utc.replace_time(Time::MIDNIGHT) + Duration::hours(utc.hour() as i64);
    WindowKey(format!(
        "{:04}-{:02}-{:02}T{:02}:00:00Z",
        start.year(),
        u8::from(start.month()),
        start.day(),
        start.hour()
    ))
}

/// Identifier assigned to a record by the store.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId(pub String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Caller-supplied key used to reject duplicate submissions.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalId(pub String);

impl ExternalId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Identifier for a job record.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Canonical start-of-hour key (`YYYY-MM-DDTHH:00:00Z`) used to bucket counters.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WindowKey(pub String);

impl WindowKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Window containing the given RFC 3339 timestamp.
    pub fn for_timestamp(ts: &Timestamp) -> Result<Self, TimestampError> {
        Ok(window_key(ts.parse()?))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum TimestampError {
    #[error("invalid timestamp {value}: {reason}")]
    Invalid { value: String, reason: String },
}

/// ISO-8601 UTC timestamp wrapper.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub String);

impl Timestamp {
    pub fn new(ts: impl Into<String>) -> Self {
        Self(ts.into())
    }

    /// RFC 3339 rendering of `dt` in UTC. Fails for years outside 0..=9999.
    pub fn from_datetime(dt: OffsetDateTime) -> Result<Self, TimestampError> {
        let utc = dt.to_offset(UtcOffset::UTC);
        utc.format(&Rfc3339)
            .map(Self)
            .map_err(|e| TimestampError::Invalid {
                value: utc.to_string(),
                reason: e.to_string(),
            })
    }

    pub fn parse(&self) -> Result<OffsetDateTime, TimestampError> {
        OffsetDateTime::parse(&self.0, &Rfc3339).map_err(|e| TimestampError::Invalid {
            value: self.0.clone(),
            reason: e.to_string(),
        })
    }

    /// Nanoseconds since the unix epoch, clamped at zero; used for ordered storage keys.
    pub fn unix_nanos(&self) -> Result<u64, TimestampError> {
        let nanos = self.parse()?.unix_timestamp_nanos();
        Ok(nanos.clamp(0, u64::MAX as i128) as u64)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum RecordError {
    #[error("author must not be empty")]
    EmptyAuthor,
    #[error("body must not be empty")]
    EmptyBody,
    #[error("body exceeds {max} characters (got {len})")]
    BodyTooLong { len: usize, max: usize },
    #[error("invalid tag {0:?}: expected letters, digits or underscores")]
    InvalidTag(String),
}

/// Payload submitted by the ingestion side.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewRecord {
    pub external_id: ExternalId,
    pub author: String,
    pub body: String,
    /// Explicit tags; when absent they are extracted from `body` at insert time.
    #[serde(default)]
    pub tags: Option<Vec<String>>,
}

impl NewRecord {
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.author.trim().is_empty() {
            return Err(RecordError::EmptyAuthor);
        }
        if self.body.trim().is_empty() {
            return Err(RecordError::EmptyBody);
        }
        let len = self.body.chars().count();
        if len > MAX_BODY_CHARS {
            return Err(RecordError::BodyTooLong {
                len,
                max: MAX_BODY_CHARS,
            });
        }
        if let Some(bad) = self
            .tags
            .iter()
            .flatten()
            .find(|tag| normalize_tag(tag).is_none())
        {
            return Err(RecordError::InvalidTag(bad.clone()));
        }
        Ok(())
    }
}

/// Raw input unit consumed by the aggregation job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub external_id: ExternalId,
    pub author: String,
    pub body: String,
    pub created_at: Timestamp,
    pub tags: Vec<String>,
    pub processed: bool,
}

impl Record {
    /// Materialize a validated submission; `processed` always starts false.
    /// Explicit tags are normalized the same way extracted ones are.
    pub fn from_new(id: RecordId, new_record: NewRecord, created_at: Timestamp) -> Self {
        let tags = match new_record.tags {
            Some(tags) => tags.iter().filter_map(|t| normalize_tag(t)).collect(),
            None => extract_tags(&new_record.body),
        };
        Self {
            id,
            external_id: new_record.external_id,
            author: new_record.author,
            body: new_record.body,
            created_at,
            tags,
            processed: false,
        }
    }
}

/// Persisted running total for a (tag, window) pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowCounter {
    pub tag: String,
    pub window: WindowKey,
    pub count: u64,
}

/// Lifecycle state of a job record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Running)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("job {job_id} is already {status}; cannot move to {target}")]
pub struct TransitionError {
    pub job_id: JobId,
    pub status: JobStatus,
    pub target: JobStatus,
}

/// Observability record for one aggregation run.
///
/// The only transitions are `running -> completed` and `running -> failed`; the error
/// message is present exactly when the job failed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    id: JobId,
    kind: String,
    status: JobStatus,
    records_processed: u64,
    tags_extracted: u64,
    error_message: Option<String>,
    started_at: Timestamp,
    completed_at: Option<Timestamp>,
}

impl JobRecord {
    pub fn start(id: JobId, kind: impl Into<String>, started_at: Timestamp) -> Self {
        Self {
            id,
            kind: kind.into(),
            status: JobStatus::Running,
            records_processed: 0,
            tags_extracted: 0,
            error_message: None,
            started_at,
            completed_at: None,
        }
    }

    fn ensure_running(&self, target: JobStatus) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(TransitionError {
                job_id: self.id.clone(),
                status: self.status,
                target,
            });
        }
        Ok(())
    }

    pub fn complete(
        &mut self,
        records_processed: u64,
        tags_extracted: u64,
        completed_at: Timestamp,
    ) -> Result<(), TransitionError> {
        self.ensure_running(JobStatus::Completed)?;
        self.status = JobStatus::Completed;
        self.records_processed = records_processed;
        self.tags_extracted = tags_extracted;
        self.completed_at = Some(completed_at);
        Ok(())
    }

    pub fn fail(
        &mut self,
        message: impl Into<String>,
        completed_at: Timestamp,
    ) -> Result<(), TransitionError> {
        self.ensure_running(JobStatus::Failed)?;
        let mut message = message.into();
        if message.trim().is_empty() {
            message = "job failed".into();
        }
        self.status = JobStatus::Failed;
        self.error_message = Some(message);
        self.completed_at = Some(completed_at);
        Ok(())
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn records_processed(&self) -> u64 {
        self.records_processed
    }

    pub fn tags_extracted(&self) -> u64 {
        self.tags_extracted
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn started_at(&self) -> &Timestamp {
        &self.started_at
    }

    pub fn completed_at(&self) -> Option<&Timestamp> {
        self.completed_at.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn extracts_lowercased_tags_in_order_with_duplicates() {
        assert_eq!(
            extract_tags("Loving #BigData and #AI #AI"),
            vec!["bigdata", "ai", "ai"]
        );
    }

    #[test]
    fn extraction_edge_cases() {
        assert!(extract_tags("").is_empty());
        assert!(extract_tags("no tags here").is_empty());
        assert!(extract_tags("# lonely hash").is_empty());
        assert_eq!(extract_tags("##double"), vec!["double"]);
        assert_eq!(extract_tags("snake#case_Tag_1!"), vec!["case_tag_1"]);
        // non-ASCII letters terminate the tag
        assert_eq!(extract_tags("#café"), vec!["caf"]);
    }

    #[test]
    fn same_hour_resolves_to_identical_key() {
        let a = window_key(datetime!(2024-03-10 14:00:00 UTC));
        let b = window_key(datetime!(2024-03-10 14:59:59.999 UTC));
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "2024-03-10T14:00:00Z");
    }

    #[test]
    fn adjacent_hours_differ() {
        let a = window_key(datetime!(2024-03-10 14:59:59 UTC));
        let b = window_key(datetime!(2024-03-10 15:00:00 UTC));
        assert_ne!(a, b);
    }

    #[test]
    fn window_key_normalizes_offsets_to_utc() {
        let local = window_key(datetime!(2024-03-10 16:30:00 +02:00));
        assert_eq!(local.as_str(), "2024-03-10T14:00:00Z");
    }

    #[test]
    fn window_key_from_timestamp_string() {
        let key = WindowKey::for_timestamp(&Timestamp::new("2024-12-31T23:45:10.5Z")).unwrap();
        assert_eq!(key.as_str(), "2024-12-31T23:00:00Z");
        assert!(WindowKey::for_timestamp(&Timestamp::new("yesterday")).is_err());
    }

    #[test]
    fn new_record_validation() {
        let mut new_record = NewRecord {
            external_id: ExternalId::new("t-1"),
            author: "dev".into(),
            body: "hello #world".into(),
            tags: None,
        };
        assert!(new_record.validate().is_ok());

        new_record.body = "x".repeat(MAX_BODY_CHARS + 1);
        assert_eq!(
            new_record.validate(),
            Err(RecordError::BodyTooLong {
                len: MAX_BODY_CHARS + 1,
                max: MAX_BODY_CHARS
            })
        );

        new_record.body = "   ".into();
        assert_eq!(new_record.validate(), Err(RecordError::EmptyBody));

        new_record.author = String::new();
        assert_eq!(new_record.validate(), Err(RecordError::EmptyAuthor));
    }

    #[test]
    fn record_from_new_extracts_missing_tags() {
        let record = Record::from_new(
            RecordId::new("r1"),
            NewRecord {
                external_id: ExternalId::new("t-1"),
                author: "dev".into(),
                body: "Go #Rust".into(),
                tags: None,
            },
            Timestamp::new("2024-01-01T00:00:00Z"),
        );
        assert_eq!(record.tags, vec!["rust"]);
        assert!(!record.processed);

        let explicit = Record::from_new(
            RecordId::new("r2"),
            NewRecord {
                external_id: ExternalId::new("t-2"),
                author: "dev".into(),
                body: "Go #Rust".into(),
                tags: Some(Vec::new()),
            },
            Timestamp::new("2024-01-01T00:00:00Z"),
        );
        assert!(explicit.tags.is_empty());
    }

    #[test]
    fn normalize_tag_accepts_hashtag_spellings() {
        assert_eq!(normalize_tag("AI").as_deref(), Some("ai"));
        assert_eq!(normalize_tag("#Big_Data2").as_deref(), Some("big_data2"));
        assert_eq!(normalize_tag(""), None);
        assert_eq!(normalize_tag("#"), None);
        assert_eq!(normalize_tag("##ai"), None);
        assert_eq!(normalize_tag("two words"), None);
        assert_eq!(normalize_tag("café"), None);
    }

    #[test]
    fn explicit_tags_are_validated_and_normalized() {
        let mut new_record = NewRecord {
            external_id: ExternalId::new("t-1"),
            author: "dev".into(),
            body: "hi #AI".into(),
            tags: Some(vec!["AI".into(), "#AI".into(), "".into()]),
        };
        assert_eq!(
            new_record.validate(),
            Err(RecordError::InvalidTag(String::new()))
        );

        new_record.tags = Some(vec!["AI".into(), "#AI".into(), "MachineLearning".into()]);
        assert!(new_record.validate().is_ok());
        let record = Record::from_new(
            RecordId::new("r1"),
            new_record,
            Timestamp::new("2024-01-01T00:00:00Z"),
        );
        assert_eq!(record.tags, vec!["ai", "ai", "machinelearning"]);
    }

    #[test]
    fn timestamp_from_datetime_formats_utc() {
        let ts = Timestamp::from_datetime(datetime!(2024-03-10 16:30:00 +02:00)).unwrap();
        assert_eq!(ts.0, "2024-03-10T14:30:00Z");

        let before_year_zero = OffsetDateTime::UNIX_EPOCH.replace_year(-1).unwrap();
        assert!(matches!(
            Timestamp::from_datetime(before_year_zero),
            Err(TimestampError::Invalid { .. })
        ));
    }

    #[test]
    fn job_lifecycle_allows_exactly_one_terminal_transition() {
        let ts = Timestamp::new("2024-01-01T00:00:00Z");
        let mut job = JobRecord::start(JobId::new("j1"), JOB_KIND_HASHTAGS, ts.clone());
        assert_eq!(job.status(), JobStatus::Running);
        assert!(job.completed_at().is_none());

        job.complete(2, 5, ts.clone()).unwrap();
        assert_eq!(job.status(), JobStatus::Completed);
        assert_eq!(job.records_processed(), 2);
        assert_eq!(job.tags_extracted(), 5);
        assert!(job.error_message().is_none());

        let err = job.fail("late", ts.clone()).unwrap_err();
        assert_eq!(err.status, JobStatus::Completed);
        assert_eq!(err.target, JobStatus::Failed);
        assert!(job.complete(9, 9, ts).is_err());
        assert_eq!(job.records_processed(), 2);
    }

    #[test]
    fn failed_job_always_carries_a_message() {
        let ts = Timestamp::new("2024-01-01T00:00:00Z");
        let mut job = JobRecord::start(JobId::new("j1"), JOB_KIND_HASHTAGS, ts.clone());
        job.fail("", ts).unwrap();
        assert_eq!(job.status(), JobStatus::Failed);
        assert_eq!(job.error_message(), Some("job failed"));
        assert!(job.completed_at().is_some());
    }

    #[test]
    fn job_status_serde_names_are_stable() {
        let statuses = [
            (JobStatus::Running, "running"),
            (JobStatus::Completed, "completed"),
            (JobStatus::Failed, "failed"),
        ];

        for (status, expected) in statuses {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{expected}\""));
            assert_eq!(status.to_string(), expected);
        }
    }
}
