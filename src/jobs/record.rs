//! Job record, event log, and the writer lease used by the stage executor.

use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use time::OffsetDateTime;
use uuid::Uuid;

/// Workflow variant; determines the stage list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Ingest a caller-supplied root through chunking and both indexes.
    Ingest,
    /// Bootstrap, ingest the fixture set, and validate with a search.
    SelfTest,
}

const INGEST_STAGES: &[Stage] = &[
    Stage::Discovery,
    Stage::Ingestion,
    Stage::Chunking,
    Stage::TextIndexing,
    Stage::VectorIndexing,
];

const SELF_TEST_STAGES: &[Stage] = &[
    Stage::Bootstrap,
    Stage::Discovery,
    Stage::Ingestion,
    Stage::Chunking,
    Stage::TextIndexing,
    Stage::VectorIndexing,
    Stage::Search,
];

impl JobKind {
    /// Ordered stages executed for this kind.
    pub fn stages(self) -> &'static [Stage] {
        match self {
            Self::Ingest => INGEST_STAGES,
            Self::SelfTest => SELF_TEST_STAGES,
        }
    }

    /// Stable lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::SelfTest => "self_test",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Executable phase of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    /// Metadata schema bootstrap (self-test only).
    Bootstrap,
    /// Enumerate candidate input files.
    Discovery,
    /// Ingest each discovered file.
    Ingestion,
    /// Chunk each ingested artefact.
    Chunking,
    /// Rebuild the lexical index.
    TextIndexing,
    /// Rebuild the vector index.
    VectorIndexing,
    /// Validation query (self-test only).
    Search,
}

impl Stage {
    /// Name used in events, logs and invocation labels.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bootstrap => "BOOTSTRAP",
            Self::Discovery => "DISCOVERY",
            Self::Ingestion => "INGESTION",
            Self::Chunking => "CHUNKING",
            Self::TextIndexing => "TEXT_INDEXING",
            Self::VectorIndexing => "VECTOR_INDEXING",
            Self::Search => "SEARCH",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status; `Pass` and `Fail` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Stages are still executing.
    Running,
    /// Every stage completed.
    Pass,
    /// A stage raised a fatal error.
    Fail,
}

impl JobStatus {
    /// Whether the status can no longer change.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Progress notice.
    Info,
    /// Step succeeded.
    Ok,
    /// Recovered problem; the job continues.
    Warn,
    /// Fatal problem.
    Error,
}

impl Severity {
    /// Lowercase name, as serialized.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Ok => "ok",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Name carried by lifecycle events, which belong to no stage.
pub const LIFECYCLE_TAG: &str = "JOB";

/// Immutable entry of a job's audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobEvent {
    /// RFC 3339 UTC timestamp.
    pub ts: String,
    /// Stage the event belongs to; `None` for job lifecycle events (start, completion).
    #[serde(serialize_with = "serialize_event_stage")]
    pub stage: Option<Stage>,
    /// Severity.
    pub severity: Severity,
    /// Short message.
    pub message: String,
    /// Optional diagnostic detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl JobEvent {
    /// Stage name, or [`LIFECYCLE_TAG`] for lifecycle events.
    pub fn stage_name(&self) -> &'static str {
        self.stage.map_or(LIFECYCLE_TAG, Stage::as_str)
    }
}

fn serialize_event_stage<S>(stage: &Option<Stage>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(stage.map_or(LIFECYCLE_TAG, Stage::as_str))
}

/// Per-input-file result accumulated as ingestion and chunking progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobItem {
    /// Input file.
    pub path: PathBuf,
    /// Document identifier assigned by the console.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    /// Version identifier reported by ingestion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
    /// Artefact identifier reported by ingestion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artefact_id: Option<String>,
    /// Chunks created for this artefact, once known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_count: Option<u64>,
}

/// Aggregate counters populated when every stage succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobSummary {
    /// Number of ingested items.
    pub items: usize,
    /// Total chunks created.
    pub chunks: u64,
    /// Units indexed by the lexical index rebuild.
    pub indexed_text: u64,
    /// Units indexed by the vector index rebuild.
    pub indexed_vector: u64,
}

/// Outcome of the self-test validation query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchSummary {
    /// Query text.
    pub query: String,
    /// Correlation token emitted by the search program.
    pub query_id: String,
    /// Number of results returned.
    pub result_count: usize,
    /// Results evaluated by the access rules.
    pub evaluated: u64,
    /// Results allowed.
    pub allowed: u64,
    /// Results denied.
    pub denied: u64,
}

/// Mutable state and audit trail of one workflow execution.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    /// Unique identifier.
    pub id: Uuid,
    /// Workflow variant.
    pub kind: JobKind,
    /// Lifecycle status.
    pub status: JobStatus,
    /// Discovery root the job was started with.
    pub root: PathBuf,
    /// Stage in progress, or the last one attempted.
    pub current_stage: Option<Stage>,
    /// Creation timestamp.
    pub started_at: String,
    /// Terminal transition timestamp.
    pub finished_at: Option<String>,
    /// Append-only event log.
    pub events: Vec<JobEvent>,
    /// Append-only per-file results.
    pub items: Vec<JobItem>,
    /// Aggregate counters, present only on success.
    pub summary: Option<JobSummary>,
    /// Self-test search outcome.
    pub search: Option<SearchSummary>,
    /// First fatal error message.
    pub last_error: Option<String>,
}

impl JobRecord {
    pub(crate) fn new(kind: JobKind, root: PathBuf) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            status: JobStatus::Running,
            root,
            current_stage: None,
            started_at: now_rfc3339(),
            finished_at: None,
            events: Vec::new(),
            items: Vec::new(),
            summary: None,
            search: None,
            last_error: None,
        }
    }

    pub(crate) fn push_event(
        &mut self,
        stage: Option<Stage>,
        severity: Severity,
        message: impl Into<String>,
        detail: Option<String>,
    ) {
        self.events.push(JobEvent {
            ts: now_rfc3339(),
            stage,
            severity,
            message: message.into(),
            detail,
        });
    }

    /// Transition to `Pass`; ignored when the record is already terminal.
    pub(crate) fn finish_pass(&mut self, summary: JobSummary, search: Option<SearchSummary>) {
        if self.status.is_terminal() {
            return;
        }
        self.summary = Some(summary);
        self.search = search;
        self.status = JobStatus::Pass;
        self.finished_at = Some(now_rfc3339());
        let message = match self.kind {
            JobKind::Ingest => "Ingestion complete",
            JobKind::SelfTest => "Self-test passed",
        };
        self.push_event(None, Severity::Ok, message, None);
    }

    /// Transition to `Fail`; ignored when the record is already terminal.
    ///
    /// `stage` is the stage that raised the error, or `None` when the failure is not attributable
    /// to a single call; `current_stage` then keeps the last stage entered.
    pub(crate) fn finish_fail(&mut self, stage: Option<Stage>, error: String) {
        if self.status.is_terminal() {
            return;
        }
        self.status = JobStatus::Fail;
        let stage = stage.or(self.current_stage);
        self.current_stage = stage;
        self.finished_at = Some(now_rfc3339());
        self.push_event(stage, Severity::Error, "FAILED", Some(error.clone()));
        self.last_error = Some(error);
    }
}

pub(crate) type SharedRecord = Arc<RwLock<JobRecord>>;

/// Read a snapshot without ever blocking on a poisoned lock.
pub(crate) fn snapshot(record: &SharedRecord) -> JobRecord {
    record
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Exclusive writer lease on one job record.
///
/// Held by the task advancing the job; not cloneable. Every mutation takes the record lock only
/// for the duration of the change. Dropping a lease whose job is still running marks the job
/// failed, so a panicking task never leaves a record `running` forever.
pub struct JobWriter {
    record: SharedRecord,
    id: Uuid,
    kind: JobKind,
}

impl JobWriter {
    pub(crate) fn new(record: SharedRecord) -> Self {
        let (id, kind) = {
            let guard = record.read().unwrap_or_else(PoisonError::into_inner);
            (guard.id, guard.kind)
        };
        Self { record, id, kind }
    }

    fn update<R>(&self, change: impl FnOnce(&mut JobRecord) -> R) -> R {
        let mut guard = self.record.write().unwrap_or_else(PoisonError::into_inner);
        change(&mut guard)
    }

    /// Identifier of the job being advanced.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Kind of the job being advanced.
    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// Record the stage now in progress.
    pub fn enter_stage(&self, stage: Stage) {
        self.update(|record| record.current_stage = Some(stage));
    }

    /// Append one event.
    pub fn event(
        &self,
        stage: Stage,
        severity: Severity,
        message: impl Into<String>,
        detail: Option<String>,
    ) {
        let message = message.into();
        self.update(|record| record.push_event(Some(stage), severity, message, detail));
    }

    /// Append an item and return its position.
    pub fn push_item(&self, item: JobItem) -> usize {
        self.update(|record| {
            record.items.push(item);
            record.items.len() - 1
        })
    }

    /// Fill in the chunk count of an existing item.
    pub fn set_chunk_count(&self, index: usize, chunks: u64) {
        self.update(|record| {
            if let Some(item) = record.items.get_mut(index) {
                item.chunk_count = Some(chunks);
            }
        });
    }

    /// Snapshot of the items recorded so far.
    pub fn items(&self) -> Vec<JobItem> {
        self.update(|record| record.items.clone())
    }

    /// Mark the job passed.
    pub fn complete(&self, summary: JobSummary, search: Option<SearchSummary>) {
        self.update(|record| record.finish_pass(summary, search));
    }

    /// Mark the job failed at `stage`.
    pub fn fail(&self, stage: Stage, error: impl Into<String>) {
        let error = error.into();
        self.update(|record| record.finish_fail(Some(stage), error));
    }
}

impl Drop for JobWriter {
    fn drop(&mut self) {
        self.update(fail_abandoned);
    }
}

/// Message recorded when a job task ends without settling its record.
pub(crate) const ABANDONED_MESSAGE: &str = "job task terminated unexpectedly";

/// Fail a record that is still running; no-op once terminal.
pub(crate) fn fail_abandoned(record: &mut JobRecord) {
    record.finish_fail(None, ABANDONED_MESSAGE.to_string());
}

pub(crate) fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}
