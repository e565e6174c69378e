//! Job records, their event log, and the registry that schedules jobs.

pub mod record;
pub mod registry;

pub use record::{
    JobEvent, JobItem, JobKind, JobRecord, JobStatus, JobSummary, JobWriter, LIFECYCLE_TAG,
    SearchSummary, Severity, Stage,
};
pub use registry::{JobRegistry, JobRequest, JobService};
