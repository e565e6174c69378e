//! HTTP surface of the pipeline console.
//!
//! This module exposes a compact Axum router over the job orchestrator:
//!
//! - `POST /ingest` – Start (or join) the ingest job. Accepts an optional `root_path` (a leading
//!   `~` and `${HOME}` are expanded) and an optional caller `context`.
//! - `GET /ingest?job_id=` – Poll an ingest job.
//! - `POST /self-test` – Start (or join) the self-test. Accepts an optional caller `context`.
//! - `GET /self-test?run_id=` – Poll a self-test run.
//! - `GET /metrics` – Job counters since startup.
//! - `GET /commands` – Machine-readable command catalog for quick discovery by tools/hosts,
//!   tagged with the stage output protocol version the console parses.
//!
//! Start requests return immediately with the job snapshot; callers poll until `status` is
//! `pass` or `fail`.

use crate::context::{ContextError, UserContext};
use crate::jobs::{JobKind, JobRecord, JobRequest, JobService};
use crate::metrics::MetricsSnapshot;
use crate::pipeline::PROTOCOL_VERSION;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

/// Build the HTTP router exposing the job API surface.
pub fn create_router<S>(service: Arc<S>) -> Router
where
    S: JobService + 'static,
{
    Router::new()
        .route("/ingest", get(get_ingest::<S>).post(start_ingest::<S>))
        .route("/self-test", get(get_self_test::<S>).post(start_self_test::<S>))
        .route("/metrics", get(get_metrics::<S>))
        .route("/commands", get(get_commands))
        .with_state(service)
}

/// Caller identity as supplied over HTTP; absent fields take the console defaults.
#[derive(Deserialize, Default)]
struct ContextPayload {
    #[serde(default)]
    actor: Option<String>,
    #[serde(default)]
    roles: Option<Vec<String>>,
    #[serde(default)]
    classification: Option<String>,
}

impl ContextPayload {
    fn resolve(self) -> Result<UserContext, ContextError> {
        let defaults = UserContext::default();
        UserContext::new(
            self.actor.unwrap_or_else(|| defaults.actor().to_string()),
            self.roles.unwrap_or_else(|| defaults.roles().to_vec()),
            self.classification
                .unwrap_or_else(|| defaults.classification().to_string()),
        )
    }
}

/// Request body for `POST /ingest`.
#[derive(Deserialize, Default)]
struct IngestPayload {
    /// Discovery root; the configured default when absent or blank.
    #[serde(default)]
    root_path: Option<String>,
    #[serde(default)]
    context: Option<ContextPayload>,
}

/// Request body for `POST /self-test`.
#[derive(Deserialize, Default)]
struct SelfTestPayload {
    #[serde(default)]
    context: Option<ContextPayload>,
}

#[derive(Deserialize)]
struct IngestQuery {
    #[serde(default)]
    job_id: Option<String>,
}

#[derive(Deserialize)]
struct SelfTestQuery {
    #[serde(default)]
    run_id: Option<String>,
}

/// Start the ingest job, or join the one already running.
async fn start_ingest<S>(
    State(service): State<Arc<S>>,
    body: Bytes,
) -> Result<Json<JobRecord>, AppError>
where
    S: JobService,
{
    let payload: IngestPayload = parse_body(&body)?;
    let home = std::env::var("HOME").ok();
    let root = payload
        .root_path
        .filter(|raw| !raw.trim().is_empty())
        .map(|raw| expand_root(&raw, home.as_deref()));
    let context = payload.context.unwrap_or_default().resolve()?;
    let record = service.start(JobRequest::ingest(root, context));
    tracing::info!(job_id = %record.id, root = %record.root.display(), "Ingest request accepted");
    Ok(Json(record))
}

/// Poll an ingest job.
async fn get_ingest<S>(
    State(service): State<Arc<S>>,
    Query(query): Query<IngestQuery>,
) -> Result<Json<JobRecord>, AppError>
where
    S: JobService,
{
    lookup(&*service, JobKind::Ingest, query.job_id, "job_id").map(Json)
}

/// Start the self-test, or join the run already in progress.
async fn start_self_test<S>(
    State(service): State<Arc<S>>,
    body: Bytes,
) -> Result<Json<JobRecord>, AppError>
where
    S: JobService,
{
    let payload: SelfTestPayload = parse_body(&body)?;
    let context = payload.context.unwrap_or_default().resolve()?;
    let record = service.start(JobRequest::self_test(context));
    tracing::info!(run_id = %record.id, "Self-test request accepted");
    Ok(Json(record))
}

/// Poll a self-test run.
async fn get_self_test<S>(
    State(service): State<Arc<S>>,
    Query(query): Query<SelfTestQuery>,
) -> Result<Json<JobRecord>, AppError>
where
    S: JobService,
{
    lookup(&*service, JobKind::SelfTest, query.run_id, "run_id").map(Json)
}

/// Return job counters.
async fn get_metrics<S>(State(service): State<Arc<S>>) -> Json<MetricsSnapshot>
where
    S: JobService,
{
    Json(service.metrics_snapshot())
}

fn lookup<S>(
    service: &S,
    kind: JobKind,
    raw_id: Option<String>,
    param: &'static str,
) -> Result<JobRecord, AppError>
where
    S: JobService + ?Sized,
{
    let raw_id = raw_id
        .filter(|value| !value.trim().is_empty())
        .ok_or(AppError::MissingParameter(param))?;
    Uuid::parse_str(raw_id.trim())
        .ok()
        .and_then(|id| service.get(id))
        .filter(|record| record.kind == kind)
        .ok_or(AppError::NotFound(param))
}

fn parse_body<T>(body: &[u8]) -> Result<T, AppError>
where
    T: DeserializeOwned + Default,
{
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|error| AppError::InvalidBody(error.to_string()))
}

/// Expand a leading `~` and any `${HOME}` in a caller-supplied root.
fn expand_root(raw: &str, home: Option<&str>) -> PathBuf {
    let raw = raw.trim();
    let Some(home) = home else {
        return PathBuf::from(raw);
    };
    let expanded = raw.replace("${HOME}", home);
    if expanded == "~" {
        return PathBuf::from(home);
    }
    match expanded.strip_prefix("~/") {
        Some(rest) => PathBuf::from(home).join(rest),
        None => PathBuf::from(expanded),
    }
}

/// Descriptor for a single command in the discovery catalog.
#[derive(serde::Serialize)]
struct CommandDescriptor {
    name: &'static str,
    method: &'static str,
    path: &'static str,
    description: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_example: Option<serde_json::Value>,
}

/// Response body for `GET /commands`.
#[derive(serde::Serialize)]
struct CommandsResponse {
    protocol_version: u32,
    commands: Vec<CommandDescriptor>,
}

/// Enumerate supported HTTP commands for discovery/UX in hosts and tools.
async fn get_commands() -> Json<CommandsResponse> {
    let context = json!({
        "actor": "analyst",
        "roles": ["ENGINEER", "AUDITOR"],
        "classification": "RESTRICTED"
    });
    Json(CommandsResponse {
        protocol_version: PROTOCOL_VERSION,
        commands: vec![
            CommandDescriptor {
                name: "start_ingest",
                method: "POST",
                path: "/ingest",
                description: "Discover, ingest, chunk and index every allowed file under root_path. Returns the job record; joins the running ingest job if there is one.",
                request_example: Some(json!({
                    "root_path": "~/documents",
                    "context": context.clone()
                })),
            },
            CommandDescriptor {
                name: "get_ingest",
                method: "GET",
                path: "/ingest?job_id={id}",
                description: "Return the ingest job record: status, current_stage, events, items and summary.",
                request_example: None,
            },
            CommandDescriptor {
                name: "start_self_test",
                method: "POST",
                path: "/self-test",
                description: "Bootstrap, ingest the fixture set, index it and run the validation query. Returns the run record.",
                request_example: Some(json!({ "context": context })),
            },
            CommandDescriptor {
                name: "get_self_test",
                method: "GET",
                path: "/self-test?run_id={id}",
                description: "Return the self-test run record, including the search summary once available.",
                request_example: None,
            },
            CommandDescriptor {
                name: "metrics",
                method: "GET",
                path: "/metrics",
                description: "Return job counters (started, joined, passed, failed, running).",
                request_example: None,
            },
        ],
    })
}

enum AppError {
    MissingParameter(&'static str),
    NotFound(&'static str),
    InvalidBody(String),
    InvalidContext(ContextError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::MissingParameter(param) => (StatusCode::BAD_REQUEST, format!("{param} required")),
            Self::NotFound(param) => (StatusCode::NOT_FOUND, format!("{param} not found")),
            Self::InvalidBody(reason) => (
                StatusCode::BAD_REQUEST,
                format!("invalid request body: {reason}"),
            ),
            Self::InvalidContext(error) => (StatusCode::BAD_REQUEST, error.to_string()),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<ContextError> for AppError {
    fn from(inner: ContextError) -> Self {
        Self::InvalidContext(inner)
    }
}
