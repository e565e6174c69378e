//! Stage executor: advances one job through the stage list of its kind.
//!
//! Stages run strictly in order and item-level work runs one process at a time, so the external
//! stores behind the stage programs never see concurrent pipeline calls from one job. The first
//! fatal error stops the job; everything recorded before it stays on the record.

use crate::config::Config;
use crate::context::JobEnvironment;
use crate::jobs::{
    JobItem, JobKind, JobStatus, JobSummary, JobWriter, SearchSummary, Severity, Stage,
};
use crate::pipeline::commands::{self, IngestProfile};
use crate::pipeline::discovery;
use crate::pipeline::error::StageError;
use crate::pipeline::protocol::{self, AuthoritySummary};
use crate::supervisor::{CommandOutput, Invocation, ProcessRunner};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Inputs of one job execution.
#[derive(Debug, Clone)]
pub struct JobPlan {
    /// Discovery root.
    pub root: PathBuf,
    /// Environment shared by every invocation of the job.
    pub env: Arc<JobEnvironment>,
}

/// Runs stage lists against a [`ProcessRunner`].
pub struct StageExecutor {
    config: Arc<Config>,
    runner: Arc<dyn ProcessRunner>,
}

impl StageExecutor {
    /// Build an executor over the given runner.
    pub fn new(config: Arc<Config>, runner: Arc<dyn ProcessRunner>) -> Self {
        Self { config, runner }
    }

    /// Execute every stage of the writer's job kind and settle the record.
    #[tracing::instrument(skip_all, fields(job_id = %writer.id(), kind = %writer.kind()))]
    pub async fn run(&self, plan: JobPlan, writer: JobWriter) -> JobStatus {
        let kind = writer.kind();
        let mut run = StageRun::new(self, &plan, &writer, kind);
        let job_started = Instant::now();

        for &stage in kind.stages() {
            writer.enter_stage(stage);
            let started = Instant::now();
            tracing::info!(phase = %stage, "Stage starting");
            if let Err(error) = run.execute(stage).await {
                let message = error.to_string();
                tracing::error!(
                    phase = %stage,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %message,
                    "Stage failed"
                );
                writer.fail(stage, message);
                return JobStatus::Fail;
            }
            tracing::info!(
                phase = %stage,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Stage done"
            );
        }

        let summary = run.summary();
        let search = run.search.take();
        writer.complete(summary, search);
        tracing::info!(
            elapsed_ms = job_started.elapsed().as_millis() as u64,
            items = summary.items,
            chunks = summary.chunks,
            "Job passed"
        );
        JobStatus::Pass
    }
}

/// Mutable state threaded from one stage to the next.
struct StageRun<'a> {
    executor: &'a StageExecutor,
    plan: &'a JobPlan,
    writer: &'a JobWriter,
    profile: IngestProfile,
    files: Vec<PathBuf>,
    chunks: u64,
    indexed_text: u64,
    indexed_vector: u64,
    search: Option<SearchSummary>,
}

impl<'a> StageRun<'a> {
    fn new(
        executor: &'a StageExecutor,
        plan: &'a JobPlan,
        writer: &'a JobWriter,
        kind: JobKind,
    ) -> Self {
        Self {
            executor,
            plan,
            writer,
            profile: IngestProfile::for_kind(kind),
            files: Vec::new(),
            chunks: 0,
            indexed_text: 0,
            indexed_vector: 0,
            search: None,
        }
    }

    async fn execute(&mut self, stage: Stage) -> Result<(), StageError> {
        match stage {
            Stage::Bootstrap => self.bootstrap().await,
            Stage::Discovery => self.discover(),
            Stage::Ingestion => self.ingest().await,
            Stage::Chunking => self.chunk().await,
            Stage::TextIndexing => {
                self.indexed_text = self
                    .rebuild_index(
                        stage,
                        commands::rebuild_text_index(),
                        "Rebuilding lexical index",
                        "Lexical index rebuilt",
                    )
                    .await?;
                Ok(())
            }
            Stage::VectorIndexing => {
                self.indexed_vector = self
                    .rebuild_index(
                        stage,
                        commands::rebuild_vector_index(),
                        "Rebuilding vector index",
                        "Vector index rebuilt",
                    )
                    .await?;
                Ok(())
            }
            Stage::Search => self.search().await,
        }
    }

    fn summary(&self) -> JobSummary {
        JobSummary {
            items: self.writer.items().len(),
            chunks: self.chunks,
            indexed_text: self.indexed_text,
            indexed_vector: self.indexed_vector,
        }
    }

    fn timeout_for(&self, stage: Stage) -> Duration {
        match stage {
            Stage::Bootstrap | Stage::Search => self.executor.config.default_timeout,
            _ => self.executor.config.ingest_timeout,
        }
    }

    async fn call(
        &self,
        stage: Stage,
        label: String,
        args: Vec<String>,
    ) -> Result<CommandOutput, StageError> {
        let config = &self.executor.config;
        let invocation = Invocation {
            program: config.interpreter.clone(),
            args,
            env: Arc::clone(&self.plan.env),
            working_dir: config.pipeline_root.clone(),
            timeout: self.timeout_for(stage),
            output_cap: config.max_output_bytes,
            label,
        };
        Ok(self.executor.runner.run(&invocation).await?)
    }

    fn info(&self, stage: Stage, message: impl Into<String>, detail: Option<String>) {
        self.writer.event(stage, Severity::Info, message, detail);
    }

    fn ok(&self, stage: Stage, message: impl Into<String>, detail: Option<String>) {
        self.writer.event(stage, Severity::Ok, message, detail);
    }

    fn warn(&self, stage: Stage, message: impl Into<String>, detail: Option<String>) {
        self.writer.event(stage, Severity::Warn, message, detail);
    }

    async fn bootstrap(&mut self) -> Result<(), StageError> {
        self.info(Stage::Bootstrap, "Bootstrapping metadata schema", None);
        self.call(
            Stage::Bootstrap,
            "BOOTSTRAP: metadata schema".to_string(),
            commands::bootstrap(),
        )
        .await?;
        self.ok(Stage::Bootstrap, "Metadata schema ready", None);
        Ok(())
    }

    fn discover(&mut self) -> Result<(), StageError> {
        let allowed = &self.executor.config.ingest_extensions;
        let found = discovery::discover(&self.plan.root, allowed)?;
        self.info(
            Stage::Discovery,
            format!(
                "Scanned {} file(s) under {}: accepted={} skipped={}",
                found.scanned,
                self.plan.root.display(),
                found.files.len(),
                found.skipped
            ),
            Some(format!("allowed={}", allowed.join(", "))),
        );
        self.ok(
            Stage::Discovery,
            format!("Discovered {} file(s)", found.files.len()),
            Some(join_paths(&found.files)),
        );
        self.files = found.files;
        Ok(())
    }

    async fn ingest(&mut self) -> Result<(), StageError> {
        self.info(
            Stage::Ingestion,
            format!("Ingesting {} file(s)", self.files.len()),
            Some(join_paths(&self.files)),
        );

        for (position, path) in self.files.iter().enumerate() {
            if !path.is_file() {
                let listing = discovery::nearest_listing(path, &self.plan.root);
                return Err(StageError::MissingInput {
                    path: path.clone(),
                    listing,
                });
            }

            let document_id = self.profile.document_id(self.writer.id(), position);
            let title = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            let output = self
                .call(
                    Stage::Ingestion,
                    format!("INGESTION: {title}"),
                    commands::ingest(&document_id, &title, path, &self.profile),
                )
                .await?;

            match protocol::parse_ingestion(&output.stdout) {
                Ok(result) => {
                    let detail = format!(
                        "document_id={} artefact_id={}",
                        result.document_id, result.artefact_id
                    );
                    self.writer.push_item(JobItem {
                        path: path.clone(),
                        document_id: Some(result.document_id),
                        version_id: Some(result.version_id),
                        artefact_id: Some(result.artefact_id),
                        chunk_count: None,
                    });
                    self.ok(Stage::Ingestion, format!("Ingested {title}"), Some(detail));
                }
                Err(error) => {
                    self.writer.push_item(JobItem {
                        path: path.clone(),
                        document_id: Some(document_id),
                        version_id: None,
                        artefact_id: None,
                        chunk_count: None,
                    });
                    self.warn(
                        Stage::Ingestion,
                        format!("Ingested {title} without identifiers; chunking will skip it"),
                        Some(error.to_string()),
                    );
                }
            }
        }
        Ok(())
    }

    async fn chunk(&mut self) -> Result<(), StageError> {
        let items = self.writer.items();
        let pending = items
            .iter()
            .filter(|item| item.artefact_id.is_some())
            .count();
        self.info(
            Stage::Chunking,
            format!("Chunking {pending} artefact(s)"),
            None,
        );

        for (index, item) in items.iter().enumerate() {
            let Some(artefact_id) = item.artefact_id.as_deref() else {
                continue;
            };
            let output = self
                .call(
                    Stage::Chunking,
                    format!("CHUNKING: {artefact_id}"),
                    commands::chunk(artefact_id),
                )
                .await?;
            let chunks = match protocol::parse_chunk_count(&output.stdout) {
                Ok(chunks) => {
                    self.ok(
                        Stage::Chunking,
                        format!("Chunked artefact {artefact_id}"),
                        Some(format!("chunks={chunks}")),
                    );
                    chunks
                }
                Err(error) => {
                    self.warn(
                        Stage::Chunking,
                        format!("Chunked artefact {artefact_id}; chunk count unreadable, recorded as 0"),
                        Some(error.to_string()),
                    );
                    0
                }
            };
            self.writer.set_chunk_count(index, chunks);
            self.chunks = self.chunks.saturating_add(chunks);
        }
        Ok(())
    }

    async fn rebuild_index(
        &self,
        stage: Stage,
        args: Vec<String>,
        starting: &str,
        finished: &str,
    ) -> Result<u64, StageError> {
        self.info(stage, starting, None);
        let output = self.call(stage, format!("{stage}: rebuild"), args).await?;
        let indexed = match protocol::parse_indexed_count(&output.stdout) {
            Ok(indexed) => indexed,
            Err(error) => {
                self.warn(
                    stage,
                    "Indexed count unreadable, recorded as 0",
                    Some(error.to_string()),
                );
                0
            }
        };
        self.ok(stage, finished, Some(format!("indexed={indexed}")));
        Ok(indexed)
    }

    async fn search(&mut self) -> Result<(), StageError> {
        let query = self.executor.config.self_test_query.clone();
        self.info(Stage::Search, format!("Running query: {query}"), None);
        let output = self
            .call(
                Stage::Search,
                format!("SEARCH: {query}"),
                commands::search(&query),
            )
            .await?;

        let (query_id, result_count, authority) = match protocol::parse_search(&output.stdout) {
            Ok(report) => {
                let authority = report.authority.unwrap_or_else(|| {
                    self.warn(
                        Stage::Search,
                        "No evaluation record matched the query; authority summary defaulted to zero",
                        Some(format!("query_id={}", report.query_id)),
                    );
                    AuthoritySummary::default()
                });
                (report.query_id, report.result_count, authority)
            }
            Err(error) => {
                self.warn(
                    Stage::Search,
                    "Search output unreadable; reporting an empty result",
                    Some(error.to_string()),
                );
                (String::new(), 0, AuthoritySummary::default())
            }
        };

        self.ok(
            Stage::Search,
            format!(
                "Authority evaluated: allowed={} denied={}",
                authority.allowed, authority.denied
            ),
            Some(format!("evaluated={}", authority.evaluated)),
        );
        self.ok(
            Stage::Search,
            format!("Search returned {result_count} results"),
            Some(format!("query_id={query_id}")),
        );
        self.search = Some(SearchSummary {
            query,
            query_id,
            result_count,
            evaluated: authority.evaluated,
            allowed: authority.allowed,
            denied: authority.denied,
        });
        Ok(())
    }
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::record::{JobRecord, snapshot};
    use crate::supervisor::SupervisorError;
    use crate::test_support::{ScriptedRunner, pipeline_output, test_config};
    use std::fs;
    use std::sync::RwLock;

    async fn run_job(
        kind: JobKind,
        root: PathBuf,
        runner: Arc<ScriptedRunner>,
    ) -> JobRecord {
        let config = Arc::new(test_config(&root));
        let executor = StageExecutor::new(config, runner);
        let record = Arc::new(RwLock::new(JobRecord::new(kind, root.clone())));
        let plan = JobPlan {
            root,
            env: Arc::new(JobEnvironment::default()),
        };
        executor.run(plan, JobWriter::new(record.clone())).await;
        snapshot(&record)
    }

    fn fixture_dir(files: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in files {
            fs::write(dir.path().join(name), format!("contents of {name}")).expect("write");
        }
        dir
    }

    #[tokio::test]
    async fn ingest_job_runs_every_stage_in_order() {
        let dir = fixture_dir(&["a.txt", "b.md", "diagram.png"]);
        let runner = Arc::new(ScriptedRunner::new(|invocation| {
            match invocation.label.as_str() {
                "CHUNKING: art-a.txt" => Ok(CommandOutput {
                    stdout: "Chunks created: 3".into(),
                    stderr: String::new(),
                }),
                "CHUNKING: art-b.md" => Ok(CommandOutput {
                    stdout: "normalising\nChunks created: 4".into(),
                    stderr: String::new(),
                }),
                _ => pipeline_output(invocation),
            }
        }));

        let record = run_job(JobKind::Ingest, dir.path().to_path_buf(), runner.clone()).await;

        assert_eq!(record.status, JobStatus::Pass);
        assert!(record.last_error.is_none());
        assert!(record.finished_at.is_some());
        assert!(
            record
                .events
                .iter()
                .any(|event| event.stage == Some(Stage::Discovery)
                    && event.message == "Discovered 2 file(s)")
        );
        assert_eq!(record.items.len(), 2);
        assert_eq!(record.items[0].artefact_id.as_deref(), Some("art-a.txt"));
        assert_eq!(record.items[0].chunk_count, Some(3));
        assert_eq!(record.items[1].chunk_count, Some(4));
        let summary = record.summary.expect("summary on success");
        assert_eq!(summary.items, 2);
        assert_eq!(summary.chunks, 7);
        assert_eq!(summary.indexed_text, 6);
        assert_eq!(summary.indexed_vector, 6);

        let labels = runner.labels();
        assert_eq!(
            labels,
            vec![
                "INGESTION: a.txt",
                "INGESTION: b.md",
                "CHUNKING: art-a.txt",
                "CHUNKING: art-b.md",
                "TEXT_INDEXING: rebuild",
                "VECTOR_INDEXING: rebuild",
            ]
        );
    }

    #[tokio::test]
    async fn every_invocation_shares_the_job_environment_and_limits() {
        let dir = fixture_dir(&["a.txt"]);
        let runner = Arc::new(ScriptedRunner::new(pipeline_output));
        run_job(JobKind::Ingest, dir.path().to_path_buf(), runner.clone()).await;

        let calls = runner.calls();
        let first = &calls[0];
        for call in &calls {
            assert!(Arc::ptr_eq(&call.env, &first.env));
            assert_eq!(call.working_dir, dir.path());
            assert_eq!(call.timeout, Duration::from_secs(600));
            assert_eq!(call.output_cap, 500_000);
        }
    }

    #[tokio::test]
    async fn unreadable_counts_degrade_to_zero_with_a_warning() {
        let dir = fixture_dir(&["a.txt"]);
        let runner = Arc::new(ScriptedRunner::new(|invocation| {
            if invocation.label.starts_with("CHUNKING") || invocation.label.starts_with("TEXT_INDEXING") {
                return Ok(CommandOutput {
                    stdout: "done, but no count".into(),
                    stderr: String::new(),
                });
            }
            pipeline_output(invocation)
        }));

        let record = run_job(JobKind::Ingest, dir.path().to_path_buf(), runner).await;

        assert_eq!(record.status, JobStatus::Pass);
        assert_eq!(record.items[0].chunk_count, Some(0));
        let summary = record.summary.expect("summary");
        assert_eq!(summary.chunks, 0);
        assert_eq!(summary.indexed_text, 0);
        assert_eq!(summary.indexed_vector, 6);
        let warned: Vec<_> = record
            .events
            .iter()
            .filter(|event| event.severity == Severity::Warn)
            .map(|event| event.stage)
            .collect();
        assert_eq!(warned, vec![Some(Stage::Chunking), Some(Stage::TextIndexing)]);
    }

    #[tokio::test]
    async fn zero_matches_fail_at_discovery_naming_the_allow_list() {
        let dir = fixture_dir(&["scan.pdf"]);
        let runner = Arc::new(ScriptedRunner::new(pipeline_output));

        let record = run_job(JobKind::Ingest, dir.path().to_path_buf(), runner.clone()).await;

        assert_eq!(record.status, JobStatus::Fail);
        assert_eq!(record.current_stage, Some(Stage::Discovery));
        let error = record.last_error.expect("error recorded");
        assert!(error.contains(".txt, .md, .csv, .log, .json, .rtf"), "{error}");
        assert!(error.contains(&dir.path().display().to_string()));
        assert!(runner.labels().is_empty());
        assert!(record.summary.is_none());
    }

    #[tokio::test]
    async fn missing_file_fails_ingestion_and_keeps_prior_items() {
        let dir = fixture_dir(&["a.txt", "b.txt", "c.txt"]);
        let doomed = dir.path().join("b.txt");
        let runner = Arc::new(ScriptedRunner::new(move |invocation| {
            if invocation.label == "INGESTION: a.txt" {
                fs::remove_file(&doomed).expect("remove");
            }
            pipeline_output(invocation)
        }));

        let record = run_job(JobKind::Ingest, dir.path().to_path_buf(), runner.clone()).await;

        assert_eq!(record.status, JobStatus::Fail);
        assert_eq!(record.current_stage, Some(Stage::Ingestion));
        assert_eq!(record.items.len(), 1);
        assert!(record.items[0].path.ends_with("a.txt"));
        let error = record.last_error.expect("error recorded");
        assert!(error.starts_with("File not found:"), "{error}");
        assert!(error.contains("Directory listing"), "{error}");
        assert!(error.contains("a.txt, c.txt"), "{error}");
        assert_eq!(runner.labels(), vec!["INGESTION: a.txt"]);
    }

    #[tokio::test]
    async fn process_failure_stops_later_stages() {
        let dir = fixture_dir(&["a.txt"]);
        let runner = Arc::new(ScriptedRunner::new(|invocation| {
            if invocation.label.starts_with("TEXT_INDEXING") {
                return Err(SupervisorError::NonZeroExit {
                    label: invocation.label.clone(),
                    code: Some(2),
                    stderr: "opensearch unreachable".into(),
                });
            }
            pipeline_output(invocation)
        }));

        let record = run_job(JobKind::Ingest, dir.path().to_path_buf(), runner.clone()).await;

        assert_eq!(record.status, JobStatus::Fail);
        assert_eq!(record.current_stage, Some(Stage::TextIndexing));
        assert_eq!(
            record.last_error.as_deref(),
            Some("TEXT_INDEXING: rebuild exited with code 2: opensearch unreachable")
        );
        assert_eq!(record.items.len(), 1);
        assert_eq!(record.items[0].chunk_count, Some(3));
        assert!(!runner.labels().iter().any(|label| label.starts_with("VECTOR")));
        let last = record.events.last().expect("events");
        assert_eq!(last.severity, Severity::Error);
        assert_eq!(last.stage, Some(Stage::TextIndexing));
    }

    #[tokio::test]
    async fn timeout_is_an_ordinary_stage_failure() {
        let dir = fixture_dir(&["a.txt"]);
        let runner = Arc::new(ScriptedRunner::new(|invocation| {
            if invocation.label.starts_with("CHUNKING") {
                return Err(SupervisorError::Timeout {
                    label: invocation.label.clone(),
                    elapsed_ms: 600_012,
                    budget_ms: 600_000,
                });
            }
            pipeline_output(invocation)
        }));

        let record = run_job(JobKind::Ingest, dir.path().to_path_buf(), runner).await;

        assert_eq!(record.status, JobStatus::Fail);
        assert_eq!(record.current_stage, Some(Stage::Chunking));
        assert!(
            record
                .last_error
                .expect("error")
                .contains("timed out after 600012ms (timeout=600000ms)")
        );
    }

    #[tokio::test]
    async fn self_test_bootstraps_first_and_searches_last() {
        let dir = fixture_dir(&["fixture.txt"]);
        let runner = Arc::new(ScriptedRunner::new(pipeline_output));

        let record = run_job(JobKind::SelfTest, dir.path().to_path_buf(), runner.clone()).await;

        assert_eq!(record.status, JobStatus::Pass);
        let labels = runner.labels();
        assert_eq!(labels.first().map(String::as_str), Some("BOOTSTRAP: metadata schema"));
        assert_eq!(labels.last().map(String::as_str), Some("SEARCH: deployment test"));
        let calls = runner.calls();
        assert_eq!(calls[0].timeout, Duration::from_secs(30));
        assert_eq!(calls[1].args[5], "SELF_TEST");

        let search = record.search.expect("search summary");
        assert_eq!(search.query_id, "q-123");
        assert_eq!(search.result_count, 2);
        assert_eq!((search.allowed, search.denied), (1, 1));
    }

    #[tokio::test]
    async fn missing_evaluation_record_does_not_fail_the_self_test() {
        let dir = fixture_dir(&["fixture.txt"]);
        let runner = Arc::new(ScriptedRunner::new(|invocation| {
            if invocation.label.starts_with("SEARCH") {
                return Ok(CommandOutput {
                    stdout: r#"{"response": {"query_id": "q-9", "results": []}, "authority_summary": null}"#.into(),
                    stderr: String::new(),
                });
            }
            pipeline_output(invocation)
        }));

        let record = run_job(JobKind::SelfTest, dir.path().to_path_buf(), runner).await;

        assert_eq!(record.status, JobStatus::Pass);
        let search = record.search.expect("search summary");
        assert_eq!(search.query_id, "q-9");
        assert_eq!((search.evaluated, search.allowed, search.denied), (0, 0, 0));
        assert!(
            record
                .events
                .iter()
                .any(|event| event.stage == Some(Stage::Search)
                    && event.severity == Severity::Warn)
        );
    }
}
