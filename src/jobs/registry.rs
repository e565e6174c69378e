//! Job registry with a single-flight scheduler per job kind.
//!
//! Lock order is `active` → `jobs` → record. No lock is held across an `.await`.

use crate::config::Config;
use crate::context::{BaseEnvironment, UserContext};
use crate::jobs::record::{JobRecord, SharedRecord, fail_abandoned, snapshot};
use crate::jobs::{JobKind, JobWriter, Severity};
use crate::metrics::{JobMetrics, MetricsSnapshot};
use crate::pipeline::{JobPlan, StageExecutor};
use crate::supervisor::ProcessRunner;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use uuid::Uuid;

/// Parameters of a start request.
#[derive(Debug, Clone)]
pub struct JobRequest {
    kind: JobKind,
    root: Option<PathBuf>,
    context: UserContext,
}

impl JobRequest {
    /// Ingest `root`, or the configured default root when `None`.
    pub fn ingest(root: Option<PathBuf>, context: UserContext) -> Self {
        Self {
            kind: JobKind::Ingest,
            root,
            context,
        }
    }

    /// Run the self-test over the configured fixture set.
    pub fn self_test(context: UserContext) -> Self {
        Self {
            kind: JobKind::SelfTest,
            root: None,
            context,
        }
    }

    /// Kind of job requested.
    pub fn kind(&self) -> JobKind {
        self.kind
    }

    /// Explicit discovery root, if any.
    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    /// Caller identity.
    pub fn context(&self) -> &UserContext {
        &self.context
    }
}

/// Start/poll surface shared by the HTTP router and the command-line runner.
pub trait JobService: Send + Sync {
    /// Start a job, or return the running job of the same kind unchanged.
    fn start(&self, request: JobRequest) -> JobRecord;

    /// Snapshot of a job by identifier.
    fn get(&self, id: Uuid) -> Option<JobRecord>;

    /// Job counters since startup.
    fn metrics_snapshot(&self) -> MetricsSnapshot;
}

/// In-memory owner of every job record of this process.
pub struct JobRegistry {
    config: Arc<Config>,
    executor: Arc<StageExecutor>,
    base_env: BaseEnvironment,
    jobs: RwLock<HashMap<Uuid, SharedRecord>>,
    active: Arc<Mutex<HashMap<JobKind, Uuid>>>,
    metrics: Arc<JobMetrics>,
}

impl JobRegistry {
    /// Build a registry, loading the base environment from the configured env files.
    pub fn new(config: Arc<Config>, runner: Arc<dyn ProcessRunner>) -> Self {
        let base_env = BaseEnvironment::load(&config.env_files);
        Self::with_environment(config, runner, base_env)
    }

    /// Build a registry over an explicit base environment.
    pub fn with_environment(
        config: Arc<Config>,
        runner: Arc<dyn ProcessRunner>,
        base_env: BaseEnvironment,
    ) -> Self {
        Self {
            executor: Arc::new(StageExecutor::new(Arc::clone(&config), runner)),
            config,
            base_env,
            jobs: RwLock::new(HashMap::new()),
            active: Arc::new(Mutex::new(HashMap::new())),
            metrics: Arc::new(JobMetrics::new()),
        }
    }

    fn lookup(&self, id: Uuid) -> Option<SharedRecord> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    fn default_root(&self, kind: JobKind) -> PathBuf {
        match kind {
            JobKind::Ingest => self.config.default_ingest_root.clone(),
            JobKind::SelfTest => self.config.self_test_fixtures.clone(),
        }
    }

    /// Anchor a caller root to this process's working directory; stage commands run from
    /// the pipeline root and would otherwise resolve it against a different directory.
    fn absolute_root(root: PathBuf) -> PathBuf {
        if root.is_absolute() {
            return root;
        }
        match std::path::absolute(&root) {
            Ok(absolute) => absolute,
            Err(error) => {
                tracing::warn!(root = %root.display(), %error, "Could not make root absolute");
                root
            }
        }
    }
}

impl JobService for JobRegistry {
    fn start(&self, request: JobRequest) -> JobRecord {
        let JobRequest {
            kind,
            root,
            context,
        } = request;
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(running) = active
            .get(&kind)
            .and_then(|id| self.lookup(*id))
            .map(|record| snapshot(&record))
            .filter(|view| !view.status.is_terminal())
        {
            tracing::info!(
                job_id = %running.id,
                %kind,
                requested_root = ?root,
                actor = context.actor(),
                "Job already running; start request joined it and its parameters were ignored"
            );
            self.metrics.record_coalesced();
            return running;
        }

        let root = Self::absolute_root(root.unwrap_or_else(|| self.default_root(kind)));
        let mut record = JobRecord::new(kind, root.clone());
        let message = match kind {
            JobKind::Ingest => format!("Ingest job started at {}", root.display()),
            JobKind::SelfTest => "Self-test started".to_string(),
        };
        record.push_event(
            None,
            Severity::Info,
            message,
            Some(format!(
                "actor={} roles={} classification={}",
                context.actor(),
                context.joined_roles(),
                context.classification()
            )),
        );
        let id = record.id;
        let shared = Arc::new(RwLock::new(record));
        let view = snapshot(&shared);

        self.jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::clone(&shared));
        active.insert(kind, id);
        drop(active);
        self.metrics.record_started();
        tracing::info!(job_id = %id, %kind, root = %root.display(), "Job started");

        let guard = TaskGuard {
            record: Arc::clone(&shared),
            active: Arc::clone(&self.active),
            metrics: Arc::clone(&self.metrics),
            kind,
            id,
        };
        let plan = JobPlan {
            root,
            env: Arc::new(self.base_env.for_context(&context)),
        };
        let writer = JobWriter::new(shared);
        let executor = Arc::clone(&self.executor);
        tokio::spawn(async move {
            let _guard = guard;
            executor.run(plan, writer).await;
        });

        view
    }

    fn get(&self, id: Uuid) -> Option<JobRecord> {
        self.lookup(id).map(|record| snapshot(&record))
    }

    fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}

/// Settles a job when its task ends, however it ends. A task that panicked or was
/// cancelled leaves a failed record behind; the outcome is counted before the kind's
/// active slot is released.
struct TaskGuard {
    record: SharedRecord,
    active: Arc<Mutex<HashMap<JobKind, Uuid>>>,
    metrics: Arc<JobMetrics>,
    kind: JobKind,
    id: Uuid,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let status = {
            let mut record = self.record.write().unwrap_or_else(PoisonError::into_inner);
            fail_abandoned(&mut record);
            record.status
        };
        self.metrics.record_finished(status);

        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.get(&self.kind) == Some(&self.id) {
            active.remove(&self.kind);
            tracing::debug!(job_id = %self.id, kind = %self.kind, "Released active slot");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ACTOR_VAR;
    use crate::jobs::record::ABANDONED_MESSAGE;
    use crate::jobs::{JobStatus, Stage};
    use crate::test_support::{ScriptedRunner, pipeline_output, test_config};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    struct Harness {
        registry: JobRegistry,
        runner: Arc<ScriptedRunner>,
        _dir: tempfile::TempDir,
    }

    fn harness(runner: ScriptedRunner) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("a.txt"), "alpha").expect("write");
        std::fs::write(dir.path().join("b.md"), "beta").expect("write");
        let runner = Arc::new(runner);
        let registry = JobRegistry::with_environment(
            Arc::new(test_config(dir.path())),
            runner.clone(),
            BaseEnvironment::from_vars([("PATH", "/usr/bin"), (ACTOR_VAR, "inherited")]),
        );
        Harness {
            registry,
            runner,
            _dir: dir,
        }
    }

    async fn wait_terminal(registry: &JobRegistry, id: Uuid) -> JobRecord {
        for _ in 0..500 {
            let record = registry.get(id).expect("job registered");
            if record.status.is_terminal() {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} did not finish");
    }

    #[tokio::test]
    async fn concurrent_starts_of_one_kind_share_a_job() {
        let gate = Arc::new(Semaphore::new(0));
        let Harness { registry, _dir, .. } = harness(ScriptedRunner::gated(gate.clone()));

        let first = registry.start(JobRequest::ingest(None, UserContext::default()));
        let second = registry.start(JobRequest::ingest(
            Some(PathBuf::from("/elsewhere")),
            UserContext::default(),
        ));

        assert_eq!(first.status, JobStatus::Running);
        assert_eq!(first.id, second.id);
        assert_eq!(second.root, first.root);
        assert_eq!(registry.metrics_snapshot().jobs_coalesced, 1);

        gate.add_permits(100);
        let finished = wait_terminal(&registry, first.id).await;
        assert_eq!(finished.status, JobStatus::Pass);
    }

    #[tokio::test]
    async fn different_kinds_run_side_by_side() {
        let gate = Arc::new(Semaphore::new(0));
        let Harness { registry, _dir, .. } = harness(ScriptedRunner::gated(gate.clone()));

        let ingest = registry.start(JobRequest::ingest(None, UserContext::default()));
        let self_test = registry.start(JobRequest::self_test(UserContext::default()));

        assert_ne!(ingest.id, self_test.id);
        assert_eq!(self_test.kind, JobKind::SelfTest);
        assert_eq!(registry.metrics_snapshot().jobs_running, 2);

        gate.add_permits(100);
        assert_eq!(
            wait_terminal(&registry, ingest.id).await.status,
            JobStatus::Pass
        );
        assert_eq!(
            wait_terminal(&registry, self_test.id).await.status,
            JobStatus::Pass
        );
    }

    #[tokio::test]
    async fn a_finished_job_frees_its_kind() {
        let Harness { registry, _dir, .. } = harness(ScriptedRunner::new(pipeline_output));

        let first = registry.start(JobRequest::ingest(None, UserContext::default()));
        wait_terminal(&registry, first.id).await;
        let second = registry.start(JobRequest::ingest(None, UserContext::default()));

        assert_ne!(first.id, second.id);
        assert_eq!(registry.metrics_snapshot().jobs_started, 2);
        wait_terminal(&registry, second.id).await;
    }

    #[tokio::test]
    async fn polling_observes_an_append_only_log() {
        let gate = Arc::new(Semaphore::new(0));
        let Harness { registry, _dir, .. } = harness(ScriptedRunner::gated(gate.clone()));
        let id = registry
            .start(JobRequest::ingest(None, UserContext::default()))
            .id;

        let mut previous = registry.get(id).expect("registered");
        loop {
            gate.add_permits(1);
            tokio::time::sleep(Duration::from_millis(5)).await;
            let current = registry.get(id).expect("registered");
            assert!(current.events.len() >= previous.events.len());
            assert_eq!(&current.events[..previous.events.len()], &previous.events[..]);
            assert!(current.items.len() >= previous.items.len());
            for (before, after) in previous.items.iter().zip(&current.items) {
                assert_eq!(before.path, after.path);
                assert_eq!(before.artefact_id, after.artefact_id);
            }
            if current.status.is_terminal() {
                assert_eq!(current.status, JobStatus::Pass);
                break;
            }
            previous = current;
        }
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let Harness { registry, _dir, .. } = harness(ScriptedRunner::new(pipeline_output));
        assert!(registry.get(Uuid::new_v4()).is_none());
    }

    #[tokio::test]
    async fn invocations_carry_the_caller_context() {
        let Harness {
            registry,
            runner,
            _dir,
        } = harness(ScriptedRunner::new(pipeline_output));
        let context = UserContext::new("analyst", ["ENGINEER", "AUDITOR"], "RESTRICTED")
            .expect("valid context");

        let started = registry.start(JobRequest::ingest(None, context));
        assert_eq!(
            started.events[0].detail.as_deref(),
            Some("actor=analyst roles=ENGINEER,AUDITOR classification=RESTRICTED")
        );
        wait_terminal(&registry, started.id).await;

        let calls = runner.calls();
        assert!(!calls.is_empty());
        for call in calls {
            assert_eq!(call.env.get(ACTOR_VAR), Some("analyst"));
            assert_eq!(call.env.get("PATH"), Some("/usr/bin"));
        }
    }

    #[tokio::test]
    async fn failed_job_releases_its_slot() {
        let Harness { registry, _dir, .. } = harness(ScriptedRunner::new(pipeline_output));

        let failed = registry.start(JobRequest::ingest(
            Some(PathBuf::from("/definitely/not/mounted")),
            UserContext::default(),
        ));
        let record = wait_terminal(&registry, failed.id).await;
        assert_eq!(record.status, JobStatus::Fail);
        assert_eq!(record.current_stage, Some(Stage::Discovery));

        let retry = registry.start(JobRequest::ingest(None, UserContext::default()));
        assert_ne!(retry.id, failed.id);
        assert_eq!(
            wait_terminal(&registry, retry.id).await.status,
            JobStatus::Pass
        );
        assert_eq!(registry.metrics_snapshot().jobs_failed, 1);
    }

    #[tokio::test]
    async fn relative_roots_resolve_against_the_working_directory() {
        let Harness {
            registry,
            runner,
            _dir,
        } = harness(ScriptedRunner::new(pipeline_output));
        let local = tempfile::tempdir_in(".").expect("tempdir in working directory");
        std::fs::write(local.path().join("notes.txt"), "gamma").expect("write");
        let relative = PathBuf::from(local.path().file_name().expect("dir name"));
        assert!(relative.is_relative());

        let started = registry.start(JobRequest::ingest(
            Some(relative.clone()),
            UserContext::default(),
        ));
        let expected = std::env::current_dir().expect("cwd").join(&relative);
        assert!(started.root.is_absolute());
        assert_eq!(started.root, expected);
        assert!(!started.root.starts_with(_dir.path()));

        let record = wait_terminal(&registry, started.id).await;
        assert_eq!(record.status, JobStatus::Pass, "{:?}", record.last_error);
        let ingested: Vec<PathBuf> = runner
            .calls()
            .into_iter()
            .filter(|call| call.label.starts_with("INGESTION"))
            .map(|call| PathBuf::from(&call.args[4]))
            .collect();
        assert_eq!(ingested, vec![expected.join("notes.txt")]);
        assert!(ingested.iter().all(|path| path.is_absolute() && path.is_file()));
    }

    #[tokio::test]
    async fn a_panicking_job_task_is_failed_and_counted() {
        let Harness { registry, _dir, .. } = harness(ScriptedRunner::new(|invocation| {
            if invocation.label.starts_with("CHUNKING") {
                panic!("chunker crashed");
            }
            pipeline_output(invocation)
        }));

        let crashed = registry.start(JobRequest::ingest(None, UserContext::default()));
        let record = wait_terminal(&registry, crashed.id).await;
        assert_eq!(record.status, JobStatus::Fail);
        assert_eq!(record.last_error.as_deref(), Some(ABANDONED_MESSAGE));
        assert_eq!(record.current_stage, Some(Stage::Chunking));
        assert!(record.finished_at.is_some());

        let mut metrics = registry.metrics_snapshot();
        for _ in 0..500 {
            if metrics.jobs_running == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            metrics = registry.metrics_snapshot();
        }
        assert_eq!(metrics.jobs_failed, 1);
        assert_eq!(metrics.jobs_passed, 0);
        assert_eq!(metrics.jobs_running, 0);

        let retry = registry.start(JobRequest::ingest(None, UserContext::default()));
        assert_ne!(retry.id, crashed.id);
        assert_eq!(retry.status, JobStatus::Running);
    }
}
