//! Stub process runner shared by the unit tests.

use crate::config::Config;
use crate::supervisor::{CommandOutput, Invocation, ProcessRunner, SupervisorError};
use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

type Responder = dyn Fn(&Invocation) -> Result<CommandOutput, SupervisorError> + Send + Sync;

/// Records every invocation and answers with a caller-supplied closure.
///
/// When built with a gate, each call waits for one permit first, letting tests hold a job in the
/// `running` state for as long as they need.
pub(crate) struct ScriptedRunner {
    calls: Mutex<Vec<Invocation>>,
    responder: Box<Responder>,
    gate: Option<Arc<Semaphore>>,
}

impl ScriptedRunner {
    pub(crate) fn new(
        responder: impl Fn(&Invocation) -> Result<CommandOutput, SupervisorError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            responder: Box::new(responder),
            gate: None,
        }
    }

    pub(crate) fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::new(pipeline_output)
        }
    }

    pub(crate) fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub(crate) fn labels(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .map(|invocation| invocation.label)
            .collect()
    }
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput, SupervisorError> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate open").forget();
        }
        self.calls
            .lock()
            .expect("calls lock")
            .push(invocation.clone());
        (self.responder)(invocation)
    }
}

/// Well-formed output for every stage, keyed on the invocation label.
pub(crate) fn pipeline_output(invocation: &Invocation) -> Result<CommandOutput, SupervisorError> {
    let stage = invocation
        .label
        .split(':')
        .next()
        .unwrap_or_default();
    let stdout = match stage {
        "INGESTION" => {
            let document_id = &invocation.args[2];
            let title = &invocation.args[3];
            serde_json::json!({
                "document_id": document_id,
                "version_id": format!("ver-{title}"),
                "artefact_id": format!("art-{title}"),
            })
            .to_string()
        }
        "CHUNKING" => "Chunks created: 3".to_string(),
        "TEXT_INDEXING" | "VECTOR_INDEXING" => "Indexed chunks: 6".to_string(),
        "SEARCH" => serde_json::json!({
            "response": {"query_id": "q-123", "results": [{"chunk_id": "c1"}, {"chunk_id": "c2"}]},
            "authority_summary": {"evaluated": 2, "allowed": 1, "denied": 1},
        })
        .to_string(),
        _ => String::new(),
    };
    Ok(CommandOutput {
        stdout,
        stderr: String::new(),
    })
}

/// Defaults rooted at `root`, with both discovery roots pointing at it too.
pub(crate) fn test_config(root: &Path) -> Config {
    let mut config = Config::with_root(root);
    config.default_ingest_root = root.to_path_buf();
    config.self_test_fixtures = root.to_path_buf();
    config
}
