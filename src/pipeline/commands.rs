//! Command lines of the external stage programs.
//!
//! Every stage runs through the configured interpreter from the pipeline root. Values that vary
//! per call are passed as arguments, never spliced into the inline scripts.

use crate::jobs::JobKind;
use std::path::Path;
use uuid::Uuid;

const INGEST_SCRIPT: &str = r#"import json, sys
from pathlib import Path
from modules.ingestion.app.cli import ingest_txt
doc_id, title, fpath, document_type, authority_level = sys.argv[1:6]
version_id, artefact_id = ingest_txt(
    document_id=doc_id,
    title=title,
    path=Path(fpath),
    document_type=document_type,
    authority_level=authority_level,
)
print(json.dumps({
    "document_id": doc_id,
    "version_id": version_id,
    "artefact_id": artefact_id,
}))"#;

const SEARCH_SCRIPT: &str = r#"import json, sys
from modules.hybrid_search.app.search import hybrid_search
from modules.metadata.app.db import connection_cursor
response = hybrid_search(sys.argv[1], top_k=int(sys.argv[2]))
query_id = response.get("query_id")
outcome = None
with connection_cursor(dict_cursor=True) as cur:
    cur.execute(
        """
        SELECT details FROM audit_log
        WHERE action='AUTHORITY_EVALUATED' AND details->>'query_id' = %s
        ORDER BY audit_id DESC LIMIT 1
        """,
        (query_id,),
    )
    row = cur.fetchone()
    if row and row.get("details") and row["details"].get("outcome"):
        outcome = row["details"]["outcome"]
print(json.dumps({"response": response, "authority_summary": outcome}, default=str))"#;

const SEARCH_TOP_K: u32 = 5;

/// How documents created by a job kind are labelled in the metadata store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestProfile {
    /// Prefix of generated document identifiers.
    pub document_prefix: &'static str,
    /// Document type recorded with each document.
    pub document_type: &'static str,
    /// Authority level recorded with each document.
    pub authority_level: &'static str,
}

impl IngestProfile {
    /// Profile used by `kind`.
    pub fn for_kind(kind: JobKind) -> Self {
        match kind {
            JobKind::Ingest => Self {
                document_prefix: "UI3",
                document_type: "UI3_INGEST",
                authority_level: "REFERENCE",
            },
            JobKind::SelfTest => Self {
                document_prefix: "UI2",
                document_type: "SELF_TEST",
                authority_level: "AUTHORITATIVE",
            },
        }
    }

    /// Document identifier of the `position`-th file (0-based) of a job.
    pub fn document_id(&self, job_id: Uuid, position: usize) -> String {
        format!("{}-{job_id}-{:03}", self.document_prefix, position + 1)
    }
}

/// Prepare the metadata schema.
pub fn bootstrap() -> Vec<String> {
    module(&["modules.metadata.app.bootstrap"])
}

/// Ingest one file.
pub fn ingest(document_id: &str, title: &str, path: &Path, profile: &IngestProfile) -> Vec<String> {
    vec![
        "-c".to_string(),
        INGEST_SCRIPT.to_string(),
        document_id.to_string(),
        title.to_string(),
        path.to_string_lossy().into_owned(),
        profile.document_type.to_string(),
        profile.authority_level.to_string(),
    ]
}

/// Chunk one artefact.
pub fn chunk(artefact_id: &str) -> Vec<String> {
    module(&["modules.chunking.app.pipeline", "--artefact-id", artefact_id])
}

/// Rebuild the lexical index.
pub fn rebuild_text_index() -> Vec<String> {
    module(&["modules.indexing.app.indexer", "rebuild"])
}

/// Rebuild the vector index.
pub fn rebuild_vector_index() -> Vec<String> {
    module(&["modules.vector_indexing.app.indexer", "rebuild"])
}

/// Run the validation query and fetch its evaluation summary.
pub fn search(query: &str) -> Vec<String> {
    vec![
        "-c".to_string(),
        SEARCH_SCRIPT.to_string(),
        query.to_string(),
        SEARCH_TOP_K.to_string(),
    ]
}

fn module(args: &[&str]) -> Vec<String> {
    std::iter::once("-m")
        .chain(args.iter().copied())
        .map(str::to_string)
        .collect()
}
