//! Stdout contract spoken by the external stage programs (version 1).
//!
//! | stage          | expected stdout                                                          |
//! |----------------|--------------------------------------------------------------------------|
//! | ingestion      | a line holding `{"document_id":…,"version_id":…,"artefact_id":…}`        |
//! | chunking       | `Chunks created: <digits>`                                               |
//! | indexing       | `Indexed chunks: <digits>`                                               |
//! | search         | a line holding `{"response":{…},"authority_summary":{…}}`                |
//!
//! Programs may log freely around these tokens: JSON results are read from the last line that
//! parses, and count tokens from their last occurrence. Anything else is a
//! [`ProtocolError::MalformedOutput`], which callers downgrade to a default value.

use regex::Regex;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::sync::OnceLock;
use thiserror::Error;

/// Contract version implemented by this module.
pub const PROTOCOL_VERSION: u32 = 1;

/// Soft parse failures; never fatal to a job on their own.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Expected token or JSON line was missing or unreadable.
    #[error("malformed {what} output: {reason}")]
    MalformedOutput {
        /// Which result was being read.
        what: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

/// Identifiers reported by one ingestion call.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IngestionResult {
    /// Document identifier.
    pub document_id: String,
    /// Version identifier.
    pub version_id: String,
    /// Artefact identifier, the input of chunking.
    pub artefact_id: String,
}

/// Allow/deny tally of the access-rule evaluation matching a search.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct AuthoritySummary {
    /// Results evaluated.
    #[serde(default)]
    pub evaluated: u64,
    /// Results allowed.
    #[serde(default)]
    pub allowed: u64,
    /// Results denied.
    #[serde(default)]
    pub denied: u64,
}

/// Parsed self-test search output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchReport {
    /// Correlation token of the query.
    pub query_id: String,
    /// Number of results returned.
    pub result_count: usize,
    /// Matching evaluation record, when one was found.
    pub authority: Option<AuthoritySummary>,
}

#[derive(Deserialize)]
struct SearchLine {
    response: SearchResponse,
    #[serde(default)]
    authority_summary: Option<AuthoritySummary>,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    query_id: Option<String>,
    #[serde(default)]
    results: Vec<serde_json::Value>,
}

/// Read the ingestion identifiers.
pub fn parse_ingestion(stdout: &str) -> Result<IngestionResult, ProtocolError> {
    let result: IngestionResult = last_json_line(stdout, "ingestion")?;
    if result.artefact_id.trim().is_empty() {
        return Err(malformed("ingestion", "artefact_id is empty"));
    }
    Ok(result)
}

/// Read the `Chunks created: N` token.
pub fn parse_chunk_count(stdout: &str) -> Result<u64, ProtocolError> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"Chunks created:\s*(\d+)").expect("chunk count pattern is valid")
    });
    last_count(pattern, stdout, "chunking")
}

/// Read the `Indexed chunks: N` token.
pub fn parse_indexed_count(stdout: &str) -> Result<u64, ProtocolError> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"Indexed chunks:\s*(\d+)").expect("indexed count pattern is valid")
    });
    last_count(pattern, stdout, "indexing")
}

/// Read the search response and its authority summary.
pub fn parse_search(stdout: &str) -> Result<SearchReport, ProtocolError> {
    let line: SearchLine = last_json_line(stdout, "search")?;
    Ok(SearchReport {
        query_id: line.response.query_id.unwrap_or_default(),
        result_count: line.response.results.len(),
        authority: line.authority_summary,
    })
}

fn last_count(pattern: &Regex, stdout: &str, what: &'static str) -> Result<u64, ProtocolError> {
    let captures = pattern
        .captures_iter(stdout)
        .last()
        .ok_or_else(|| malformed(what, "count token not found"))?;
    captures[1]
        .parse()
        .map_err(|error| malformed(what, format!("count out of range: {error}")))
}

fn last_json_line<T: DeserializeOwned>(
    stdout: &str,
    what: &'static str,
) -> Result<T, ProtocolError> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| serde_json::from_str(line).ok())
        .ok_or_else(|| malformed(what, "no JSON result line"))
}

fn malformed(what: &'static str, reason: impl Into<String>) -> ProtocolError {
    ProtocolError::MalformedOutput {
        what,
        reason: reason.into(),
    }
}
