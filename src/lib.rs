#![deny(missing_docs)]

//! Core library for the pipeline console job orchestrator.

/// HTTP routing and REST handlers.
pub mod api;
/// Environment-driven configuration management.
pub mod config;
/// Caller identity and stage process environments.
pub mod context;
/// Job records, event logs and the single-flight registry.
pub mod jobs;
/// Structured logging and tracing setup.
pub mod logging;
/// Job activity counters.
pub mod metrics;
/// Stage pipeline: discovery, commands, stdout protocol and the executor.
pub mod pipeline;
/// Supervised execution of external stage commands.
pub mod supervisor;

#[cfg(test)]
mod test_support;
