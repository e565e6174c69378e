use std::env;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Required environment variable was not provided.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

const DEFAULT_EXTENSIONS: &str = ".txt,.md,.csv,.log,.json,.rtf";
const DEFAULT_ENV_FILES: &str = "env/.env,ops/docker/.env";
const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
const INGEST_TIMEOUT_SECONDS: u64 = 600;
const MAX_OUTPUT_BYTES: usize = 500_000;
const SELF_TEST_QUERY: &str = "deployment test";

/// Runtime configuration for the pipeline console.
#[derive(Debug, Clone)]
pub struct Config {
    /// Working directory for every external stage invocation.
    pub pipeline_root: PathBuf,
    /// Interpreter used to launch the stage programs.
    pub interpreter: PathBuf,
    /// Env files merged into the base environment of stage processes.
    pub env_files: Vec<PathBuf>,
    /// Root scanned by ingest jobs when the caller does not supply one.
    pub default_ingest_root: PathBuf,
    /// Fixture directory ingested by the self-test.
    pub self_test_fixtures: PathBuf,
    /// Lowercase file suffixes (with leading dot) accepted by discovery.
    pub ingest_extensions: Vec<String>,
    /// Budget for quick invocations (bootstrap, search).
    pub default_timeout: Duration,
    /// Budget for long-running invocations (ingestion, chunking, indexing).
    pub ingest_timeout: Duration,
    /// Per-stream cap on captured stdout/stderr.
    pub max_output_bytes: usize,
    /// Echo external process output through `tracing` at debug level.
    pub ingest_debug: bool,
    /// Query executed by the self-test search stage.
    pub self_test_query: String,
    /// Optional override for the HTTP server port.
    pub server_port: Option<u16>,
}

impl Config {
    /// Load configuration from environment variables, performing validation along the way.
    pub fn from_env() -> Result<Self, ConfigError> {
        let pipeline_root = load_env_optional("PLK_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let interpreter = load_env_optional("PLK_PYTHON")
            .map(PathBuf::from)
            .unwrap_or_else(|| pipeline_root.join(".venv").join("bin").join("python"));
        let env_files = split_list(
            &load_env_optional("PLK_ENV_FILES").unwrap_or_else(|| DEFAULT_ENV_FILES.into()),
        )
        .into_iter()
        .map(|entry| resolve_against(&pipeline_root, &entry))
        .collect();
        let default_ingest_root = load_env_optional("PLK_INGEST_ROOT")
            .map(|entry| resolve_against(&pipeline_root, &entry))
            .unwrap_or_else(|| pipeline_root.join("tmp").join("testdata"));
        let self_test_fixtures = load_env_optional("PLK_SELF_TEST_FIXTURES")
            .map(|entry| resolve_against(&pipeline_root, &entry))
            .unwrap_or_else(|| pipeline_root.join("ops").join("scripts").join("stage5_tmp"));
        let ingest_extensions = normalize_extensions(
            &load_env_optional("PLK_INGEST_EXTENSIONS").unwrap_or_else(|| DEFAULT_EXTENSIONS.into()),
        );
        if ingest_extensions.is_empty() {
            return Err(ConfigError::InvalidValue("PLK_INGEST_EXTENSIONS".into()));
        }

        Ok(Self {
            pipeline_root,
            interpreter,
            env_files,
            default_ingest_root,
            self_test_fixtures,
            ingest_extensions,
            default_timeout: Duration::from_secs(parse_env_or(
                "PLK_DEFAULT_TIMEOUT_SECONDS",
                DEFAULT_TIMEOUT_SECONDS,
            )?),
            ingest_timeout: Duration::from_secs(parse_env_or(
                "PLK_INGEST_TIMEOUT_SECONDS",
                INGEST_TIMEOUT_SECONDS,
            )?),
            max_output_bytes: parse_env_or("PLK_MAX_OUTPUT_BYTES", MAX_OUTPUT_BYTES)?,
            ingest_debug: load_env_optional("PLK_INGEST_DEBUG")
                .map(|value| value.trim() != "0")
                .unwrap_or(true),
            self_test_query: load_env_optional("PLK_SELF_TEST_QUERY")
                .unwrap_or_else(|| SELF_TEST_QUERY.into()),
            server_port: load_env_optional("SERVER_PORT")
                .map(|value| {
                    value
                        .parse()
                        .map_err(|_| ConfigError::InvalidValue("SERVER_PORT".into()))
                })
                .transpose()?,
        })
    }

    /// Build a configuration rooted at `pipeline_root` with every other value defaulted.
    ///
    /// Intended for embedding the orchestrator and for tests; no environment is consulted.
    pub fn with_root(pipeline_root: impl Into<PathBuf>) -> Self {
        let pipeline_root = pipeline_root.into();
        Self {
            interpreter: pipeline_root.join(".venv").join("bin").join("python"),
            env_files: Vec::new(),
            default_ingest_root: pipeline_root.join("tmp").join("testdata"),
            self_test_fixtures: pipeline_root.join("ops").join("scripts").join("stage5_tmp"),
            ingest_extensions: normalize_extensions(DEFAULT_EXTENSIONS),
            default_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECONDS),
            ingest_timeout: Duration::from_secs(INGEST_TIMEOUT_SECONDS),
            max_output_bytes: MAX_OUTPUT_BYTES,
            ingest_debug: false,
            self_test_query: SELF_TEST_QUERY.into(),
            server_port: None,
            pipeline_root,
        }
    }
}

fn load_env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_env_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError> {
    load_env_optional(key)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue(key.to_string()))
        })
        .transpose()
        .map(|value| value.unwrap_or(default))
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}

fn resolve_against(root: &Path, entry: &str) -> PathBuf {
    let path = PathBuf::from(entry);
    if path.is_absolute() {
        path
    } else {
        root.join(path)
    }
}

/// Lowercase the suffix list, add the leading dot where missing and drop duplicates.
pub(crate) fn normalize_extensions(raw: &str) -> Vec<String> {
    let mut extensions: Vec<String> = Vec::new();
    for entry in split_list(raw) {
        let lowered = entry.to_lowercase();
        let normalized = if lowered.starts_with('.') {
            lowered
        } else {
            format!(".{lowered}")
        };
        if !extensions.contains(&normalized) {
            extensions.push(normalized);
        }
    }
    extensions
}

/// Global configuration cache populated during process start.
pub static CONFIG: OnceLock<Config> = OnceLock::new();

/// Load configuration from the environment and install it in the global cache.
///
/// The first successful call wins; later calls return the cached configuration.
pub fn init_config() -> Result<&'static Config, ConfigError> {
    if let Some(config) = CONFIG.get() {
        return Ok(config);
    }
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    tracing::debug!(
        pipeline_root = %config.pipeline_root.display(),
        interpreter = %config.interpreter.display(),
        default_timeout_ms = config.default_timeout.as_millis() as u64,
        ingest_timeout_ms = config.ingest_timeout.as_millis() as u64,
        server_port = ?config.server_port,
        "Loaded configuration"
    );
    Ok(CONFIG.get_or_init(|| config))
}
