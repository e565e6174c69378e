//! Caller identity and the environment handed to every external stage process.
//!
//! The environment is the only channel through which stage programs learn who is asking, so it
//! is computed once per job and shared by every invocation of that job.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Variable carrying the actor identifier.
pub const ACTOR_VAR: &str = "PLK_ACTOR";
/// Variable carrying the comma-joined role list.
pub const ROLES_VAR: &str = "PLK_CONTEXT_ROLES";
/// Variable carrying the classification label.
pub const CLASSIFICATION_VAR: &str = "PLK_CONTEXT_CLASSIFICATION";

/// Reasons a caller context is rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContextError {
    /// Actor identifier was blank.
    #[error("actor must not be empty")]
    EmptyActor,
    /// No non-blank role was supplied.
    #[error("at least one role is required")]
    NoRoles,
    /// Classification label was blank.
    #[error("classification must not be empty")]
    EmptyClassification,
}

/// Identity on whose behalf a job runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserContext {
    actor: String,
    roles: Vec<String>,
    classification: String,
}

impl UserContext {
    /// Validate and normalize a caller context.
    ///
    /// Roles keep the caller's order; blanks are dropped, entries are trimmed and repeated roles
    /// keep their first position.
    pub fn new(
        actor: impl Into<String>,
        roles: impl IntoIterator<Item = impl Into<String>>,
        classification: impl Into<String>,
    ) -> Result<Self, ContextError> {
        let actor = actor.into().trim().to_string();
        if actor.is_empty() {
            return Err(ContextError::EmptyActor);
        }
        let classification = classification.into().trim().to_string();
        if classification.is_empty() {
            return Err(ContextError::EmptyClassification);
        }
        let mut normalized: Vec<String> = Vec::new();
        for role in roles {
            let role = role.into().trim().to_string();
            if !role.is_empty() && !normalized.contains(&role) {
                normalized.push(role);
            }
        }
        if normalized.is_empty() {
            return Err(ContextError::NoRoles);
        }
        Ok(Self {
            actor,
            roles: normalized,
            classification,
        })
    }

    /// Actor identifier.
    pub fn actor(&self) -> &str {
        &self.actor
    }

    /// Normalized role list.
    pub fn roles(&self) -> &[String] {
        &self.roles
    }

    /// Classification label.
    pub fn classification(&self) -> &str {
        &self.classification
    }

    /// Roles serialized the way stage programs expect them.
    pub fn joined_roles(&self) -> String {
        self.roles.join(",")
    }
}

impl Default for UserContext {
    fn default() -> Self {
        Self {
            actor: "console".into(),
            roles: vec!["SUPERUSER".into()],
            classification: "REFERENCE".into(),
        }
    }
}

/// Process environment plus values from the configured env files, loaded once.
#[derive(Debug, Clone, Default)]
pub struct BaseEnvironment {
    vars: BTreeMap<String, String>,
}

impl BaseEnvironment {
    /// Snapshot the current process environment and merge the env files over it.
    ///
    /// Values already present win; earlier files win over later ones. Missing files are skipped
    /// and unreadable entries are logged and ignored.
    pub fn load(env_files: &[PathBuf]) -> Self {
        let process = std::env::vars_os()
            .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)));
        let mut base = Self::from_vars(process);
        for path in env_files {
            base.merge_file(path);
        }
        tracing::debug!(
            variables = base.vars.len(),
            files = env_files.len(),
            "Loaded base environment for stage processes"
        );
        base
    }

    /// Build a base environment from explicit variables.
    pub fn from_vars<K, V>(vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: vars
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }

    fn merge_file(&mut self, path: &Path) {
        if !path.is_file() {
            tracing::debug!(path = %path.display(), "Env file not present; skipping");
            return;
        }
        let entries = match dotenvy::from_path_iter(path) {
            Ok(entries) => entries,
            Err(error) => {
                tracing::warn!(path = %path.display(), error = %error, "Failed to open env file");
                return;
            }
        };
        for entry in entries {
            match entry {
                Ok((key, value)) => {
                    self.vars.entry(key).or_insert(value);
                }
                Err(error) => {
                    tracing::warn!(path = %path.display(), error = %error, "Skipping env entry");
                }
            }
        }
    }

    /// Overlay the caller context on the base environment.
    pub fn for_context(&self, context: &UserContext) -> JobEnvironment {
        let mut vars = self.vars.clone();
        vars.insert(ACTOR_VAR.to_string(), context.actor().to_string());
        vars.insert(ROLES_VAR.to_string(), context.joined_roles());
        vars.insert(
            CLASSIFICATION_VAR.to_string(),
            context.classification().to_string(),
        );
        JobEnvironment { vars }
    }
}

/// Complete environment of every stage process within one job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobEnvironment {
    vars: BTreeMap<String, String>,
}

impl JobEnvironment {
    /// Build an environment from explicit variables.
    pub fn from_vars(vars: BTreeMap<String, String>) -> Self {
        Self { vars }
    }

    /// Look up one variable.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Iterate variables in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.vars.iter()
    }
}
