use std::path::PathBuf;

use thiserror::Error;

/// Configuration problems: malformed YAML, schema mismatches, references to
/// unknown tasks or plugins. Always fatal at load time, never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid yaml in {path}: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("unsupported config version {found}, only version 1 is supported")]
    UnsupportedVersion { found: u32 },

    #[error("unknown plugin '{plugin}' in pipeline stage '{stage}'")]
    UnknownPlugin { plugin: String, stage: String },

    #[error("invalid arguments for plugin '{plugin}' in stage '{stage}': {reason}")]
    BadPluginArgs {
        plugin: String,
        stage: String,
        reason: String,
    },

    #[error("invalid template '{template}': {reason}")]
    BadTemplate { template: String, reason: String },

    #[error("run_if of stage '{stage}' must resolve to a boolean, got {got}")]
    BadRunIf { stage: String, got: String },

    #[error("task '{task}' not found in repository")]
    TaskNotFound { task: String },

    #[error("{0}")]
    Invalid(String),
}

/// Course structure problems: template rules violated, missing sibling files,
/// unbalanced solution markers. Fatal before any execution.
#[derive(Debug, Error)]
pub enum StructureError {
    #[error("template {template} has no sibling file or folder to replace")]
    MissingSibling { template: PathBuf },

    #[error("task '{task}' has unbalanced solution markers in {file}")]
    UnbalancedMarkers { task: String, file: PathBuf },

    #[error("task '{task}' has nested solution markers in {file}")]
    NestedMarkers { task: String, file: PathBuf },

    #[error("task '{task}' violates the '{policy}' template policy: {reason}")]
    PolicyConflict {
        task: String,
        policy: String,
        reason: String,
    },

    #[error("export failed: {0}")]
    Export(String),

    #[error("i/o error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Why a plugin invocation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    /// Child process exited non-zero.
    ProcessExit(i32),
    /// Wall-clock timeout expired and the process tree was killed.
    Timeout,
    /// A forbidden pattern matched a student file.
    ForbiddenPattern,
    /// Invalid plugin input discovered at run time (e.g. mismatched weights).
    BadInput,
    /// HTTP reporting failed (after retries, where applicable).
    Http,
    /// The test-report channel produced no usable payload.
    Report,
    /// The sandbox binary is unavailable and fallback was not allowed.
    Sandbox,
    /// Filesystem operation failed.
    Io,
}

/// A plugin invocation failed. The pipeline runner converts these into stage
/// results according to the stage's fail policy; they never escape the runner.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct PluginFailure {
    pub message: String,
    pub output: String,
    pub percentage: f64,
    pub cause: FailureCause,
}

impl PluginFailure {
    pub fn new(cause: FailureCause, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            output: String::new(),
            percentage: 0.0,
            cause,
        }
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = output.into();
        self
    }

    pub fn with_percentage(mut self, percentage: f64) -> Self {
        self.percentage = percentage;
        self
    }
}

/// A grading run failed: the global pipeline broke, or at least one task
/// pipeline finished with `failed = true`.
#[derive(Debug, Error)]
pub enum TestingError {
    #[error("global pipeline failed")]
    GlobalPipelineFailed,

    #[error("task pipelines failed: {}", .0.join(", "))]
    TasksFailed(Vec<String>),

    #[error("{0}")]
    Other(String),
}

/// Score store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task '{task}' is not part of the course schedule")]
    UnknownTask { task: String },

    #[error("submission limit of {limit} reached for task '{task}'")]
    SubmissionLimit { task: String, limit: u32 },

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Repository host failures, surfaced through the `RepoHost` interface.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("user '{0}' not found")]
    UserNotFound(String),

    #[error("repository '{0}' not found")]
    RepoNotFound(String),

    #[error("host request failed: {0}")]
    Request(String),
}

/// Top-level error for the CLI. Every failure exits non-zero; the variants
/// exist so the CLI can colour the error class distinctly.
#[derive(Debug, Error)]
pub enum GraderError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Structure(#[from] StructureError),

    #[error(transparent)]
    Testing(#[from] TestingError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}
