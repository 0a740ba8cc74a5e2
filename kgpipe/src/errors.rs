//! Error types for the kgpipe orchestrator.
//!
//! Two families live here: orchestrator errors (`KgpipeError`), which abort
//! a command outright, and stage failures (`StageFailure`), which are the
//! typed outcome of a pipeline stage and halt the run at that stage.

use crate::core::StageName;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T, E = KgpipeError> = std::result::Result<T, E>;

/// The main error type for kgpipe operations.
#[derive(Debug, Error)]
pub enum KgpipeError {
    /// The pipeline topology is invalid.
    #[error("{0}")]
    Validation(#[from] PipelineValidationError),

    /// The orchestrator configuration could not be loaded or is invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The shared volume could not be created, read, or reset.
    #[error("Volume error: {0}")]
    Volume(String),

    /// A pipeline state transition was not allowed.
    #[error("Invalid pipeline transition: {from} -> {to}")]
    InvalidTransition {
        /// Phase the pipeline was in.
        from: String,
        /// Phase that was requested.
        to: String,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for KgpipeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// The kind of failure a stage reported.
///
/// Each kind belongs to exactly one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The configuration artifact was not available to the build stage.
    ConfigMissing,
    /// The knowledge-graph construction command failed.
    ConstructionFailure,
    /// The import stage found no complete build output.
    ArtifactsMissing,
    /// The import script failed to load.
    LoadFailure,
    /// The database server could not be brought up.
    ServerStartFailure,
}

impl FailureKind {
    /// Returns the stage this failure kind belongs to.
    #[must_use]
    pub const fn stage(self) -> StageName {
        match self {
            Self::ConfigMissing | Self::ConstructionFailure => StageName::Build,
            Self::ArtifactsMissing | Self::LoadFailure => StageName::Import,
            Self::ServerStartFailure => StageName::Deploy,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigMissing => write!(f, "ConfigMissing"),
            Self::ConstructionFailure => write!(f, "ConstructionFailure"),
            Self::ArtifactsMissing => write!(f, "ArtifactsMissing"),
            Self::LoadFailure => write!(f, "LoadFailure"),
            Self::ServerStartFailure => write!(f, "ServerStartFailure"),
        }
    }
}

/// A typed stage failure.
///
/// The message is the upstream error text, kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("Stage '{stage}' failed ({kind}): {message}")]
pub struct StageFailure {
    /// The stage that failed.
    pub stage: StageName,
    /// The failure kind.
    pub kind: FailureKind,
    /// The upstream error text.
    pub message: String,
}

impl StageFailure {
    /// Creates a failure; the stage is derived from the kind.
    #[must_use]
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            stage: kind.stage(),
            kind,
            message: message.into(),
        }
    }

    /// Creates a `ConfigMissing` failure.
    #[must_use]
    pub fn config_missing(message: impl Into<String>) -> Self {
        Self::new(FailureKind::ConfigMissing, message)
    }

    /// Creates a `ConstructionFailure` failure.
    #[must_use]
    pub fn construction(message: impl Into<String>) -> Self {
        Self::new(FailureKind::ConstructionFailure, message)
    }

    /// Creates an `ArtifactsMissing` failure.
    #[must_use]
    pub fn artifacts_missing(message: impl Into<String>) -> Self {
        Self::new(FailureKind::ArtifactsMissing, message)
    }

    /// Creates a `LoadFailure` failure.
    #[must_use]
    pub fn load(message: impl Into<String>) -> Self {
        Self::new(FailureKind::LoadFailure, message)
    }

    /// Creates a `ServerStartFailure` failure.
    #[must_use]
    pub fn server_start(message: impl Into<String>) -> Self {
        Self::new(FailureKind::ServerStartFailure, message)
    }
}

/// Metadata about a validation error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ErrorInfo {
    /// Error code (e.g., "PIPELINE-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
}

impl ErrorInfo {
    /// Creates new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }
}

/// Error raised when pipeline validation fails.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineValidationError {
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<StageName>,
    /// Optional diagnostic info.
    pub error_info: Option<ErrorInfo>,
}

impl PipelineValidationError {
    /// Creates a new pipeline validation error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stages: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<StageName>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the diagnostic info.
    #[must_use]
    pub fn with_error_info(mut self, info: ErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// Returns the diagnostic code, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.error_info.as_ref().map(|info| info.code.as_str())
    }
}

/// Error raised when a cycle is detected in the stage graph.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in pipeline: {}", format_path(cycle_path))]
pub struct CycleDetectedError {
    /// The path of stages forming the cycle.
    pub cycle_path: Vec<StageName>,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<StageName>) -> Self {
        Self { cycle_path }
    }
}

impl From<CycleDetectedError> for PipelineValidationError {
    fn from(err: CycleDetectedError) -> Self {
        let info = ErrorInfo::new(
            "PIPELINE-CYCLE",
            format!("Pipeline contains a dependency cycle: {}", format_path(&err.cycle_path)),
        )
        .with_fix_hint("Remove one of the dependencies in the cycle to break it.");

        Self {
            message: err.to_string(),
            stages: err.cycle_path,
            error_info: Some(info),
        }
    }
}

fn format_path(path: &[StageName]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}
