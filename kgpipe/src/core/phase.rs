//! Per-run pipeline phase state machine.

use super::StageName;
use crate::errors::KgpipeError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The phase a pipeline run is in.
///
/// Every `*Failed` phase, `DeployUp`, and `Cancelled` are terminal for the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelinePhase {
    /// No stage has started.
    NotStarted,
    /// Build is running.
    BuildRunning,
    /// Build failed.
    BuildFailed,
    /// Build succeeded.
    BuildOk,
    /// Import is running.
    ImportRunning,
    /// Import failed.
    ImportFailed,
    /// Import succeeded.
    ImportOk,
    /// Deploy is starting.
    DeployRunning,
    /// Deploy failed to come up.
    DeployFailed,
    /// Deploy is serving.
    DeployUp,
    /// The run was interrupted before deploy came up.
    Cancelled,
}

impl Default for PipelinePhase {
    fn default() -> Self {
        Self::NotStarted
    }
}

impl fmt::Display for PipelinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NotStarted => "NOT_STARTED",
            Self::BuildRunning => "BUILD_RUNNING",
            Self::BuildFailed => "BUILD_FAILED",
            Self::BuildOk => "BUILD_OK",
            Self::ImportRunning => "IMPORT_RUNNING",
            Self::ImportFailed => "IMPORT_FAILED",
            Self::ImportOk => "IMPORT_OK",
            Self::DeployRunning => "DEPLOY_RUNNING",
            Self::DeployFailed => "DEPLOY_FAILED",
            Self::DeployUp => "DEPLOY_UP",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(text)
    }
}

impl PipelinePhase {
    /// The phase entered when `stage` starts.
    #[must_use]
    pub const fn running(stage: StageName) -> Self {
        match stage {
            StageName::Build => Self::BuildRunning,
            StageName::Import => Self::ImportRunning,
            StageName::Deploy => Self::DeployRunning,
        }
    }

    /// The phase entered when `stage` finishes.
    #[must_use]
    pub const fn finished(stage: StageName, success: bool) -> Self {
        match (stage, success) {
            (StageName::Build, true) => Self::BuildOk,
            (StageName::Build, false) => Self::BuildFailed,
            (StageName::Import, true) => Self::ImportOk,
            (StageName::Import, false) => Self::ImportFailed,
            (StageName::Deploy, true) => Self::DeployUp,
            (StageName::Deploy, false) => Self::DeployFailed,
        }
    }

    /// Phases reachable from this one.
    #[must_use]
    pub fn allowed_transitions(self) -> Vec<Self> {
        match self {
            Self::NotStarted => vec![Self::BuildRunning, Self::Cancelled],
            Self::BuildRunning => vec![Self::BuildOk, Self::BuildFailed, Self::Cancelled],
            Self::BuildOk => vec![Self::ImportRunning, Self::Cancelled],
            Self::ImportRunning => vec![Self::ImportOk, Self::ImportFailed, Self::Cancelled],
            Self::ImportOk => vec![Self::DeployRunning, Self::Cancelled],
            Self::DeployRunning => vec![Self::DeployUp, Self::DeployFailed, Self::Cancelled],
            Self::BuildFailed
            | Self::ImportFailed
            | Self::DeployFailed
            | Self::DeployUp
            | Self::Cancelled => vec![],
        }
    }

    /// Moves to `next`, rejecting transitions the state machine does not allow.
    ///
    /// # Errors
    ///
    /// Returns [`KgpipeError::InvalidTransition`] for a disallowed transition.
    pub fn transition(self, next: Self) -> Result<Self, KgpipeError> {
        if self.allowed_transitions().contains(&next) {
            Ok(next)
        } else {
            Err(KgpipeError::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }

    /// Returns true if the run cannot progress further.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self.allowed_transitions().is_empty()
    }

    /// Returns the stage that failed, if the run ended in a failure phase.
    #[must_use]
    pub const fn failed_stage(self) -> Option<StageName> {
        match self {
            Self::BuildFailed => Some(StageName::Build),
            Self::ImportFailed => Some(StageName::Import),
            Self::DeployFailed => Some(StageName::Deploy),
            _ => None,
        }
    }
}
