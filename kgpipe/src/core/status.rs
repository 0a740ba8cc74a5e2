//! Stage name and status enums.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One of the three ordered units of work in a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    /// Runs knowledge-graph construction and publishes import artifacts.
    Build,
    /// Loads the published artifacts into a fresh database.
    Import,
    /// Serves the populated database.
    Deploy,
}

impl StageName {
    /// All stages in pipeline order.
    pub const ALL: [Self; 3] = [Self::Build, Self::Import, Self::Deploy];

    /// Returns the lowercase stage name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Import => "import",
            Self::Deploy => "deploy",
        }
    }

    /// Returns the process exit code reported when this stage fails.
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::Build => 10,
            Self::Import => 20,
            Self::Deploy => 30,
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "build" => Ok(Self::Build),
            "import" => Ok(Self::Import),
            "deploy" => Ok(Self::Deploy),
            other => Err(format!(
                "unknown stage '{other}' (expected one of: build, import, deploy)"
            )),
        }
    }
}

/// The execution status of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Stage has not started.
    Pending,
    /// Stage is currently running.
    Running,
    /// Stage process exited successfully.
    Succeeded,
    /// Stage failed.
    Failed,
    /// Long-running stage is healthy and serving.
    Up,
    /// Stage was interrupted by cancellation.
    Cancelled,
    /// Long-running stage was stopped by the operator.
    Stopped,
}

impl Default for StageStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Up => write!(f, "up"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

impl StageStatus {
    /// Returns true if downstream stages may start after this status.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Up)
    }

    /// Returns true if the status indicates failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled)
    }

    /// Returns true if the stage will not change status on its own.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::Cancelled | Self::Stopped
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_name_display_and_parse() {
        for stage in StageName::ALL {
            assert_eq!(stage.to_string().parse::<StageName>().unwrap(), stage);
        }
        assert_eq!(" Deploy ".parse::<StageName>().unwrap(), StageName::Deploy);
        assert!("serve".parse::<StageName>().is_err());
    }

    #[test]
    fn test_stage_name_exit_codes_are_distinct() {
        assert_eq!(StageName::Build.exit_code(), 10);
        assert_eq!(StageName::Import.exit_code(), 20);
        assert_eq!(StageName::Deploy.exit_code(), 30);
    }

    #[test]
    fn test_stage_name_order() {
        let mut stages = vec![StageName::Deploy, StageName::Build, StageName::Import];
        stages.sort();
        assert_eq!(stages, StageName::ALL.to_vec());
    }

    #[test]
    fn test_stage_status_predicates() {
        assert!(StageStatus::Succeeded.is_success());
        assert!(StageStatus::Up.is_success());
        assert!(!StageStatus::Up.is_terminal());
        assert!(StageStatus::Failed.is_failure());
        assert!(StageStatus::Cancelled.is_failure());
        assert!(!StageStatus::Pending.is_terminal());
        assert!(!StageStatus::Running.is_terminal());
    }

    #[test]
    fn test_stage_status_serialize() {
        let json = serde_json::to_string(&StageStatus::Succeeded).unwrap();
        assert_eq!(json, r#""succeeded""#);

        let deserialized: StageStatus = serde_json::from_str(r#""up""#).unwrap();
        assert_eq!(deserialized, StageStatus::Up);
    }
}
