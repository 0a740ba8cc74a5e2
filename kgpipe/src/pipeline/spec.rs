//! Stage specifications.

use crate::core::StageName;
use crate::errors::{ErrorInfo, PipelineValidationError};
use crate::stages::Stage;
use std::collections::BTreeSet;
use std::sync::Arc;

/// A stage declared in a pipeline.
#[derive(Debug, Clone)]
pub struct StageSpec {
    /// The stage name.
    pub name: StageName,
    /// The stage implementation.
    pub runner: Arc<dyn Stage>,
    /// Stages that must succeed before this one starts.
    pub dependencies: BTreeSet<StageName>,
    /// Whether the stage stays up instead of exiting.
    pub long_running: bool,
}

impl StageSpec {
    /// Creates a specification named after its runner.
    #[must_use]
    pub fn new(runner: Arc<dyn Stage>) -> Self {
        Self {
            name: runner.name(),
            runner,
            dependencies: BTreeSet::new(),
            long_running: false,
        }
    }

    /// Adds a dependency.
    #[must_use]
    pub fn with_dependency(mut self, dep: StageName) -> Self {
        self.dependencies.insert(dep);
        self
    }

    /// Sets the dependencies.
    #[must_use]
    pub fn with_dependencies(mut self, deps: impl IntoIterator<Item = StageName>) -> Self {
        self.dependencies = deps.into_iter().collect();
        self
    }

    /// Marks the stage as a long-running service.
    #[must_use]
    pub fn long_running(mut self) -> Self {
        self.long_running = true;
        self
    }

    /// Validates the specification on its own.
    ///
    /// # Errors
    ///
    /// Returns an error if the stage depends on itself.
    pub fn validate(&self) -> Result<(), PipelineValidationError> {
        if self.dependencies.contains(&self.name) {
            return Err(PipelineValidationError::new(format!(
                "Stage '{}' cannot depend on itself",
                self.name
            ))
            .with_stages(vec![self.name])
            .with_error_info(ErrorInfo::new(
                "PIPELINE-SELF_DEP",
                format!("Stage '{}' lists itself as a dependency", self.name),
            )));
        }
        Ok(())
    }
}
