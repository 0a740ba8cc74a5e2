//! Pipeline builder with validation.

use super::{StageGraph, StageSpec};
use crate::core::StageName;
use crate::errors::{CycleDetectedError, ErrorInfo, PipelineValidationError};
use std::collections::{BTreeMap, BTreeSet};

/// Builder for creating validated stage graphs.
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    name: String,
    stages: BTreeMap<StageName, StageSpec>,
    stage_order: Vec<StageName>,
}

impl PipelineBuilder {
    /// Creates a new pipeline builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: BTreeMap::new(),
            stage_order: Vec::new(),
        }
    }

    /// Adds a stage.
    ///
    /// Dependencies are resolved when the graph is built, so stages may be
    /// declared in any order.
    ///
    /// # Errors
    ///
    /// Returns an error if the stage is already declared or depends on
    /// itself.
    pub fn stage(mut self, spec: StageSpec) -> Result<Self, PipelineValidationError> {
        spec.validate()?;
        if self.stages.contains_key(&spec.name) {
            return Err(PipelineValidationError::new(format!(
                "Stage '{}' is declared more than once",
                spec.name
            ))
            .with_stages(vec![spec.name])
            .with_error_info(
                ErrorInfo::new("PIPELINE-DUPLICATE", format!("Duplicate stage '{}'", spec.name))
                    .with_fix_hint("Declare each stage exactly once."),
            ));
        }
        self.stage_order.push(spec.name);
        self.stages.insert(spec.name, spec);
        Ok(self)
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Validates the declared stages and builds the graph.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipeline is empty, a dependency is undeclared,
    /// the dependencies form a cycle, or a long-running stage is anything but
    /// the single final stage.
    pub fn build(self) -> Result<StageGraph, PipelineValidationError> {
        if self.stages.is_empty() {
            return Err(PipelineValidationError::new("Pipeline has no stages")
                .with_error_info(
                    ErrorInfo::new("PIPELINE-EMPTY", "Cannot build an empty pipeline")
                        .with_fix_hint("Add at least one stage to the pipeline before building."),
                ));
        }

        for spec in self.stages.values() {
            for dep in &spec.dependencies {
                if !self.stages.contains_key(dep) {
                    return Err(PipelineValidationError::new(format!(
                        "Stage '{}' depends on unknown stage '{dep}'",
                        spec.name
                    ))
                    .with_stages(vec![spec.name, *dep])
                    .with_error_info(
                        ErrorInfo::new("PIPELINE-MISSING_DEP", format!("Dependency '{dep}' not found"))
                            .with_fix_hint("Declare every stage another stage depends on."),
                    ));
                }
            }
        }

        self.detect_cycles()?;
        self.check_services()?;

        Ok(StageGraph::new(self.name, self.stages, &self.stage_order))
    }

    fn check_services(&self) -> Result<(), PipelineValidationError> {
        let services: Vec<StageName> = self
            .stages
            .values()
            .filter(|s| s.long_running)
            .map(|s| s.name)
            .collect();
        if services.len() > 1 {
            return Err(PipelineValidationError::new(
                "At most one stage may stay running after the pipeline completes",
            )
            .with_stages(services)
            .with_error_info(ErrorInfo::new(
                "PIPELINE-SERVICE",
                "More than one long-running stage",
            )));
        }
        for service in services {
            let dependents: Vec<StageName> = self
                .stages
                .values()
                .filter(|s| s.dependencies.contains(&service))
                .map(|s| s.name)
                .collect();
            if !dependents.is_empty() {
                return Err(PipelineValidationError::new(format!(
                    "Long-running stage '{service}' cannot have dependents"
                ))
                .with_stages(dependents)
                .with_error_info(
                    ErrorInfo::new(
                        "PIPELINE-SERVICE",
                        format!("Stages depend on long-running stage '{service}'"),
                    )
                    .with_fix_hint("A long-running stage never exits, so nothing can wait on it."),
                ));
            }
        }
        Ok(())
    }

    fn detect_cycles(&self) -> Result<(), CycleDetectedError> {
        let mut visited = BTreeSet::new();
        let mut rec_stack = BTreeSet::new();
        let mut path = Vec::new();

        for &name in self.stages.keys() {
            if !visited.contains(&name) {
                if let Some(cycle) = self.dfs_cycle(name, &mut visited, &mut rec_stack, &mut path) {
                    return Err(CycleDetectedError::new(cycle));
                }
            }
        }
        Ok(())
    }

    fn dfs_cycle(
        &self,
        node: StageName,
        visited: &mut BTreeSet<StageName>,
        rec_stack: &mut BTreeSet<StageName>,
        path: &mut Vec<StageName>,
    ) -> Option<Vec<StageName>> {
        visited.insert(node);
        rec_stack.insert(node);
        path.push(node);

        if let Some(spec) = self.stages.get(&node) {
            for &dep in &spec.dependencies {
                if !visited.contains(&dep) {
                    if let Some(cycle) = self.dfs_cycle(dep, visited, rec_stack, path) {
                        return Some(cycle);
                    }
                } else if rec_stack.contains(&dep) {
                    let start = path.iter().position(|&n| n == dep).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(dep);
                    return Some(cycle);
                }
            }
        }

        path.pop();
        rec_stack.remove(&node);
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StageContext;
    use crate::core::StageOutput;
    use crate::stages::Stage;
    use async_trait::async_trait;
    use std::sync::Arc;

    #[derive(Debug)]
    struct Named(StageName);

    #[async_trait]
    impl Stage for Named {
        fn name(&self) -> StageName {
            self.0
        }

        async fn execute(&self, _ctx: &StageContext) -> StageOutput {
            StageOutput::ok_empty()
        }
    }

    fn spec(name: StageName) -> StageSpec {
        StageSpec::new(Arc::new(Named(name)))
    }

    #[test]
    fn test_builder_orders_by_dependency() {
        let graph = PipelineBuilder::new("kg")
            .stage(spec(StageName::Deploy).with_dependency(StageName::Import).long_running())
            .unwrap()
            .stage(spec(StageName::Build))
            .unwrap()
            .stage(spec(StageName::Import).with_dependency(StageName::Build))
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(
            graph.execution_order(),
            &[StageName::Build, StageName::Import, StageName::Deploy]
        );
    }

    #[test]
    fn test_builder_empty_build() {
        let err = PipelineBuilder::new("kg").build().unwrap_err();
        assert_eq!(err.code(), Some("PIPELINE-EMPTY"));
    }

    #[test]
    fn test_builder_missing_dependency() {
        let err = PipelineBuilder::new("kg")
            .stage(spec(StageName::Import).with_dependency(StageName::Build))
            .unwrap()
            .build()
            .unwrap_err();

        assert_eq!(err.code(), Some("PIPELINE-MISSING_DEP"));
        assert_eq!(err.stages, vec![StageName::Import, StageName::Build]);
    }

    #[test]
    fn test_builder_duplicate_stage() {
        let err = PipelineBuilder::new("kg")
            .stage(spec(StageName::Build))
            .unwrap()
            .stage(spec(StageName::Build))
            .unwrap_err();

        assert_eq!(err.code(), Some("PIPELINE-DUPLICATE"));
    }

    #[test]
    fn test_builder_self_dependency() {
        let err = PipelineBuilder::new("kg")
            .stage(spec(StageName::Build).with_dependency(StageName::Build))
            .unwrap_err();

        assert_eq!(err.code(), Some("PIPELINE-SELF_DEP"));
    }

    #[test]
    fn test_builder_cycle_detection() {
        let err = PipelineBuilder::new("kg")
            .stage(spec(StageName::Build).with_dependency(StageName::Import))
            .unwrap()
            .stage(spec(StageName::Import).with_dependency(StageName::Build))
            .unwrap()
            .build()
            .unwrap_err();

        assert_eq!(err.code(), Some("PIPELINE-CYCLE"));
        assert_eq!(err.stages.first(), err.stages.last());
    }

    #[test]
    fn test_builder_rejects_dependent_of_service() {
        let err = PipelineBuilder::new("kg")
            .stage(spec(StageName::Deploy).long_running())
            .unwrap()
            .stage(spec(StageName::Import).with_dependency(StageName::Deploy))
            .unwrap()
            .build()
            .unwrap_err();

        assert_eq!(err.code(), Some("PIPELINE-SERVICE"));
    }
}
