//! Validated stage graph.

use super::StageSpec;
use crate::core::StageName;
use std::collections::{BTreeMap, BTreeSet};

/// A validated, acyclic set of stages with a fixed execution order.
#[derive(Debug, Clone)]
pub struct StageGraph {
    name: String,
    stages: BTreeMap<StageName, StageSpec>,
    execution_order: Vec<StageName>,
}

impl StageGraph {
    pub(super) fn new(
        name: String,
        stages: BTreeMap<StageName, StageSpec>,
        stage_order: &[StageName],
    ) -> Self {
        let execution_order = topological_sort(&stages, stage_order);
        Self {
            name,
            stages,
            execution_order,
        }
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

    /// Returns the order stages run in.
    #[must_use]
    pub fn execution_order(&self) -> &[StageName] {
        &self.execution_order
    }

    /// Returns a stage specification.
    #[must_use]
    pub fn get(&self, name: StageName) -> Option<&StageSpec> {
        self.stages.get(&name)
    }

    /// Returns the specifications in execution order.
    pub fn iter(&self) -> impl Iterator<Item = &StageSpec> {
        self.execution_order
            .iter()
            .filter_map(|name| self.stages.get(name))
    }

    /// Returns the long-running stage, if the pipeline has one.
    #[must_use]
    pub fn service(&self) -> Option<StageName> {
        self.iter().find(|s| s.long_running).map(|s| s.name)
    }
}

/// Kahn's algorithm; ties are broken by declaration order.
fn topological_sort(
    stages: &BTreeMap<StageName, StageSpec>,
    stage_order: &[StageName],
) -> Vec<StageName> {
    let mut done: BTreeSet<StageName> = BTreeSet::new();
    let mut order = Vec::with_capacity(stages.len());

    while order.len() < stages.len() {
        let next = stage_order.iter().copied().find(|name| {
            !done.contains(name)
                && stages
                    .get(name)
                    .is_some_and(|s| s.dependencies.iter().all(|d| done.contains(d)))
        });
        match next {
            Some(name) => {
                done.insert(name);
                order.push(name);
            }
            // Unreachable for validated graphs.
            None => break,
        }
    }
    order
}
