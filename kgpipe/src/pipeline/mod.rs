//! Pipeline declaration and orchestration.
//!
//! A pipeline is declared with [`PipelineBuilder`], validated into a
//! [`StageGraph`], and run by the [`Orchestrator`].

mod builder;
mod graph;
mod orchestrator;
mod spec;

pub use builder::PipelineBuilder;
pub use graph::StageGraph;
pub use orchestrator::{
    standard_graph, Orchestrator, PipelineReport, PipelineStatus, RunOptions, TeardownMode,
    TeardownReport,
};
pub use spec::StageSpec;
