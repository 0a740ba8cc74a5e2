//! Core domain model types for kgpipe.
//!
//! This module contains the fundamental types used throughout the orchestrator:
//! - Stage names and execution statuses
//! - The tagged stage output consumed by the orchestrator loop
//! - The per-run pipeline phase state machine

mod output;
mod phase;
mod status;

pub use output::StageOutput;
pub use phase::PipelinePhase;
pub use status::{StageName, StageStatus};
