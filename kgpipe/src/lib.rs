//! # kgpipe
//!
//! A staged orchestrator for knowledge-graph pipelines.
//!
//! Three dependent processes run in strict sequence over one shared volume:
//!
//! - **build** runs knowledge-graph construction and publishes import
//!   artifacts plus a generated import script
//! - **import** loads that script into a fresh database directory
//! - **deploy** starts the database server and reports `up` once it accepts
//!   TCP connections
//!
//! A failing stage halts the run before any downstream stage starts. Volume
//! content persists across runs and is only cleared by an explicit reset.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use kgpipe::prelude::*;
//! use std::sync::Arc;
//!
//! let config = PipelineConfig::discover(None, &std::env::current_dir()?)?;
//! let orchestrator = Orchestrator::standard(
//!     config,
//!     Arc::new(TokioLauncher::new()),
//!     Arc::new(TcpProbe::default()),
//! )?;
//!
//! let report = orchestrator.run_pipeline(RunOptions { reset: false }).await?;
//! std::process::exit(report.exit_code());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod context;
pub mod core;
pub mod errors;
pub mod events;
pub mod pipeline;
pub mod process;
pub mod stages;
pub mod testing;
pub mod volume;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{ConfigArtifact, PipelineConfig, CONFIG_FILE_NAME};
    pub use crate::context::StageContext;
    pub use crate::core::{PipelinePhase, StageName, StageOutput, StageStatus};
    pub use crate::errors::{
        CycleDetectedError, ErrorInfo, FailureKind, KgpipeError, PipelineValidationError,
        StageFailure,
    };
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::pipeline::{
        Orchestrator, PipelineBuilder, PipelineReport, PipelineStatus, RunOptions, StageGraph,
        StageSpec, TeardownMode, TeardownReport,
    };
    pub use crate::process::{
        CommandSpec, HealthProbe, ProcessLauncher, TcpProbe, TokioLauncher,
    };
    pub use crate::stages::{BuildStage, DeployStage, ImportStage, Stage};
    pub use crate::volume::{RunRecord, SharedVolume};
}
