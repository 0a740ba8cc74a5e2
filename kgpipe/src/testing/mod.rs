//! Testing utilities for kgpipe pipelines.
//!
//! This module provides:
//! - a scripted process launcher and readiness probe
//! - scratch workspaces with a config template
//! - assertions on pipeline reports

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{assert_deploy_up, assert_launch_counts, assert_stage_failed};
pub use fixtures::{build_run, scripted_happy_path, TestWorkspace, TEST_PORT};
pub use mocks::{MockLauncher, MockProbe, MockRun, MockService, MockSpawn, MockWrite};
