//! Assertions on pipeline reports.

use super::MockLauncher;
use crate::core::{PipelinePhase, StageName, StageStatus};
use crate::errors::FailureKind;
use crate::pipeline::PipelineReport;

/// Asserts how often each stage was launched.
pub fn assert_launch_counts(launcher: &MockLauncher, build: usize, import: usize, deploy: usize) {
    let actual = (
        launcher.launches(StageName::Build),
        launcher.launches(StageName::Import),
        launcher.launches(StageName::Deploy),
    );
    assert_eq!(
        actual,
        (build, import, deploy),
        "Expected (build, import, deploy) launches {:?}, got {:?}",
        (build, import, deploy),
        actual
    );
}

/// Asserts the run halted with a failure of `kind`.
pub fn assert_stage_failed(report: &PipelineReport, kind: FailureKind) {
    let stage = kind.stage();
    assert_eq!(
        report.failed_stage(),
        Some(stage),
        "Expected stage '{stage}' to fail, phase was {}",
        report.phase
    );
    let failure = report
        .failure()
        .unwrap_or_else(|| panic!("Expected a {kind} failure, got none"));
    assert_eq!(failure.kind, kind, "Unexpected failure: {failure}");
    assert_eq!(failure.stage, stage);
    assert_eq!(report.exit_code(), stage.exit_code());
    assert_eq!(report.phase, PipelinePhase::finished(stage, false));
}

/// Asserts the run ended with deploy serving.
pub fn assert_deploy_up(report: &PipelineReport) {
    assert!(
        report.is_success(),
        "Expected a healthy pipeline, got phase {} ({:?})",
        report.phase,
        report.failure()
    );
    assert_eq!(report.phase, PipelinePhase::DeployUp);
    assert_eq!(
        report.output(StageName::Deploy).map(|o| o.status),
        Some(StageStatus::Up)
    );
    assert_eq!(report.exit_code(), 0);
}
