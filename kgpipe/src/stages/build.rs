//! Build stage: stages the config artifact and runs graph construction.

use super::{working_dir, Stage, ENV_CONFIG, ENV_OUTPUT_DIR, ENV_VOLUME};
use crate::context::StageContext;
use crate::core::{StageName, StageOutput};
use crate::errors::StageFailure;
use crate::process::{CommandSpec, ProcessLauncher};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Runs the knowledge-graph construction command.
///
/// Output is written into the volume's staging directory and published into
/// the artifacts directory only after the command exits 0 and the import
/// script exists, so a failed build never exposes a partial script.
#[derive(Debug, Clone)]
pub struct BuildStage {
    launcher: Arc<dyn ProcessLauncher>,
}

impl BuildStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self { launcher }
    }
}

#[async_trait]
impl Stage for BuildStage {
    fn name(&self) -> StageName {
        StageName::Build
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        let config = ctx.config();
        let volume = ctx.volume();

        let active_config = match config.config_artifact().stage() {
            Ok(path) => path,
            Err(failure) => return StageOutput::fail(failure),
        };
        debug!(config = %active_config.display(), "Staged configuration artifact");

        if ctx.is_cancelled() {
            return StageOutput::cancel(ctx.cancel_reason());
        }

        let staging = match volume.prepare_staging() {
            Ok(dir) => dir,
            Err(e) => {
                return StageOutput::fail(StageFailure::construction(format!(
                    "cannot prepare staging directory: {e}"
                )))
            }
        };

        let mut spec = match CommandSpec::from_argv(&config.build.command) {
            Ok(spec) => spec
                .env(ENV_CONFIG, &active_config)
                .env(ENV_OUTPUT_DIR, &staging)
                .env(ENV_VOLUME, volume.root()),
            Err(e) => return StageOutput::fail(StageFailure::construction(e.to_string())),
        };
        if let Some(dir) = working_dir(config.base_dir()) {
            spec = spec.current_dir(dir);
        }

        let report = match self
            .launcher
            .run(StageName::Build, &spec, &ctx.log_path(), ctx.cancel_token())
            .await
        {
            Ok(report) => report,
            Err(e) => {
                return StageOutput::fail(StageFailure::construction(format!(
                    "cannot start {}: {e}",
                    spec.program
                )))
            }
        };
        if report.cancelled {
            return StageOutput::cancel(ctx.cancel_reason());
        }
        if !report.success() {
            return StageOutput::fail(StageFailure::construction(
                report.failure_message(&spec.program),
            ))
            .with_exit_code(report.code);
        }

        let script_name = &config.build.import_script;
        if !staging.join(script_name).is_file() {
            return StageOutput::fail(StageFailure::construction(format!(
                "{} exited 0 but did not produce {script_name}",
                spec.program
            )))
            .with_exit_code(report.code);
        }

        let manifest = match volume.publish_staging(script_name) {
            Ok(manifest) => manifest,
            Err(e) => {
                return StageOutput::fail(StageFailure::construction(format!(
                    "cannot publish build output: {e}"
                )))
                .with_exit_code(report.code)
            }
        };
        info!(
            run_id = %ctx.run_id(),
            artifacts = manifest.files.len(),
            sha256 = %manifest.import_script_sha256,
            "Published build artifacts"
        );

        let mut data = HashMap::new();
        data.insert(
            "import_script".to_string(),
            json!(volume.import_script_path(script_name)),
        );
        data.insert(
            "import_script_sha256".to_string(),
            json!(manifest.import_script_sha256),
        );
        data.insert("artifacts".to_string(), json!(manifest.files));
        StageOutput::ok(data).with_exit_code(report.code)
    }
}
