//! Import stage: loads the generated script into a fresh database.

use super::{Stage, ENV_ARTIFACTS_DIR, ENV_DATABASE_DIR, ENV_IMPORT_SCRIPT};
use crate::context::StageContext;
use crate::core::{StageName, StageOutput};
use crate::errors::StageFailure;
use crate::process::{CommandSpec, ProcessLauncher};
use crate::volume::{sha256_file, ArtifactManifest, ImportMarker};
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

/// Runs the bulk-load command against the published import script.
///
/// The only precondition is that the script exists. Whatever else sits in
/// the artifacts directory, including leftovers from earlier builds, is
/// loaded as-is.
#[derive(Debug, Clone)]
pub struct ImportStage {
    launcher: Arc<dyn ProcessLauncher>,
}

impl ImportStage {
    /// Creates the stage.
    #[must_use]
    pub fn new(launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self { launcher }
    }
}

#[async_trait]
impl Stage for ImportStage {
    fn name(&self) -> StageName {
        StageName::Import
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        let config = ctx.config();
        let volume = ctx.volume();

        let script = volume.import_script_path(&config.build.import_script);
        if !script.is_file() {
            return StageOutput::fail(StageFailure::artifacts_missing(format!(
                "import script not found: {}",
                script.display()
            )));
        }
        let digest = match sha256_file(&script) {
            Ok(digest) => digest,
            Err(e) => {
                return StageOutput::fail(StageFailure::artifacts_missing(format!(
                    "cannot read {}: {e}",
                    script.display()
                )))
            }
        };

        match ArtifactManifest::load(volume) {
            Ok(Some(manifest)) if manifest.import_script_sha256 != digest => warn!(
                expected = %manifest.import_script_sha256,
                actual = %digest,
                "Import script differs from the last published build"
            ),
            Ok(Some(_)) => {}
            Ok(None) => warn!("No build manifest found; artifacts may be stale"),
            Err(e) => warn!(error = %e, "Cannot read build manifest"),
        }

        let database = match volume.prepare_fresh_database() {
            Ok(dir) => dir,
            Err(e) => {
                return StageOutput::fail(StageFailure::load(format!(
                    "cannot prepare database directory: {e}"
                )))
            }
        };

        let artifacts = volume.artifacts_dir();
        let spec = match CommandSpec::from_argv(&config.import.command) {
            Ok(spec) => spec
                .arg(script.to_string_lossy())
                .env(ENV_IMPORT_SCRIPT, &script)
                .env(ENV_ARTIFACTS_DIR, &artifacts)
                .env(ENV_DATABASE_DIR, &database)
                .current_dir(&artifacts),
            Err(e) => return StageOutput::fail(StageFailure::load(e.to_string())),
        };

        let report = match self
            .launcher
            .run(StageName::Import, &spec, &ctx.log_path(), ctx.cancel_token())
            .await
        {
            Ok(report) => report,
            Err(e) => {
                return StageOutput::fail(StageFailure::load(format!(
                    "cannot start {}: {e}",
                    spec.program
                )))
            }
        };
        if report.cancelled {
            return StageOutput::cancel(ctx.cancel_reason());
        }
        if !report.success() {
            return StageOutput::fail(StageFailure::load(report.failure_message(&spec.program)))
                .with_exit_code(report.code);
        }

        if let Err(e) = ImportMarker::new(ctx.run_id(), &digest).store(volume) {
            return StageOutput::fail(StageFailure::load(format!(
                "cannot write import completion marker: {e}"
            )))
            .with_exit_code(report.code);
        }
        info!(run_id = %ctx.run_id(), sha256 = %digest, "Database populated");

        let mut data = HashMap::new();
        data.insert("import_script_sha256".to_string(), json!(digest));
        data.insert("database_dir".to_string(), json!(database));
        StageOutput::ok(data).with_exit_code(report.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::errors::FailureKind;
    use crate::process::TokioLauncher;
    use crate::volume::SharedVolume;
    use uuid::Uuid;

    const SCRIPT: &str = "neo4j-admin-import-call.sh";

    fn context(dir: &std::path::Path) -> StageContext {
        let config = PipelineConfig::default().with_base_dir(dir);
        let volume = SharedVolume::open_or_create(dir.join("volume")).unwrap();
        StageContext::new(Uuid::new_v4(), StageName::Import, volume, Arc::new(config))
    }

    fn stage() -> ImportStage {
        ImportStage::new(Arc::new(TokioLauncher::new()))
    }

    fn publish(ctx: &StageContext, script: &str) {
        let staging = ctx.volume().prepare_staging().unwrap();
        std::fs::write(staging.join("nodes.csv"), "id\n1\n").unwrap();
        std::fs::write(staging.join(SCRIPT), script).unwrap();
        ctx.volume().publish_staging(SCRIPT).unwrap();
    }

    #[tokio::test]
    async fn test_import_populates_database_and_writes_marker() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        publish(&ctx, "cp nodes.csv \"$KGPIPE_DATABASE_DIR/graph.db\"\n");
        std::fs::write(ctx.volume().database_dir().join("stale.db"), "old").unwrap();

        let output = stage().execute(&ctx).await;

        assert!(output.is_success(), "{output:?}");
        let database = ctx.volume().database_dir();
        assert!(database.join("graph.db").is_file());
        assert!(!database.join("stale.db").exists());
        let marker = ImportMarker::load(ctx.volume()).unwrap().unwrap();
        assert_eq!(marker.run_id, ctx.run_id());
        assert_eq!(
            output.get("import_script_sha256"),
            Some(&json!(marker.import_script_sha256))
        );
    }

    #[tokio::test]
    async fn test_import_without_script_is_artifacts_missing() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());

        let output = stage().execute(&ctx).await;

        assert_eq!(output.failure.unwrap().kind, FailureKind::ArtifactsMissing);
        assert!(!ctx.log_path().exists());
    }

    #[tokio::test]
    async fn test_import_script_error_is_load_failure() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        publish(&ctx, "echo 'Input error: nodes.csv:2 bad header' >&2\nexit 1\n");

        let output = stage().execute(&ctx).await;

        let failure = output.failure.unwrap();
        assert_eq!(failure.kind, FailureKind::LoadFailure);
        assert!(failure.message.contains("nodes.csv:2 bad header"));
        assert!(!ctx.volume().import_marker_path().exists());
    }
}
