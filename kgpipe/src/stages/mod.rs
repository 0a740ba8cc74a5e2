//! Stage trait and the three pipeline stages.
//!
//! A stage turns its context into a tagged [`StageOutput`]; it never returns
//! a bare exit code and never decides whether downstream stages run.

mod build;
mod deploy;
mod import;

pub use build::BuildStage;
pub use deploy::DeployStage;
pub use import::ImportStage;

use crate::context::StageContext;
use crate::core::{StageName, StageOutput};
use async_trait::async_trait;
use std::fmt::Debug;
use std::path::Path;

/// Environment variable naming the active configuration artifact.
pub const ENV_CONFIG: &str = "KGPIPE_CONFIG";
/// Environment variable naming the directory construction output goes to.
pub const ENV_OUTPUT_DIR: &str = "KGPIPE_OUTPUT_DIR";
/// Environment variable naming the shared volume root.
pub const ENV_VOLUME: &str = "KGPIPE_VOLUME";
/// Environment variable naming the import script.
pub const ENV_IMPORT_SCRIPT: &str = "KGPIPE_IMPORT_SCRIPT";
/// Environment variable naming the published artifacts directory.
pub const ENV_ARTIFACTS_DIR: &str = "KGPIPE_ARTIFACTS_DIR";
/// Environment variable naming the database directory.
pub const ENV_DATABASE_DIR: &str = "KGPIPE_DATABASE_DIR";
/// Environment variable carrying the port the server binds.
pub const ENV_PORT: &str = "KGPIPE_PORT";

/// Trait for pipeline stages.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// Returns the stage name.
    fn name(&self) -> StageName;

    /// Executes the stage.
    async fn execute(&self, ctx: &StageContext) -> StageOutput;
}

/// Returns the directory configured paths are relative to, if it is set.
fn working_dir(base: &Path) -> Option<&Path> {
    (!base.as_os_str().is_empty()).then_some(base)
}
