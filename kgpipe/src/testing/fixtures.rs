//! Scratch workspaces for pipeline tests.

use super::{MockLauncher, MockRun};
use crate::config::PipelineConfig;
use crate::core::StageName;
use crate::errors::Result;
use crate::pipeline::Orchestrator;
use crate::stages::{ENV_DATABASE_DIR, ENV_OUTPUT_DIR};
use crate::volume::SharedVolume;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Port scripted deploys listen on.
pub const TEST_PORT: u16 = 7687;

/// A temporary directory holding a config template and the shared volume.
///
/// The directory is removed when the workspace is dropped.
#[derive(Debug)]
pub struct TestWorkspace {
    dir: TempDir,
    config: PipelineConfig,
}

impl TestWorkspace {
    /// Creates a workspace with a config template and fast deploy polling.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or template cannot be created.
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let mut config = PipelineConfig::default().with_base_dir(dir.path());
        config.build.command = vec!["create-knowledge-graph".to_string()];
        config.deploy.port = TEST_PORT;
        config.deploy.startup_timeout_secs = 1;
        config.deploy.poll_interval_ms = 10;

        let template = config.config_artifact().template().to_path_buf();
        if let Some(parent) = template.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&template, "offline: true\nstrict_mode: false\n")?;

        Ok(Self { dir, config })
    }

    /// Returns the workspace directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Returns the configuration for editing.
    pub fn config_mut(&mut self) -> &mut PipelineConfig {
        &mut self.config
    }

    /// Returns a handle to the shared volume.
    #[must_use]
    pub fn volume(&self) -> SharedVolume {
        SharedVolume::new(self.config.volume_root())
    }

    /// Returns the path of a published artifact.
    #[must_use]
    pub fn artifact(&self, name: &str) -> PathBuf {
        self.volume().artifacts_dir().join(name)
    }

    /// Deletes the config template.
    ///
    /// # Errors
    ///
    /// Returns an error if the template cannot be removed.
    pub fn remove_config_template(&self) -> Result<()> {
        std::fs::remove_file(self.config.config_artifact().template())?;
        Ok(())
    }

    /// Creates the standard orchestrator driven by `launcher`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn orchestrator(&self, launcher: &MockLauncher) -> Result<Orchestrator> {
        Orchestrator::standard(
            self.config.clone(),
            Arc::new(launcher.clone()),
            launcher.probe(),
        )
    }
}

/// Scripts a launcher whose build publishes two CSV files and the import
/// script, and whose import writes a database file.
#[must_use]
pub fn scripted_happy_path(config: &PipelineConfig) -> MockLauncher {
    let launcher = MockLauncher::new();
    launcher
        .on_run(StageName::Build, build_run(config, "nodes.csv"))
        .on_run(
            StageName::Import,
            MockRun::ok().write(ENV_DATABASE_DIR, "graph.db", "populated\n"),
        );
    launcher
}

/// A successful build run that publishes `artifact` alongside the script.
#[must_use]
pub fn build_run(config: &PipelineConfig, artifact: &str) -> MockRun {
    MockRun::ok()
        .write(ENV_OUTPUT_DIR, artifact, "id:ID,name\n1,TP53\n")
        .write(ENV_OUTPUT_DIR, "edges.csv", ":START_ID,:END_ID\n1,1\n")
        .write(
            ENV_OUTPUT_DIR,
            &config.build.import_script,
            "neo4j-admin database import full --nodes=nodes.csv\n",
        )
}
