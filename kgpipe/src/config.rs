//! Pipeline configuration loading from `kgpipe.toml`.
//!
//! Configuration is optional: every section falls back to defaults that
//! describe a BioCypher-style build feeding a Neo4j import and server.
//!
//! # Example Configuration
//!
//! ```toml
//! [pipeline]
//! name = "knowledge-graph"
//!
//! [volume]
//! path = ".kgpipe/volume"
//!
//! [build]
//! command = ["python", "create_knowledge_graph.py"]
//! config_template = "config/biocypher_config.yaml"
//! config_path = "biocypher_config.yaml"
//! import_script = "neo4j-admin-import-call.sh"
//!
//! [import]
//! command = ["sh"]
//!
//! [deploy]
//! command = ["neo4j", "console"]
//! host = "127.0.0.1"
//! port = 7474
//! startup_timeout_secs = 120
//! poll_interval_ms = 500
//! ```
//!
//! Relative paths are resolved against the directory holding the config file.

use crate::errors::{KgpipeError, Result, StageFailure};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Default configuration file name.
pub const CONFIG_FILE_NAME: &str = "kgpipe.toml";

/// Root configuration structure loaded from `kgpipe.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// General pipeline settings.
    pub pipeline: PipelineSection,
    /// Shared volume location.
    pub volume: VolumeSection,
    /// Build stage settings.
    pub build: BuildSection,
    /// Import stage settings.
    pub import: ImportSection,
    /// Deploy stage settings.
    pub deploy: DeploySection,
    /// Directory that relative paths resolve against.
    #[serde(skip)]
    base_dir: PathBuf,
}

/// General pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    /// Pipeline name, recorded in run records and events.
    pub name: String,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            name: "knowledge-graph".to_string(),
        }
    }
}

/// Shared volume location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeSection {
    /// Root directory of the shared volume.
    pub path: PathBuf,
}

impl Default for VolumeSection {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".kgpipe/volume"),
        }
    }
}

/// Build stage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSection {
    /// Construction command argv.
    pub command: Vec<String>,
    /// Template the configuration artifact is copied from.
    pub config_template: PathBuf,
    /// Active configuration path read by the construction command.
    pub config_path: PathBuf,
    /// File name of the import script the construction command generates.
    pub import_script: String,
}

impl Default for BuildSection {
    fn default() -> Self {
        Self {
            command: vec!["python".to_string(), "create_knowledge_graph.py".to_string()],
            config_template: PathBuf::from("config/biocypher_config.yaml"),
            config_path: PathBuf::from("biocypher_config.yaml"),
            import_script: "neo4j-admin-import-call.sh".to_string(),
        }
    }
}

/// Import stage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportSection {
    /// Bulk-load command argv; the import script path is appended.
    pub command: Vec<String>,
}

impl Default for ImportSection {
    fn default() -> Self {
        Self {
            command: vec!["sh".to_string()],
        }
    }
}

/// Deploy stage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploySection {
    /// Server command argv.
    pub command: Vec<String>,
    /// Host the readiness probe connects to.
    pub host: String,
    /// Port the server binds.
    pub port: u16,
    /// How long to wait for the server to accept connections.
    pub startup_timeout_secs: u64,
    /// Delay between readiness probes.
    pub poll_interval_ms: u64,
}

impl Default for DeploySection {
    fn default() -> Self {
        Self {
            command: vec!["neo4j".to_string(), "console".to_string()],
            host: "127.0.0.1".to_string(),
            port: 7474,
            startup_timeout_secs: 120,
            poll_interval_ms: 500,
        }
    }
}

impl DeploySection {
    /// Returns the startup timeout.
    #[must_use]
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    /// Returns the probe interval.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Returns the `host:port` endpoint.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl PipelineConfig {
    /// Loads configuration from a file.
    ///
    /// # Errors
    ///
    /// Returns [`KgpipeError::Config`] if the file cannot be read, parsed, or
    /// fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            KgpipeError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut config = Self::from_toml(&content)
            .map_err(|e| KgpipeError::Config(format!("{}: {e}", path.display())))?;
        config.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        debug!(path = %path.display(), "Loaded pipeline configuration");
        Ok(config)
    }

    /// Loads `path` if given, otherwise `kgpipe.toml` in `dir` when present,
    /// otherwise defaults rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicitly requested file is missing or if any
    /// loaded file is invalid.
    pub fn discover(path: Option<&Path>, dir: &Path) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            Self::load(&candidate)
        } else {
            debug!(dir = %dir.display(), "No {} found, using defaults", CONFIG_FILE_NAME);
            Ok(Self::default().with_base_dir(dir))
        }
    }

    /// Parses and validates configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`KgpipeError::Config`] on parse or validation failure.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| KgpipeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Sets the directory relative paths resolve against.
    #[must_use]
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = dir.into();
        self
    }

    /// Returns the directory relative paths resolve against.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Resolves a configured path against the base directory.
    #[must_use]
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    /// Returns the resolved volume root.
    #[must_use]
    pub fn volume_root(&self) -> PathBuf {
        self.resolve(&self.volume.path)
    }

    /// Returns the configuration artifact staged before each build.
    #[must_use]
    pub fn config_artifact(&self) -> ConfigArtifact {
        ConfigArtifact::new(
            self.resolve(&self.build.config_template),
            self.resolve(&self.build.config_path),
        )
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`KgpipeError::Config`] describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.name.trim().is_empty() {
            return Err(KgpipeError::Config(
                "pipeline.name cannot be empty".to_string(),
            ));
        }
        for (section, command) in [
            ("build", &self.build.command),
            ("import", &self.import.command),
            ("deploy", &self.deploy.command),
        ] {
            if command.first().map_or(true, |program| program.trim().is_empty()) {
                return Err(KgpipeError::Config(format!(
                    "{section}.command must name a program"
                )));
            }
        }
        let script = self.build.import_script.trim();
        if script.is_empty() || script.contains('/') || script.contains('\\') {
            return Err(KgpipeError::Config(format!(
                "build.import_script must be a bare file name, got '{}'",
                self.build.import_script
            )));
        }
        if self.deploy.port == 0 {
            return Err(KgpipeError::Config("deploy.port cannot be 0".to_string()));
        }
        if self.deploy.poll_interval_ms == 0 {
            return Err(KgpipeError::Config(
                "deploy.poll_interval_ms cannot be 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// The configuration file consumed by the construction command.
///
/// It is copied from a template to the active path at the start of every
/// build, overwriting whatever the previous run left there.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigArtifact {
    template: PathBuf,
    active: PathBuf,
}

impl ConfigArtifact {
    /// Creates a config artifact description.
    #[must_use]
    pub fn new(template: impl Into<PathBuf>, active: impl Into<PathBuf>) -> Self {
        Self {
            template: template.into(),
            active: active.into(),
        }
    }

    /// Returns the template path.
    #[must_use]
    pub fn template(&self) -> &Path {
        &self.template
    }

    /// Returns the active path.
    #[must_use]
    pub fn active(&self) -> &Path {
        &self.active
    }

    /// Copies the template into the active path.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigMissing` failure if the template is absent or the copy
    /// fails.
    pub fn stage(&self) -> Result<PathBuf, StageFailure> {
        if !self.template.is_file() {
            return Err(StageFailure::config_missing(format!(
                "configuration template not found: {}",
                self.template.display()
            )));
        }
        if let Some(parent) = self.active.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StageFailure::config_missing(format!(
                    "cannot create {}: {e}",
                    parent.display()
                ))
            })?;
        }
        std::fs::copy(&self.template, &self.active).map_err(|e| {
            StageFailure::config_missing(format!(
                "cannot copy {} to {}: {e}",
                self.template.display(),
                self.active.display()
            ))
        })?;
        Ok(self.active.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::FailureKind;

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.deploy.port, 7474);
        assert_eq!(config.deploy.endpoint(), "127.0.0.1:7474");
        assert_eq!(config.import.command, vec!["sh".to_string()]);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = PipelineConfig::from_toml(
            r#"
            [deploy]
            port = 17474

            [build]
            command = ["python3", "build.py"]
            "#,
        )
        .unwrap();

        assert_eq!(config.deploy.port, 17474);
        assert_eq!(config.deploy.host, "127.0.0.1");
        assert_eq!(config.build.command, vec!["python3", "build.py"]);
        assert_eq!(config.build.import_script, "neo4j-admin-import-call.sh");
    }

    #[test]
    fn test_invalid_settings_rejected() {
        assert!(PipelineConfig::from_toml("[deploy]\nport = 0").is_err());
        assert!(PipelineConfig::from_toml("[build]\ncommand = []").is_err());
        assert!(PipelineConfig::from_toml("[build]\nimport_script = \"out/import.sh\"").is_err());
        assert!(PipelineConfig::from_toml("[pipeline]\nname = \"  \"").is_err());
        assert!(PipelineConfig::from_toml("not toml [").is_err());
    }

    #[test]
    fn test_relative_paths_resolve_against_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "[volume]\npath = \"data/volume\"\n").unwrap();

        let config = PipelineConfig::load(&path).unwrap();
        assert_eq!(config.volume_root(), dir.path().join("data/volume"));
        assert_eq!(
            config.config_artifact().template(),
            dir.path().join("config/biocypher_config.yaml")
        );
    }

    #[test]
    fn test_discover_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig::discover(None, dir.path()).unwrap();
        assert_eq!(config.base_dir(), dir.path());

        let missing = dir.path().join("absent.toml");
        assert!(PipelineConfig::discover(Some(&missing), dir.path()).is_err());
    }

    #[test]
    fn test_config_artifact_stage_overwrites_active() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("template.yaml");
        let active = dir.path().join("active/config.yaml");
        std::fs::write(&template, "offline: true\n").unwrap();

        let artifact = ConfigArtifact::new(&template, &active);
        artifact.stage().unwrap();
        assert_eq!(std::fs::read_to_string(&active).unwrap(), "offline: true\n");

        std::fs::write(&template, "offline: false\n").unwrap();
        artifact.stage().unwrap();
        assert_eq!(std::fs::read_to_string(&active).unwrap(), "offline: false\n");
    }

    #[test]
    fn test_config_artifact_missing_template() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = ConfigArtifact::new(dir.path().join("nope.yaml"), dir.path().join("a.yaml"));

        let failure = artifact.stage().unwrap_err();
        assert_eq!(failure.kind, FailureKind::ConfigMissing);
        assert!(failure.message.contains("nope.yaml"));
    }
}
