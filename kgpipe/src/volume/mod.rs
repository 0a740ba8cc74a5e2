//! The shared volume handed to every stage.
//!
//! The volume is a directory tree that outlives stage processes and runs.
//! Stages never locate it by convention: the orchestrator owns a
//! [`SharedVolume`] handle and passes it through each stage's context.
//!
//! Layout under the root:
//!
//! ```text
//! .kgpipe-volume            marker (creation time, generation)
//! artifacts/                published build output and the import script
//! artifacts/.staging/       in-progress construction output
//! artifacts/manifest.json   published file list and import script digest
//! database/                 live database files
//! database/.import-complete written once an import succeeds
//! logs/<stage>.log          captured stage output
//! state/run.json            last run record
//! state/deploy.json         identity of the serving deploy process
//! ```

mod manifest;
mod record;

pub use manifest::{sha256_file, ArtifactManifest, DeployRecord, ImportMarker};
pub use record::{RunRecord, StageRecord};

use crate::core::StageName;
use crate::errors::{KgpipeError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const MARKER_FILE: &str = ".kgpipe-volume";
const ARTIFACTS_DIR: &str = "artifacts";
const STAGING_DIR: &str = ".staging";
const DATABASE_DIR: &str = "database";
const LOGS_DIR: &str = "logs";
const STATE_DIR: &str = "state";
const MANIFEST_FILE: &str = "manifest.json";

/// Metadata stored at the volume root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMarker {
    /// When this generation of the volume was created.
    pub created_at: DateTime<Utc>,
    /// Incremented by every explicit reset.
    pub generation: u64,
}

/// Handle to the shared volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedVolume {
    root: PathBuf,
}

impl SharedVolume {
    /// Creates a handle without touching the filesystem.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Opens the volume, creating its layout and marker when absent.
    ///
    /// Existing content is left untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if the layout cannot be created.
    pub fn open_or_create(root: impl Into<PathBuf>) -> Result<Self> {
        let volume = Self::new(root);
        volume.ensure_layout()?;
        if !volume.marker_path().exists() {
            volume.write_marker(&VolumeMarker {
                created_at: Utc::now(),
                generation: 0,
            })?;
            info!(root = %volume.root.display(), "Created shared volume");
        }
        Ok(volume)
    }

    /// Returns the volume root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns true if the volume has been created.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.marker_path().is_file()
    }

    /// Path of the volume marker.
    #[must_use]
    pub fn marker_path(&self) -> PathBuf {
        self.root.join(MARKER_FILE)
    }

    /// Directory holding published build artifacts.
    #[must_use]
    pub fn artifacts_dir(&self) -> PathBuf {
        self.root.join(ARTIFACTS_DIR)
    }

    /// Directory the construction command writes into.
    #[must_use]
    pub fn staging_dir(&self) -> PathBuf {
        self.artifacts_dir().join(STAGING_DIR)
    }

    /// Path of the published artifact manifest.
    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.artifacts_dir().join(MANIFEST_FILE)
    }

    /// Path of the published import script.
    #[must_use]
    pub fn import_script_path(&self, file_name: &str) -> PathBuf {
        self.artifacts_dir().join(file_name)
    }

    /// Directory holding live database files.
    #[must_use]
    pub fn database_dir(&self) -> PathBuf {
        self.root.join(DATABASE_DIR)
    }

    /// Path of the import completion marker.
    #[must_use]
    pub fn import_marker_path(&self) -> PathBuf {
        self.database_dir().join(".import-complete")
    }

    /// Directory holding stage logs.
    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join(LOGS_DIR)
    }

    /// Log file of a stage.
    #[must_use]
    pub fn log_path(&self, stage: StageName) -> PathBuf {
        self.logs_dir().join(format!("{stage}.log"))
    }

    /// Directory holding orchestrator state.
    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR)
    }

    /// Path of the last run record.
    #[must_use]
    pub fn run_record_path(&self) -> PathBuf {
        self.state_dir().join("run.json")
    }

    /// Path of the deploy record.
    #[must_use]
    pub fn deploy_record_path(&self) -> PathBuf {
        self.state_dir().join("deploy.json")
    }

    /// Creates any missing layout directories.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [
            self.artifacts_dir(),
            self.database_dir(),
            self.logs_dir(),
            self.state_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|e| {
                KgpipeError::Volume(format!("cannot create {}: {e}", dir.display()))
            })?;
        }
        Ok(())
    }

    /// Reads the volume marker.
    ///
    /// # Errors
    ///
    /// Returns an error if the volume does not exist or the marker is invalid.
    pub fn marker(&self) -> Result<VolumeMarker> {
        let path = self.marker_path();
        let content = std::fs::read(&path).map_err(|e| {
            KgpipeError::Volume(format!("cannot read {}: {e}", path.display()))
        })?;
        Ok(serde_json::from_slice(&content)?)
    }

    fn write_marker(&self, marker: &VolumeMarker) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(marker)?;
        self.write_atomic(&self.marker_path(), &bytes)
    }

    /// Destroys the volume and recreates it empty.
    ///
    /// This is the only way previous artifacts, database files, and state are
    /// cleared; nothing resets the volume implicitly.
    ///
    /// # Errors
    ///
    /// Returns an error if the old content cannot be removed or the new
    /// layout cannot be created.
    pub fn reset(&self) -> Result<VolumeMarker> {
        let generation = self.marker().map(|m| m.generation + 1).unwrap_or(1);
        self.destroy()?;
        self.ensure_layout()?;
        let marker = VolumeMarker {
            created_at: Utc::now(),
            generation,
        };
        self.write_marker(&marker)?;
        info!(root = %self.root.display(), generation, "Shared volume reset");
        Ok(marker)
    }

    /// Removes the volume entirely.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be removed.
    pub fn destroy(&self) -> Result<()> {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => {
                info!(root = %self.root.display(), "Shared volume destroyed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(KgpipeError::Volume(format!(
                "cannot remove {}: {e}",
                self.root.display()
            ))),
        }
    }

    /// Writes a file by writing a sibling temporary file and renaming it.
    ///
    /// Readers observe either the previous content or the complete new
    /// content, never a partial write.
    ///
    /// # Errors
    ///
    /// Returns an error if the temporary file cannot be written or renamed.
    pub fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let dir = path.parent().unwrap_or(&self.root);
        std::fs::create_dir_all(dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| KgpipeError::Io(e.error))?;
        Ok(())
    }

    /// Empties the staging directory, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be recreated.
    pub fn prepare_staging(&self) -> Result<PathBuf> {
        let staging = self.staging_dir();
        remove_path(&staging)?;
        std::fs::create_dir_all(&staging)?;
        Ok(staging)
    }

    /// Moves staged construction output into the artifacts directory.
    ///
    /// Entries are moved by rename; the import script is renamed last, so a
    /// reader that sees the script also sees every artifact published with
    /// it. Artifacts from earlier runs with other names are left in place.
    ///
    /// # Errors
    ///
    /// Returns an error if the staged import script is missing, the output
    /// uses a name the volume reserves, or a rename fails. Nothing is
    /// published when the names are rejected.
    pub fn publish_staging(&self, import_script: &str) -> Result<ArtifactManifest> {
        let staging = self.staging_dir();
        let staged_script = staging.join(import_script);
        if !staged_script.is_file() {
            return Err(KgpipeError::Volume(format!(
                "staged import script not found: {}",
                staged_script.display()
            )));
        }

        let mut staged = Vec::new();
        for entry in std::fs::read_dir(&staging)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == MANIFEST_FILE || name == STAGING_DIR {
                return Err(KgpipeError::Volume(format!(
                    "build output uses reserved name '{name}'"
                )));
            }
            if name != import_script {
                staged.push((name, entry.path()));
            }
        }

        let mut files = Vec::new();
        for (name, path) in staged {
            let dest = self.artifacts_dir().join(&name);
            if dest.is_dir() {
                remove_path(&dest)?;
            }
            std::fs::rename(path, &dest)?;
            debug!(artifact = %name, "Published artifact");
            files.push(name);
        }
        files.sort();

        let digest = sha256_file(&staged_script)?;
        std::fs::rename(&staged_script, self.import_script_path(import_script))?;
        remove_path(&staging)?;

        let manifest = ArtifactManifest::new(import_script, digest, files);
        self.write_atomic(&self.manifest_path(), &serde_json::to_vec_pretty(&manifest)?)?;
        Ok(manifest)
    }

    /// Lists published artifact names, excluding staging and the manifest.
    ///
    /// # Errors
    ///
    /// Returns an error if the artifacts directory cannot be read.
    pub fn list_artifacts(&self) -> Result<Vec<String>> {
        let dir = self.artifacts_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if name != STAGING_DIR && name != MANIFEST_FILE {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Empties the database directory so an import starts from nothing.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be recreated.
    pub fn prepare_fresh_database(&self) -> Result<PathBuf> {
        let dir = self.database_dir();
        remove_path(&dir)?;
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Reads the record of the serving deploy process, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the record exists but cannot be parsed.
    pub fn read_deploy_record(&self) -> Result<Option<DeployRecord>> {
        let path = self.deploy_record_path();
        match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                KgpipeError::Volume(format!("invalid deploy record {}: {e}", path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Records the serving deploy process.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    pub fn write_deploy_record(&self, record: &DeployRecord) -> Result<()> {
        self.write_atomic(&self.deploy_record_path(), &serde_json::to_vec_pretty(record)?)
    }

    /// Removes the deploy record.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn clear_deploy_record(&self) -> Result<()> {
        remove_path(&self.deploy_record_path())
    }
}

fn remove_path(path: &Path) -> Result<()> {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
