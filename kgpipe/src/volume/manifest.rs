//! Build manifest, import completion marker, and deploy record.

use super::SharedVolume;
use crate::errors::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;
use uuid::Uuid;

/// Describes the artifacts a build published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    /// When the artifacts were published.
    pub published_at: DateTime<Utc>,
    /// File name of the import script.
    pub import_script: String,
    /// SHA-256 of the import script, hex encoded.
    pub import_script_sha256: String,
    /// Artifact names published alongside the script.
    #[serde(default)]
    pub files: Vec<String>,
}

impl ArtifactManifest {
    /// Creates a manifest stamped with the current time.
    #[must_use]
    pub fn new(
        import_script: impl Into<String>,
        import_script_sha256: impl Into<String>,
        files: Vec<String>,
    ) -> Self {
        Self {
            published_at: Utc::now(),
            import_script: import_script.into(),
            import_script_sha256: import_script_sha256.into(),
            files,
        }
    }

    /// Loads the manifest of the last published build, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest exists but cannot be parsed.
    pub fn load(volume: &SharedVolume) -> Result<Option<Self>> {
        read_json(&volume.manifest_path())
    }
}

/// Written into the database directory once an import succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportMarker {
    /// Run that performed the import.
    pub run_id: Uuid,
    /// When the import finished.
    pub completed_at: DateTime<Utc>,
    /// Digest of the import script that was loaded.
    pub import_script_sha256: String,
}

impl ImportMarker {
    /// Creates a marker stamped with the current time.
    #[must_use]
    pub fn new(run_id: Uuid, import_script_sha256: impl Into<String>) -> Self {
        Self {
            run_id,
            completed_at: Utc::now(),
            import_script_sha256: import_script_sha256.into(),
        }
    }

    /// Loads the marker, if the database has been populated.
    ///
    /// # Errors
    ///
    /// Returns an error if the marker exists but cannot be parsed.
    pub fn load(volume: &SharedVolume) -> Result<Option<Self>> {
        read_json(&volume.import_marker_path())
    }

    /// Writes the marker atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the marker cannot be written.
    pub fn store(&self, volume: &SharedVolume) -> Result<()> {
        volume.write_atomic(&volume.import_marker_path(), &serde_json::to_vec_pretty(self)?)
    }
}

/// The deploy server a run left serving.
///
/// The server leads its own process group, so `pid` is also the group to
/// signal. `identity` is what the launcher reported for the process at
/// spawn time; a live process with this pid but another identity is not
/// ours.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployRecord {
    /// Server pid and process group id.
    pub pid: u32,
    /// Launcher identity of the process, if it could be read.
    pub identity: Option<String>,
    /// Command line the server was started with.
    pub command: String,
    /// When the server was spawned.
    pub started_at: DateTime<Utc>,
}

impl DeployRecord {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn new(pid: u32, identity: Option<String>, command: impl Into<String>) -> Self {
        Self {
            pid,
            identity,
            command: command.into(),
            started_at: Utc::now(),
        }
    }

    /// Returns true if `current`, the identity the launcher reports for
    /// `pid` now, is the process this record describes.
    ///
    /// A record without an identity matches any live process.
    #[must_use]
    pub fn matches(&self, current: Option<&str>) -> bool {
        match (self.identity.as_deref(), current) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(recorded), Some(current)) => recorded == current,
        }
    }
}

/// Computes the hex-encoded SHA-256 digest of a file.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_file_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("script.sh");
        std::fs::write(&path, b"abc").unwrap();

        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_import_marker_store_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let volume = SharedVolume::open_or_create(dir.path()).unwrap();
        assert!(ImportMarker::load(&volume).unwrap().is_none());

        let marker = ImportMarker::new(Uuid::new_v4(), "deadbeef");
        marker.store(&volume).unwrap();

        assert_eq!(ImportMarker::load(&volume).unwrap(), Some(marker));
    }

    #[test]
    fn test_deploy_record_matches_identity() {
        let record = DeployRecord::new(812, Some("boot-a:5521".to_string()), "neo4j console");

        assert!(record.matches(Some("boot-a:5521")));
        assert!(!record.matches(Some("boot-a:9000")));
        assert!(!record.matches(None));

        let unverified = DeployRecord::new(812, None, "neo4j console");
        assert!(unverified.matches(Some("boot-a:9000")));
        assert!(!unverified.matches(None));
    }

    #[test]
    fn test_manifest_absent() {
        let dir = tempfile::tempdir().unwrap();
        let volume = SharedVolume::open_or_create(dir.path()).unwrap();

        assert!(ArtifactManifest::load(&volume).unwrap().is_none());
    }
}
