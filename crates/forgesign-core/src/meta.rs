//! Build metadata documents.
//!
//! A build tree looks like:
//!
//! ```text
//! builds/
//!   builds.json                      build index, newest first
//!   <build-id>/<basearch>/meta.json  per-build artifact metadata
//!   <build-id>/<basearch>/...        artifacts and the commit archive
//! ```
//!
//! `meta.json` is rewritten after the commit archive merge; the rewrite is
//! assembled in a scratch file in the same directory and renamed over the
//! original, preserving its permissions.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SignError};

/// Well-known build selector for the newest build in the index.
pub const LATEST: &str = "latest";

/// One entry in the build index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildIndexEntry {
    /// Build identifier.
    pub id: String,
    /// Architectures this build was produced for.
    #[serde(default)]
    pub arches: Vec<String>,
}

/// The build index (`builds.json`), newest build first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildIndex {
    /// Builds, newest first.
    #[serde(default)]
    pub builds: Vec<BuildIndexEntry>,
}

impl BuildIndex {
    /// Load `builds.json` from the builds directory.
    ///
    /// # Errors
    ///
    /// [`SignError::Io`] when the file is missing,
    /// [`SignError::Configuration`] when it does not parse.
    pub fn from_dir(builds_dir: &Path) -> Result<Self> {
        let path = builds_dir.join("builds.json");
        let content = std::fs::read_to_string(&path)?;
        serde_json::from_str(&content).map_err(|e| {
            SignError::Configuration(format!("invalid build index '{}': {e}", path.display()))
        })
    }

    /// Resolve a build selector: an explicit id is returned as-is after an
    /// existence check; [`LATEST`] resolves to the newest indexed build.
    ///
    /// # Errors
    ///
    /// [`SignError::Configuration`] for an empty index or an unknown id.
    pub fn resolve(&self, selector: &str) -> Result<&str> {
        if selector == LATEST {
            return self
                .builds
                .first()
                .map(|b| b.id.as_str())
                .ok_or_else(|| SignError::Configuration("build index is empty".into()));
        }
        self.builds
            .iter()
            .find(|b| b.id == selector)
            .map(|b| b.id.as_str())
            .ok_or_else(|| {
                SignError::Configuration(format!("build '{selector}' not found in index"))
            })
    }
}

/// Size and checksum of one artifact file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactEntry {
    /// Path relative to the build directory.
    pub path: String,
    /// Size in bytes.
    pub size: u64,
    /// Hex SHA-256 of the file.
    pub sha256: String,
}

/// Per-build metadata document (`meta.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildMeta {
    /// Build identifier.
    #[serde(rename = "buildid")]
    pub build_id: String,
    /// Checksum of the versioned commit object, when the build has one.
    #[serde(rename = "ostree-commit", skip_serializing_if = "Option::is_none")]
    pub ostree_commit: Option<String>,
    /// The commit archive container, when the build has one.
    #[serde(rename = "ostree-archive", skip_serializing_if = "Option::is_none")]
    pub ostree_archive: Option<ArtifactEntry>,
    /// Image artifacts by name.
    #[serde(default)]
    pub images: BTreeMap<String, ArtifactEntry>,
}

impl BuildMeta {
    /// Load `meta.json` from a build/arch directory.
    ///
    /// # Errors
    ///
    /// [`SignError::Io`] when missing, [`SignError::Configuration`] when it
    /// does not parse.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let path = dir.join("meta.json");
        let content = std::fs::read_to_string(&path)?;
        serde_json::from_str(&content).map_err(|e| {
            SignError::Configuration(format!("invalid metadata '{}': {e}", path.display()))
        })
    }

    /// Rewrite `meta.json` in `dir` atomically, preserving the original
    /// file's permissions.
    ///
    /// # Errors
    ///
    /// [`SignError::Io`] on assembly or rename failure.
    pub fn write_to_dir(&self, dir: &Path) -> Result<()> {
        let path = dir.join("meta.json");
        let serialized = serde_json::to_vec_pretty(self)
            .map_err(|e| SignError::Configuration(format!("unserializable metadata: {e}")))?;
        atomic_replace(&path, &serialized)
    }
}

/// Per-build directory for one architecture.
#[must_use]
pub fn build_dir(builds_dir: &Path, build_id: &str, basearch: &str) -> PathBuf {
    builds_dir.join(build_id).join(basearch)
}

/// Write `bytes` over `path` via a scratch file in the same directory,
/// carrying over the permissions of the original file when it exists.
///
/// # Errors
///
/// [`SignError::Io`] on any filesystem failure.
pub fn atomic_replace(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| SignError::Io(std::io::Error::other("path has no parent directory")))?;
    let original_perms = std::fs::metadata(path).ok().map(|m| m.permissions());

    let mut scratch = tempfile::NamedTempFile::new_in(dir)?;
    scratch.write_all(bytes)?;
    scratch.flush()?;
    if let Some(perms) = original_perms {
        std::fs::set_permissions(scratch.path(), perms)?;
    }
    scratch
        .persist(path)
        .map_err(|e| SignError::Io(e.error))?;
    Ok(())
}
