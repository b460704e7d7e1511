//! Versioned-commit verification and acceptance.
//!
//! The signer returns a detached metadata object for the commit. It is
//! verified inside a throwaway commit repository: the commit object and its
//! metadata are written at content-addressed paths derived from the
//! checksum, a synthetic trust anchor is configured against the trusted-key
//! directory, and verification must yield exactly one valid result record.
//! Only then is the metadata merged into the build's commit archive and the
//! commit re-imported into the local commit store.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, info};

use forgesign_core::archive;
use forgesign_core::meta::{ArtifactEntry, BuildMeta};
use forgesign_core::store::sha256_file;
use forgesign_core::{Environment, Result, SignError};

use crate::keyring::TrustKeyring;
use crate::verify::{SignatureVerificationResult, enforce, verify_detached};

/// Content-addressed relative path for a commit-repository object:
/// first two hex characters as the subdirectory, the remainder plus the
/// type suffix as the filename.
///
/// # Errors
///
/// [`SignError::Configuration`] for a checksum that is not plausible hex.
pub fn object_path(checksum: &str, suffix: &str) -> Result<String> {
    if checksum.len() < 3 || !checksum.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(SignError::Configuration(format!(
            "malformed commit checksum '{checksum}'"
        )));
    }
    Ok(format!(
        "objects/{}/{}.{suffix}",
        &checksum[..2],
        &checksum[2..]
    ))
}

/// A throwaway commit repository used for one verification.
///
/// Dropped (and deleted) as soon as verification finishes; nothing here is
/// ever reused or imported from.
pub struct EphemeralCommitRepo {
    dir: TempDir,
}

impl EphemeralCommitRepo {
    /// Create the repository skeleton with a synthetic trust anchor
    /// pointing at `key_dir`, with signature verification mandatory.
    ///
    /// # Errors
    ///
    /// [`SignError::Io`] on filesystem failure.
    pub fn new(key_dir: &Path) -> Result<Self> {
        let dir = TempDir::new()?;
        std::fs::create_dir_all(dir.path().join("objects"))?;
        let config = format!(
            "[core]\n\
             repo_version=1\n\
             mode=archive\n\
             \n\
             [remote \"signer\"]\n\
             url=file:///dev/null\n\
             gpgkeypath={}\n\
             gpg-verify=true\n",
            key_dir.display()
        );
        std::fs::write(dir.path().join("config"), config)?;
        debug!(repo = %dir.path().display(), "ephemeral commit repository created");
        Ok(Self { dir })
    }

    /// Repository root.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write the commit object and its detached metadata at their
    /// content-addressed paths. Returns both absolute paths.
    ///
    /// # Errors
    ///
    /// [`SignError::Configuration`] for a malformed checksum,
    /// [`SignError::Io`] on write failure.
    pub fn stage(
        &self,
        checksum: &str,
        commit: &[u8],
        commitmeta: &[u8],
    ) -> Result<(PathBuf, PathBuf)> {
        let commit_path = self.dir.path().join(object_path(checksum, "commit")?);
        let meta_path = self.dir.path().join(object_path(checksum, "commitmeta")?);
        for path in [&commit_path, &meta_path] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&commit_path, commit)?;
        std::fs::write(&meta_path, commitmeta)?;
        Ok((commit_path, meta_path))
    }
}

/// Verify the detached metadata for `checksum` inside an ephemeral
/// repository and apply the environment trust policy.
///
/// # Errors
///
/// [`SignError::Verification`] for an invalid signature in production, or
/// when the metadata blob cannot be parsed at all.
pub fn verify_commit(
    commit: &[u8],
    checksum: &str,
    commitmeta: &[u8],
    key_dir: &Path,
    keyring: &TrustKeyring,
    env: Environment,
) -> Result<SignatureVerificationResult> {
    let repo = EphemeralCommitRepo::new(key_dir)?;
    let (commit_path, meta_path) = repo.stage(checksum, commit, commitmeta)?;

    // Verify what was actually staged, not the caller's buffers.
    let staged_commit = std::fs::read(&commit_path)?;
    let staged_meta = std::fs::read(&meta_path)?;
    let result = verify_detached(&staged_commit, &staged_meta, keyring)?;
    enforce(&result, env, &format!("commit {checksum}"))?;
    Ok(result)
}

/// Merge the accepted metadata object into the build's commit archive,
/// update the archive's recorded size and checksum in `meta`, rewrite
/// `meta.json`, and re-import the signed commit into the local commit
/// store.
///
/// # Errors
///
/// [`SignError::Configuration`] when the build has no commit archive,
/// [`SignError::Io`] on archive assembly or import failure.
pub fn accept_commit(
    build_dir: &Path,
    meta: &mut BuildMeta,
    checksum: &str,
    commitmeta: &[u8],
    local_repo: &Path,
) -> Result<()> {
    let entry = meta.ostree_archive.as_ref().ok_or_else(|| {
        SignError::Configuration(format!(
            "build {} has no commit archive to merge into",
            meta.build_id
        ))
    })?;
    let archive_path = build_dir.join(&entry.path);

    let meta_entry = object_path(checksum, "commitmeta")?;
    archive::append_entry(&archive_path, &meta_entry, commitmeta)?;
    info!(archive = %archive_path.display(), entry = %meta_entry, "commit metadata merged");

    meta.ostree_archive = Some(ArtifactEntry {
        path: entry.path.clone(),
        size: std::fs::metadata(&archive_path)?.len(),
        sha256: sha256_file(&archive_path)?,
    });
    meta.write_to_dir(build_dir)?;

    let commit = archive::read_entry(&archive_path, &object_path(checksum, "commit")?)?;
    reimport(local_repo, checksum, &commit, commitmeta)?;
    Ok(())
}

/// Import the signed commit into the local commit store, forcibly
/// overwriting any previously-imported unsigned copy with the same
/// checksum.
fn reimport(local_repo: &Path, checksum: &str, commit: &[u8], commitmeta: &[u8]) -> Result<()> {
    for (suffix, bytes) in [("commit", commit), ("commitmeta", commitmeta)] {
        let path = local_repo.join(object_path(checksum, suffix)?);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => {},
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {},
            Err(err) => return Err(err.into()),
        }
        std::fs::write(&path, bytes)?;
    }
    info!(repo = %local_repo.display(), checksum = %checksum, "signed commit re-imported");
    Ok(())
}
