//! Blob store seam and artifact stager.
//!
//! The remote signer fetches its inputs from, and writes its outputs to, an
//! object store the two sides share. Transfer mechanics stay behind the
//! [`BlobStore`] trait; [`FsBlobStore`] is the filesystem-backed
//! implementation used by tests and local runs. All transfers are
//! sequential, blocking steps on the main flow.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::BucketTarget;
use crate::error::{Result, SignError};

/// Narrow interface to the object store.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Upload a local file to `key`, overwriting any existing object.
    async fn put(&self, key: &str, local: &Path) -> Result<()>;

    /// Download the object at `key` to a local path.
    ///
    /// # Errors
    ///
    /// [`SignError::Io`] with `NotFound` when the object does not exist.
    async fn get(&self, key: &str, local: &Path) -> Result<()>;

    /// Whether an object exists at `key`.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Widen the object's access control to public-read. The signer never
    /// does this itself; signature objects get it after verification.
    async fn set_public_read(&self, key: &str) -> Result<()>;
}

/// Filesystem-backed store: objects live under `root/<key>`, public-read
/// markers as `<key>.acl` sidecars so ACL changes are observable.
pub struct FsBlobStore {
    root: PathBuf,
    public: Mutex<HashSet<String>>,
}

impl FsBlobStore {
    /// Store rooted at `root` (created lazily on first put).
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            public: Mutex::new(HashSet::new()),
        }
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Whether `key` was marked public-read during this process lifetime.
    #[must_use]
    pub fn is_public(&self, key: &str) -> bool {
        self.public.lock().expect("acl set poisoned").contains(key)
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, local: &Path) -> Result<()> {
        let dest = self.object_path(key);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(local, &dest)?;
        debug!(key = %key, "object uploaded");
        Ok(())
    }

    async fn get(&self, key: &str, local: &Path) -> Result<()> {
        let src = self.object_path(key);
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&src, local)?;
        debug!(key = %key, "object downloaded");
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.object_path(key).exists())
    }

    async fn set_public_read(&self, key: &str) -> Result<()> {
        if !self.object_path(key).exists() {
            return Err(SignError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no object at '{key}'"),
            )));
        }
        std::fs::write(self.object_path(format!("{key}.acl").as_str()), b"public-read")?;
        self.public
            .lock()
            .expect("acl set poisoned")
            .insert(key.to_string());
        debug!(key = %key, "object ACL widened to public-read");
        Ok(())
    }
}

/// A file staged into the store for one request cycle.
#[derive(Debug, Clone)]
pub struct StagedArtifact {
    /// Where the bytes live locally.
    pub local_path: PathBuf,
    /// Object key inside the bucket.
    pub remote_key: String,
    /// SHA-256 of the staged bytes.
    pub checksum: String,
}

/// Moves bytes between the local filesystem and the blob store, and owns
/// the key layout under the bucket prefix.
pub struct Stager<'a> {
    store: &'a dyn BlobStore,
    target: &'a BucketTarget,
}

impl<'a> Stager<'a> {
    /// Stager for one bucket/prefix target.
    #[must_use]
    pub fn new(store: &'a dyn BlobStore, target: &'a BucketTarget) -> Self {
        Self { store, target }
    }

    /// Scratch key for the commit object: `<prefix>/tmp/<checksum>.commit`.
    /// Fixed per checksum; a re-run clobbers the previous attempt.
    #[must_use]
    pub fn commit_object_key(&self, checksum: &str) -> String {
        format!("{}/tmp/{checksum}.commit", self.target.prefix)
    }

    /// Scratch key for the detached commit metadata:
    /// `<prefix>/tmp/<checksum>.commitmeta`.
    #[must_use]
    pub fn commit_metadata_key(&self, checksum: &str) -> String {
        format!("{}/tmp/{checksum}.commitmeta", self.target.prefix)
    }

    /// Key for a build artifact: `<prefix>/<build>/<basearch>/<artifact>`.
    #[must_use]
    pub fn artifact_key(&self, build_id: &str, basearch: &str, artifact: &str) -> String {
        format!("{}/{build_id}/{basearch}/{artifact}", self.target.prefix)
    }

    /// Key for an artifact's detached signature (`.sig` suffix).
    #[must_use]
    pub fn signature_key(&self, build_id: &str, basearch: &str, artifact: &str) -> String {
        format!("{}.sig", self.artifact_key(build_id, basearch, artifact))
    }

    /// Upload `local` to `key` and record its checksum.
    ///
    /// # Errors
    ///
    /// [`SignError::Io`] on read or transfer failure.
    pub async fn upload(&self, key: &str, local: &Path) -> Result<StagedArtifact> {
        let checksum = sha256_file(local)?;
        self.store.put(key, local).await?;
        Ok(StagedArtifact {
            local_path: local.to_path_buf(),
            remote_key: key.to_string(),
            checksum,
        })
    }

    /// Upload `local` to `key` only when no object exists there yet.
    ///
    /// # Errors
    ///
    /// [`SignError::Io`] on read or transfer failure.
    pub async fn upload_if_missing(&self, key: &str, local: &Path) -> Result<StagedArtifact> {
        if !self.store.exists(key).await? {
            return self.upload(key, local).await;
        }
        Ok(StagedArtifact {
            local_path: local.to_path_buf(),
            remote_key: key.to_string(),
            checksum: sha256_file(local)?,
        })
    }

    /// Download the object at `key` to `local`.
    ///
    /// # Errors
    ///
    /// [`SignError::Io`] on transfer failure or a missing object.
    pub async fn download(&self, key: &str, local: &Path) -> Result<()> {
        self.store.get(key, local).await
    }

    /// Widen `key` to public-read.
    ///
    /// # Errors
    ///
    /// [`SignError::Io`] when the object does not exist.
    pub async fn publish_object(&self, key: &str) -> Result<()> {
        self.store.set_public_read(key).await
    }
}

/// SHA-256 of a file's contents, hex-encoded.
///
/// # Errors
///
/// [`SignError::Io`] when the file cannot be read.
pub fn sha256_file(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(sha256_hex(&bytes))
}

/// SHA-256 of a byte slice, hex-encoded.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
