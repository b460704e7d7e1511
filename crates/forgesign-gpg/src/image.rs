//! Per-artifact image signature verification.
//!
//! Each image artifact is handled independently: its detached signature is
//! fetched from the blob store, checked against the local artifact bytes
//! with the process-scoped keyring, and on acceptance relocated to its
//! permanent local path while the remote signature object is widened to
//! public-read. The run aborts on the first verification failure; artifacts
//! accepted earlier keep their relocated signatures.

use std::path::Path;

use tracing::{debug, info};

use forgesign_core::meta::BuildMeta;
use forgesign_core::store::Stager;
use forgesign_core::{Environment, Result};

use crate::keyring::TrustKeyring;
use crate::verify::{SignatureVerificationResult, enforce, verify_detached};

/// One artifact's verification outcome.
#[derive(Debug)]
pub struct ImageOutcome {
    /// Image name from the build metadata.
    pub name: String,
    /// Verification record.
    pub result: SignatureVerificationResult,
}

/// Verify and accept the signatures for every image artifact of the build.
///
/// # Errors
///
/// - [`SignError::Io`] when an artifact or its remote signature is missing.
/// - [`SignError::Verification`] on the first invalid signature in
///   production; in staging the invalid signature is logged and the batch
///   continues.
///
/// [`SignError::Io`]: forgesign_core::SignError::Io
/// [`SignError::Verification`]: forgesign_core::SignError::Verification
pub async fn verify_images(
    stager: &Stager<'_>,
    build_dir: &Path,
    meta: &BuildMeta,
    basearch: &str,
    keyring: &TrustKeyring,
    env: Environment,
) -> Result<Vec<ImageOutcome>> {
    let mut outcomes = Vec::with_capacity(meta.images.len());

    for (name, entry) in &meta.images {
        let local_artifact = build_dir.join(&entry.path);
        let local_sig = build_dir.join(format!("{}.sig", entry.path));
        // Fixed scratch path; a re-run clobbers whatever a prior attempt
        // left behind.
        let scratch_sig = build_dir.join(format!("{}.sig.part", entry.path));

        let sig_key = stager.signature_key(&meta.build_id, basearch, &entry.path);
        stager.download(&sig_key, &scratch_sig).await?;
        debug!(image = %name, key = %sig_key, "signature fetched");

        let artifact_bytes = std::fs::read(&local_artifact)?;
        let sig_bytes = std::fs::read(&scratch_sig)?;
        let result = verify_detached(&artifact_bytes, &sig_bytes, keyring)?;
        enforce(&result, env, &entry.path)?;

        // Accepted: move the signature to its permanent path and expose
        // the remote object publicly (the signer never does this itself).
        std::fs::rename(&scratch_sig, &local_sig)?;
        stager.publish_object(&sig_key).await?;
        info!(image = %name, sig = %local_sig.display(), "signature accepted");

        outcomes.push(ImageOutcome {
            name: name.clone(),
            result,
        });
    }

    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use forgesign_core::config::BucketTarget;
    use forgesign_core::meta::ArtifactEntry;
    use forgesign_core::store::{BlobStore, FsBlobStore};

    use super::*;
    use crate::testkit;

    struct Fixture {
        _dir: tempfile::TempDir,
        build_dir: std::path::PathBuf,
        store: FsBlobStore,
        target: BucketTarget,
        meta: BuildMeta,
    }

    /// Two artifacts; `a-disk`'s signature is made by `good`, `b-disk`'s
    /// by whoever `b_signer` is.
    async fn fixture(
        good: &sequoia_openpgp::Cert,
        b_signer: &sequoia_openpgp::Cert,
    ) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let build_dir = dir.path().join("builds/b1/x86_64");
        std::fs::create_dir_all(&build_dir).unwrap();
        let store = FsBlobStore::new(dir.path().join("store"));
        let target = BucketTarget {
            bucket: "builds".into(),
            prefix: "fcos".into(),
        };

        let mut images = BTreeMap::new();
        for (name, path, bytes, signer) in [
            ("a-disk", "a.qcow2", b"artifact a".as_slice(), good),
            ("b-disk", "b.qcow2", b"artifact b".as_slice(), b_signer),
        ] {
            std::fs::write(build_dir.join(path), bytes).unwrap();
            let sig = testkit::detached_signature(signer, bytes);
            let sig_local = build_dir.join(format!("{path}.remote-sig"));
            std::fs::write(&sig_local, sig).unwrap();
            store
                .put(&format!("fcos/b1/x86_64/{path}.sig"), &sig_local)
                .await
                .unwrap();
            std::fs::remove_file(&sig_local).unwrap();
            images.insert(
                name.to_string(),
                ArtifactEntry {
                    path: path.to_string(),
                    size: bytes.len() as u64,
                    sha256: forgesign_core::store::sha256_hex(bytes),
                },
            );
        }

        let meta = BuildMeta {
            build_id: "b1".into(),
            ostree_commit: None,
            ostree_archive: None,
            images,
        };
        Fixture {
            _dir: dir,
            build_dir,
            store,
            target,
            meta,
        }
    }

    #[tokio::test]
    async fn all_valid_signatures_are_relocated_and_published() {
        let signer = testkit::generate_cert("Signer <s@example.com>");
        let fx = fixture(&signer, &signer).await;
        let keyring = TrustKeyring::from_certs(vec![signer]);
        let stager = Stager::new(&fx.store, &fx.target);

        let outcomes = verify_images(
            &stager,
            &fx.build_dir,
            &fx.meta,
            "x86_64",
            &keyring,
            Environment::Production,
        )
        .await
        .unwrap();

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.result.valid));
        assert!(fx.build_dir.join("a.qcow2.sig").exists());
        assert!(fx.build_dir.join("b.qcow2.sig").exists());
        assert!(fx.store.is_public("fcos/b1/x86_64/a.qcow2.sig"));
        assert!(fx.store.is_public("fcos/b1/x86_64/b.qcow2.sig"));
    }

    #[tokio::test]
    async fn production_aborts_on_first_failure_keeping_earlier_acceptances() {
        let good = testkit::generate_cert("Signer <s@example.com>");
        let rogue = testkit::generate_cert("Rogue <r@example.com>");
        // BTreeMap order: a-disk is verified before b-disk.
        let fx = fixture(&good, &rogue).await;
        let keyring = TrustKeyring::from_certs(vec![good]);
        let stager = Stager::new(&fx.store, &fx.target);

        let err = verify_images(
            &stager,
            &fx.build_dir,
            &fx.meta,
            "x86_64",
            &keyring,
            Environment::Production,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "verification");

        // A's relocation had already completed before the abort; B's never
        // happened and its remote object stays private.
        assert!(fx.build_dir.join("a.qcow2.sig").exists());
        assert!(fx.store.is_public("fcos/b1/x86_64/a.qcow2.sig"));
        assert!(!fx.build_dir.join("b.qcow2.sig").exists());
        assert!(!fx.store.is_public("fcos/b1/x86_64/b.qcow2.sig"));
    }

    #[tokio::test]
    async fn staging_tolerates_an_invalid_signature_and_continues() {
        let good = testkit::generate_cert("Signer <s@example.com>");
        let rogue = testkit::generate_cert("Rogue <r@example.com>");
        let fx = fixture(&rogue, &good).await;
        let keyring = TrustKeyring::from_certs(vec![good]);
        let stager = Stager::new(&fx.store, &fx.target);

        let outcomes = verify_images(
            &stager,
            &fx.build_dir,
            &fx.meta,
            "x86_64",
            &keyring,
            Environment::Staging,
        )
        .await
        .unwrap();

        assert_eq!(outcomes.len(), 2);
        assert!(!outcomes[0].result.valid);
        assert!(outcomes[1].result.valid);
        // Both signatures end up relocated: staging accepts with a warning.
        assert!(fx.build_dir.join("a.qcow2.sig").exists());
        assert!(fx.build_dir.join("b.qcow2.sig").exists());
    }

    #[tokio::test]
    async fn missing_remote_signature_is_an_io_error() {
        let signer = testkit::generate_cert("Signer <s@example.com>");
        let fx = fixture(&signer, &signer).await;
        let keyring = TrustKeyring::from_certs(vec![signer]);
        let stager = Stager::new(&fx.store, &fx.target);

        // Drop one remote signature object.
        let mut meta = fx.meta.clone();
        meta.images.insert(
            "c-disk".into(),
            ArtifactEntry {
                path: "c.qcow2".into(),
                size: 0,
                sha256: String::new(),
            },
        );
        std::fs::write(fx.build_dir.join("c.qcow2"), b"unsigned").unwrap();

        let err = verify_images(
            &stager,
            &fx.build_dir,
            &meta,
            "x86_64",
            &keyring,
            Environment::Production,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "io");
    }
}
