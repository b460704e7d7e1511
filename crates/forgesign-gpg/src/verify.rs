//! Detached-signature verification against the trust keyring.

use std::cell::RefCell;
use std::rc::Rc;

use sequoia_openpgp as openpgp;

use openpgp::Cert;
use openpgp::KeyHandle;
use openpgp::parse::Parse;
use openpgp::parse::stream::{
    DetachedVerifierBuilder, MessageLayer, MessageStructure, VerificationHelper,
};
use openpgp::policy::StandardPolicy;
use tracing::{info, warn};

use forgesign_core::{Environment, Result, SignError};

use crate::keyring::TrustKeyring;

/// Outcome of verifying one detached signature.
#[derive(Debug, Clone)]
pub struct SignatureVerificationResult {
    /// Fingerprint of the signing certificate, when one was resolved.
    pub signer_fingerprint: Option<String>,
    /// Signer's name, parsed from the primary user id.
    pub signer_name: Option<String>,
    /// Signer's email, parsed from the primary user id.
    pub signer_email: Option<String>,
    /// Whether the signature verified against a trusted key.
    pub valid: bool,
    /// Diagnostic detail for an invalid signature.
    pub detail: Option<String>,
}

struct Helper {
    certs: Vec<Cert>,
    signer: Rc<RefCell<Option<Cert>>>,
}

impl VerificationHelper for Helper {
    fn get_certs(&mut self, _ids: &[KeyHandle]) -> openpgp::Result<Vec<Cert>> {
        // The whole keyring is the candidate set; sequoia narrows it down
        // by key id itself.
        Ok(self.certs.clone())
    }

    fn check(&mut self, structure: MessageStructure) -> openpgp::Result<()> {
        for layer in structure {
            if let MessageLayer::SignatureGroup { results } = layer {
                let mut last_error = None;
                for result in results {
                    match result {
                        Ok(good) => {
                            *self.signer.borrow_mut() = Some(good.ka.cert().clone());
                            return Ok(());
                        },
                        Err(err) => last_error = Some(err),
                    }
                }
                if let Some(err) = last_error {
                    return Err(openpgp::Error::from(err).into());
                }
            }
        }
        Err(openpgp::Error::InvalidOperation("no signature found".into()).into())
    }
}

/// Verify one detached signature blob over `data`.
///
/// An unverifiable signature, including a blob that does not parse as a
/// signature at all, is reported as `valid: false` rather than an error:
/// the caller applies the environment policy via [`enforce`].
///
/// # Errors
///
/// [`SignError::Verification`] only when sequoia accepts the signature but
/// cannot resolve the signing certificate.
pub fn verify_detached(
    data: &[u8],
    signature: &[u8],
    keyring: &TrustKeyring,
) -> Result<SignatureVerificationResult> {
    let policy = StandardPolicy::new();
    let signer: Rc<RefCell<Option<Cert>>> = Rc::new(RefCell::new(None));
    let helper = Helper {
        certs: keyring.certs().to_vec(),
        signer: Rc::clone(&signer),
    };

    let mut verifier = match DetachedVerifierBuilder::from_bytes(signature)
        .and_then(|builder| builder.with_policy(&policy, None, helper))
    {
        Ok(verifier) => verifier,
        Err(err) => {
            return Ok(SignatureVerificationResult {
                signer_fingerprint: None,
                signer_name: None,
                signer_email: None,
                valid: false,
                detail: Some(format!("unparseable signature: {err}")),
            });
        },
    };

    match verifier.verify_bytes(data) {
        Ok(()) => {
            let cert = signer.borrow().clone().ok_or_else(|| {
                SignError::Verification(
                    "signature verified but the signer certificate was not resolved".into(),
                )
            })?;
            let (name, email) = primary_identity(&cert);
            Ok(SignatureVerificationResult {
                signer_fingerprint: Some(cert.fingerprint().to_string()),
                signer_name: name,
                signer_email: email,
                valid: true,
                detail: None,
            })
        },
        Err(err) => Ok(SignatureVerificationResult {
            signer_fingerprint: None,
            signer_name: None,
            signer_email: None,
            valid: false,
            detail: Some(err.to_string()),
        }),
    }
}

/// Apply the environment trust policy to a verification result.
///
/// Valid signatures pass. Invalid ones abort the run in production; in
/// staging the same condition is downgraded to a logged warning and the
/// flow proceeds. This relaxation is intentional and scoped to staging, not
/// a generic fallback.
///
/// # Errors
///
/// [`SignError::Verification`] for an invalid signature in production.
pub fn enforce(
    result: &SignatureVerificationResult,
    env: Environment,
    subject: &str,
) -> Result<()> {
    if result.valid {
        info!(
            subject = %subject,
            fingerprint = result.signer_fingerprint.as_deref().unwrap_or("unknown"),
            "signature verified"
        );
        return Ok(());
    }
    let detail = result.detail.as_deref().unwrap_or("signature did not verify");
    if env.verification_is_fatal() {
        return Err(SignError::Verification(format!("{subject}: {detail}")));
    }
    warn!(subject = %subject, detail = %detail, "invalid signature tolerated in staging");
    Ok(())
}

/// Parse `Name <email>` out of the cert's first user id.
fn primary_identity(cert: &Cert) -> (Option<String>, Option<String>) {
    let Some(uid) = cert.userids().next() else {
        return (None, None);
    };
    let raw = String::from_utf8_lossy(uid.userid().value()).to_string();
    match (raw.find('<'), raw.rfind('>')) {
        (Some(open), Some(close)) if open < close => {
            let name = raw[..open].trim();
            let email = raw[open + 1..close].trim();
            (
                (!name.is_empty()).then(|| name.to_string()),
                (!email.is_empty()).then(|| email.to_string()),
            )
        },
        _ => ((!raw.trim().is_empty()).then(|| raw.trim().to_string()), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit;

    #[test]
    fn valid_signature_reports_signer_identity() {
        let cert = testkit::generate_cert("Build Signer <signer@example.com>");
        let keyring = TrustKeyring::from_certs(vec![cert.clone()]);
        let data = b"artifact bytes";
        let sig = testkit::detached_signature(&cert, data);

        let result = verify_detached(data, &sig, &keyring).unwrap();
        assert!(result.valid);
        assert_eq!(
            result.signer_fingerprint.as_deref(),
            Some(cert.fingerprint().to_string().as_str())
        );
        assert_eq!(result.signer_name.as_deref(), Some("Build Signer"));
        assert_eq!(result.signer_email.as_deref(), Some("signer@example.com"));
    }

    #[test]
    fn tampered_data_is_invalid() {
        let cert = testkit::generate_cert("Build Signer <signer@example.com>");
        let keyring = TrustKeyring::from_certs(vec![cert.clone()]);
        let sig = testkit::detached_signature(&cert, b"artifact bytes");

        let result = verify_detached(b"tampered bytes", &sig, &keyring).unwrap();
        assert!(!result.valid);
        assert!(result.detail.is_some());
    }

    #[test]
    fn untrusted_signer_is_invalid() {
        let signer = testkit::generate_cert("Rogue <rogue@example.com>");
        let trusted = testkit::generate_cert("Trusted <t@example.com>");
        let keyring = TrustKeyring::from_certs(vec![trusted]);
        let data = b"artifact bytes";
        let sig = testkit::detached_signature(&signer, data);

        let result = verify_detached(data, &sig, &keyring).unwrap();
        assert!(!result.valid);
    }

    #[test]
    fn garbage_signature_blob_is_invalid_not_an_error() {
        let cert = testkit::generate_cert("Build Signer <signer@example.com>");
        let keyring = TrustKeyring::from_certs(vec![cert]);
        let result = verify_detached(b"data", b"not a signature", &keyring).unwrap();
        assert!(!result.valid);
        assert!(result.detail.unwrap().contains("unparseable signature"));
    }

    #[test]
    fn staging_proceeds_past_a_garbage_signature_blob() {
        let cert = testkit::generate_cert("Build Signer <signer@example.com>");
        let keyring = TrustKeyring::from_certs(vec![cert]);
        let result = verify_detached(b"data", b"not a signature", &keyring).unwrap();
        assert!(enforce(&result, Environment::Staging, "disk.qcow2").is_ok());
        assert!(enforce(&result, Environment::Production, "disk.qcow2").is_err());
    }

    #[test]
    fn enforcement_follows_the_environment() {
        let invalid = SignatureVerificationResult {
            signer_fingerprint: None,
            signer_name: None,
            signer_email: None,
            valid: false,
            detail: Some("bad signature".into()),
        };
        assert!(enforce(&invalid, Environment::Production, "disk.qcow2").is_err());
        assert!(enforce(&invalid, Environment::Staging, "disk.qcow2").is_ok());
    }
}
