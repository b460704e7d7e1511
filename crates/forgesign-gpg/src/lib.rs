//! Local verification of signatures returned by the remote signer.
//!
//! Verification always runs against an ephemeral trust store built per
//! invocation from a directory of trusted public keys; nothing touches a
//! persistent keyring or repository. An invalid or absent signature is
//! fatal in production and a logged warning in staging.

pub mod commit;
pub mod image;
pub mod keyring;
pub mod verify;

pub use keyring::TrustKeyring;
pub use verify::{SignatureVerificationResult, enforce, verify_detached};
