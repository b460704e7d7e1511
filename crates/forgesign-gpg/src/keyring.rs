//! Ephemeral trust keyring.
//!
//! Loaded once per run from a directory of trusted public keys and dropped
//! with the process; verification never imports into a persistent keyring.

use std::path::Path;

use sequoia_openpgp as openpgp;

use openpgp::Cert;
use openpgp::cert::CertParser;
use openpgp::parse::Parse;
use tracing::{debug, warn};

use forgesign_core::{Result, SignError};

/// A throwaway set of trusted certificates.
#[derive(Debug)]
pub struct TrustKeyring {
    certs: Vec<Cert>,
}

impl TrustKeyring {
    /// Load every certificate from every readable file in `dir`.
    ///
    /// Files that do not parse as OpenPGP certificates are skipped with a
    /// warning; an empty result is an error, because verification against
    /// zero trust anchors can never succeed.
    ///
    /// # Errors
    ///
    /// [`SignError::Io`] when the directory cannot be read,
    /// [`SignError::Verification`] when it yields no certificates.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let mut certs = Vec::new();
        let mut entries: Vec<_> = std::fs::read_dir(dir)?
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        entries.sort();

        for path in entries {
            let bytes = std::fs::read(&path)?;
            let parser = match CertParser::from_bytes(&bytes) {
                Ok(parser) => parser,
                Err(err) => {
                    warn!(path = %path.display(), %err, "skipping unparseable key file");
                    continue;
                },
            };
            let mut found = 0usize;
            for cert in parser {
                match cert {
                    Ok(cert) => {
                        found += 1;
                        certs.push(cert);
                    },
                    Err(err) => {
                        warn!(path = %path.display(), %err, "skipping unparseable certificate");
                    },
                }
            }
            debug!(path = %path.display(), count = found, "loaded trusted keys");
        }

        if certs.is_empty() {
            return Err(SignError::Verification(format!(
                "no trusted keys found in '{}'",
                dir.display()
            )));
        }
        Ok(Self { certs })
    }

    /// Keyring over an explicit certificate list.
    #[must_use]
    pub fn from_certs(certs: Vec<Cert>) -> Self {
        Self { certs }
    }

    /// The trusted certificates.
    #[must_use]
    pub fn certs(&self) -> &[Cert] {
        &self.certs
    }

    /// Number of trusted certificates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.certs.len()
    }

    /// Whether the keyring holds no certificates.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.certs.is_empty()
    }
}
