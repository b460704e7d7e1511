//! Signing requests, topic derivation, and response correlation.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::{Map, Value};

use crate::config::Environment;

/// The two request kinds the remote signer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Sign a versioned commit object (detached metadata comes back).
    OstreeSign,
    /// Sign a batch of image artifacts (one detached `.sig` each).
    ArtifactsSign,
}

impl RequestKind {
    /// Wire name used in topic routing keys.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OstreeSign => "ostree-sign",
            Self::ArtifactsSign => "artifacts-sign",
        }
    }

    /// Topic the request is published to:
    /// `<prefix>.<env>.build.request.<kind>`.
    #[must_use]
    pub fn request_topic(self, prefix: &str, env: Environment) -> String {
        format!("{prefix}.{}.build.request.{}", env.as_str(), self.as_str())
    }

    /// Topic the completion notification arrives on:
    /// `<prefix>.<env>.build.request.<kind>.finished`.
    #[must_use]
    pub fn finished_topic(self, prefix: &str, env: Environment) -> String {
        format!("{}.finished", self.request_topic(prefix, env))
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific request payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignPayload {
    /// Commit path: the commit checksum plus the blob-store key the signer
    /// fetches the commit object from.
    Ostree {
        /// Hex checksum of the commit object.
        checksum: String,
        /// Blob-store key of the staged commit object.
        object_key: String,
    },
    /// Image path: blob-store keys of the artifacts to sign.
    Artifacts {
        /// Artifact keys, relative to the bucket.
        artifacts: Vec<String>,
    },
}

/// One signing request. Immutable once dispatched.
#[derive(Debug, Clone)]
pub struct SigningRequest {
    /// Which signer flow this addresses.
    pub kind: RequestKind,
    /// Build identifier, echoed back by the signer.
    pub build_id: String,
    /// Base architecture, echoed back by the signer.
    pub basearch: String,
    /// Caller-supplied extra keys, echoed back by the signer.
    pub extra_keys: BTreeMap<String, String>,
    /// Kind-specific payload.
    pub payload: SignPayload,
}

impl SigningRequest {
    /// Flat string-keyed wire body for the bus message.
    #[must_use]
    pub fn body(&self) -> Value {
        let mut body = Map::new();
        body.insert("build_id".into(), Value::String(self.build_id.clone()));
        body.insert("basearch".into(), Value::String(self.basearch.clone()));
        for (k, v) in &self.extra_keys {
            body.insert(k.clone(), Value::String(v.clone()));
        }
        match &self.payload {
            SignPayload::Ostree {
                checksum,
                object_key,
            } => {
                body.insert("checksum".into(), Value::String(checksum.clone()));
                body.insert("commit-object".into(), Value::String(object_key.clone()));
            },
            SignPayload::Artifacts { artifacts } => {
                body.insert(
                    "artifacts".into(),
                    Value::Array(artifacts.iter().cloned().map(Value::String).collect()),
                );
            },
        }
        Value::Object(body)
    }

    /// The correlation filter a completion message must satisfy to be
    /// accepted as the reply to this request.
    #[must_use]
    pub fn correlation_filter(&self) -> CorrelationFilter {
        let mut keys = self.extra_keys.clone();
        keys.insert("build_id".into(), self.build_id.clone());
        keys.insert("basearch".into(), self.basearch.clone());
        CorrelationFilter { keys }
    }
}

/// Key/value pairs an inbound completion body must match exactly.
///
/// There is no true request identifier on the wire: correlation is by exact
/// match on `build_id`, `basearch`, and the caller's extra keys. This is a
/// documented interim strategy; under concurrent duplicate requests for the
/// same build it cannot tell the replies apart. The evolution path is a
/// generated request id the signer echoes back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationFilter {
    keys: BTreeMap<String, String>,
}

impl CorrelationFilter {
    /// Build a filter from explicit key/value pairs.
    #[must_use]
    pub fn new(keys: BTreeMap<String, String>) -> Self {
        Self { keys }
    }

    /// Accept `body` iff every filter key is present with an identical
    /// string value. Extra unrelated keys in the body never disqualify a
    /// match: unrelated sign flows share the same finished topic.
    #[must_use]
    pub fn matches(&self, body: &Map<String, Value>) -> bool {
        self.keys
            .iter()
            .all(|(k, v)| body.get(k).and_then(Value::as_str) == Some(v.as_str()))
    }

    /// The filter's key/value pairs.
    #[must_use]
    pub fn keys(&self) -> &BTreeMap<String, String> {
        &self.keys
    }
}
