//! The `sign` subcommand: one full request/verify cycle.
//!
//! Sequencing is the whole point here: the listener's subscription must be
//! acknowledged before the request is published (the response queue is
//! transient and non-replayable), and no verifier runs before a successful
//! completion message arrives.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{ArgGroup, Args};
use tracing::info;

use forgesign_core::bus::amqp::AmqpConnection;
use forgesign_core::completion::{DEFAULT_WAIT, wait_for_completion};
use forgesign_core::dispatch::Dispatcher;
use forgesign_core::listener::spawn_listener;
use forgesign_core::meta::{BuildIndex, BuildMeta, build_dir};
use forgesign_core::store::{FsBlobStore, Stager};
use forgesign_core::{
    BucketTarget, Environment, MessagingConfig, RequestKind, SignPayload, SigningRequest, archive,
    config,
};
use forgesign_gpg::commit::{accept_commit, object_path, verify_commit};
use forgesign_gpg::image::verify_images;
use forgesign_gpg::keyring::TrustKeyring;

/// Arguments for `forgesign sign`.
#[derive(Args, Debug)]
#[command(group(
    ArgGroup::new("mode")
        .required(true)
        .multiple(false)
        .args(["ostree", "images"])
))]
pub struct SignArgs {
    /// Sign the build's versioned commit object
    #[arg(long)]
    pub ostree: bool,

    /// Sign the build's image artifacts
    #[arg(long)]
    pub images: bool,

    /// Blob-store target, `s3://bucket/prefix` or `bucket/prefix`
    #[arg(long)]
    pub bucket: String,

    /// Extra correlation key (KEY=VAL, repeatable)
    #[arg(long = "extra-key", value_name = "KEY=VAL")]
    pub extra_keys: Vec<String>,

    /// Directory of trusted public keys
    #[arg(long, default_value = "/etc/pki/rpm-gpg")]
    pub keys: PathBuf,

    /// Deployment environment (production or staging)
    #[arg(long, default_value = "production")]
    pub env: Environment,

    /// Build to sign: an explicit id, or "latest"
    #[arg(long, default_value = "latest")]
    pub build: String,

    /// Base architecture of the build
    #[arg(long, default_value = std::env::consts::ARCH)]
    pub basearch: String,

    /// Build tree root
    #[arg(long, default_value = "builds")]
    pub builds_dir: PathBuf,

    /// Local commit store to re-import the signed commit into
    #[arg(long, default_value = "repo")]
    pub repo: PathBuf,

    /// Root directory backing the blob store
    #[arg(long, default_value = "store")]
    pub store_root: PathBuf,

    /// Seconds to wait for the signer's completion message
    #[arg(long, default_value_t = DEFAULT_WAIT.as_secs())]
    pub timeout: u64,

    /// Messaging configuration file (TOML)
    #[arg(long)]
    pub messaging_config: PathBuf,
}

/// Run the sign cycle to completion.
pub fn run(args: &SignArgs) -> Result<()> {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    rt.block_on(run_cycle(args))
}

async fn run_cycle(args: &SignArgs) -> Result<()> {
    let target = BucketTarget::parse(&args.bucket)?;
    let mut extra_keys = BTreeMap::new();
    for raw in &args.extra_keys {
        let (key, value) = config::parse_extra_key(raw)?;
        extra_keys.insert(key, value);
    }

    let index = BuildIndex::from_dir(&args.builds_dir)
        .with_context(|| format!("cannot load build index from '{}'", args.builds_dir.display()))?;
    let build_id = index.resolve(&args.build)?.to_string();
    let dir = build_dir(&args.builds_dir, &build_id, &args.basearch);
    let mut meta = BuildMeta::from_dir(&dir)
        .with_context(|| format!("cannot load build metadata from '{}'", dir.display()))?;
    info!(build = %build_id, basearch = %args.basearch, "signing build");

    // Ephemeral trust store, populated once per run.
    let keyring = TrustKeyring::from_dir(&args.keys)?;

    let store = FsBlobStore::new(args.store_root.join(&target.bucket));
    let stager = Stager::new(&store, &target);

    let messaging = MessagingConfig::from_file(&args.messaging_config)?;
    // Two independently constructed connections: authenticated publish and
    // public consume never share client state.
    let consumer = AmqpConnection::connect(&messaging.consumer()?.url, &messaging.exchange).await?;
    let publisher =
        AmqpConnection::connect(&messaging.publisher()?.url, &messaging.exchange).await?;

    let (kind, payload, commit_input) = if args.ostree {
        let (payload, commit) = stage_commit(&stager, &dir, &meta).await?;
        (RequestKind::OstreeSign, payload, Some(commit))
    } else {
        (
            RequestKind::ArtifactsSign,
            stage_images(&stager, &dir, &meta, &args.basearch).await?,
            None,
        )
    };

    let request = SigningRequest {
        kind,
        build_id: build_id.clone(),
        basearch: args.basearch.clone(),
        extra_keys,
        payload,
    };

    // Subscribe first; publish only after the binding is acknowledged.
    let finished = kind.finished_topic(&messaging.topic_prefix, args.env);
    let mut listener = spawn_listener(
        Arc::new(consumer),
        finished,
        request.correlation_filter(),
    );
    listener.registered().await?;

    Dispatcher::new(Arc::new(publisher), &messaging.topic_prefix, args.env)
        .dispatch(&request)
        .await?;

    wait_for_completion(listener.completion, Duration::from_secs(args.timeout)).await?;
    info!("signer reported success; verifying signatures");

    if let Some(commit) = commit_input {
        finish_commit(args, &stager, &dir, &mut meta, &keyring, &commit).await?;
    } else {
        let outcomes =
            verify_images(&stager, &dir, &meta, &args.basearch, &keyring, args.env).await?;
        for outcome in &outcomes {
            println!(
                "{}: signed by {}",
                outcome.name,
                outcome
                    .result
                    .signer_fingerprint
                    .as_deref()
                    .unwrap_or("unknown signer")
            );
        }
    }

    println!("sign: {build_id} ({}) complete", kind.as_str());
    Ok(())
}

/// The staged commit object: checksum plus its bytes, kept around for the
/// verification step after the signer finishes.
struct CommitInput {
    checksum: String,
    bytes: Vec<u8>,
}

async fn stage_commit(
    stager: &Stager<'_>,
    dir: &std::path::Path,
    meta: &BuildMeta,
) -> Result<(SignPayload, CommitInput)> {
    let checksum = meta
        .ostree_commit
        .clone()
        .context("build metadata has no commit checksum to sign")?;
    let archive_entry = meta
        .ostree_archive
        .as_ref()
        .context("build metadata has no commit archive")?;

    let bytes = archive::read_entry(
        &dir.join(&archive_entry.path),
        &object_path(&checksum, "commit")?,
    )?;

    // Fixed scratch location in the blob store; a re-run overwrites it.
    let scratch = tempfile::NamedTempFile::new_in(dir)?;
    std::fs::write(scratch.path(), &bytes)?;
    let object_key = stager.commit_object_key(&checksum);
    stager.upload(&object_key, scratch.path()).await?;

    Ok((
        SignPayload::Ostree {
            checksum: checksum.clone(),
            object_key,
        },
        CommitInput { checksum, bytes },
    ))
}

async fn stage_images(
    stager: &Stager<'_>,
    dir: &std::path::Path,
    meta: &BuildMeta,
    basearch: &str,
) -> Result<SignPayload> {
    if meta.images.is_empty() {
        bail!("build metadata lists no image artifacts to sign");
    }
    let mut artifacts = Vec::with_capacity(meta.images.len());
    for entry in meta.images.values() {
        let key = stager.artifact_key(&meta.build_id, basearch, &entry.path);
        stager.upload_if_missing(&key, &dir.join(&entry.path)).await?;
        artifacts.push(key);
    }
    Ok(SignPayload::Artifacts { artifacts })
}

async fn finish_commit(
    args: &SignArgs,
    stager: &Stager<'_>,
    dir: &std::path::Path,
    meta: &mut BuildMeta,
    keyring: &TrustKeyring,
    commit: &CommitInput,
) -> Result<()> {
    let meta_key = stager.commit_metadata_key(&commit.checksum);
    let scratch = tempfile::NamedTempFile::new_in(dir)?;
    stager.download(&meta_key, scratch.path()).await?;
    let commitmeta = std::fs::read(scratch.path())?;

    verify_commit(
        &commit.bytes,
        &commit.checksum,
        &commitmeta,
        &args.keys,
        keyring,
        args.env,
    )?;
    accept_commit(dir, meta, &commit.checksum, &commitmeta, &args.repo)?;
    println!("commit {} signed and re-imported", commit.checksum);
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[derive(Parser, Debug)]
    struct Harness {
        #[command(flatten)]
        args: SignArgs,
    }

    fn parse(argv: &[&str]) -> Result<SignArgs, clap::Error> {
        let mut full = vec!["harness"];
        full.extend_from_slice(argv);
        Harness::try_parse_from(full).map(|h| h.args)
    }

    #[test]
    fn exactly_one_mode_is_required() {
        let base = [
            "--bucket",
            "builds/fcos",
            "--messaging-config",
            "messaging.toml",
        ];
        assert!(parse(&base).is_err());

        let mut both = base.to_vec();
        both.extend(["--ostree", "--images"]);
        assert!(parse(&both).is_err());

        let mut ostree = base.to_vec();
        ostree.push("--ostree");
        let args = parse(&ostree).unwrap();
        assert!(args.ostree && !args.images);
        assert_eq!(args.env, Environment::Production);
        assert_eq!(args.build, "latest");
        assert_eq!(args.timeout, DEFAULT_WAIT.as_secs());
    }

    #[test]
    fn staging_environment_and_extra_keys_parse() {
        let args = parse(&[
            "--images",
            "--bucket",
            "s3://builds/fcos",
            "--messaging-config",
            "messaging.toml",
            "--env",
            "staging",
            "--extra-key",
            "stream=stable",
            "--extra-key",
            "ref=prod",
        ])
        .unwrap();
        assert_eq!(args.env, Environment::Staging);
        assert_eq!(args.extra_keys, vec!["stream=stable", "ref=prod"]);
    }
}
