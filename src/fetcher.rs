//! Artifact fetcher: ensures the required model files exist locally before
//! the load phase, pulling missing ones from a remote source.
//!
//! Runs strictly before the service starts (pre-flight, or standalone via
//! `--fetch-only`). A fetch failure for one file never aborts the others;
//! the load phase is what decides whether a still-missing file is fatal.

use crate::registry::{LABEL_ENCODER_FILE, ModelId, VECTORIZER_FILE};
use anyhow::{Context, Result};
use futures::StreamExt;
use hf_hub::{Repo, RepoType, api::tokio::Api};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// The fixed set of files the classical load phase reads.
pub fn required_files() -> Vec<&'static str> {
    let mut files = vec![VECTORIZER_FILE, LABEL_ENCODER_FILE];
    files.extend(ModelId::CLASSICAL.iter().filter_map(ModelId::artifact_file));
    files
}

/// Where missing artifacts come from.
#[derive(Debug, Clone)]
pub enum ArtifactSource {
    /// Hugging Face Hub repository holding the artifact files, possibly
    /// nested one level deep under `models/`.
    HubRepo(String),
    /// Static filename -> direct download URL manifest.
    Manifest(HashMap<String, String>),
}

impl ArtifactSource {
    /// Resolve the configured source, if any. The manifest file is a JSON
    /// object mapping artifact filenames to URLs.
    pub fn from_config(
        hub_repo: Option<&str>,
        manifest_path: Option<&Path>,
    ) -> Result<Option<ArtifactSource>> {
        match (hub_repo, manifest_path) {
            (Some(repo), _) => Ok(Some(ArtifactSource::HubRepo(repo.to_string()))),
            (None, Some(path)) => {
                let raw = std::fs::read(path)
                    .with_context(|| format!("reading manifest {}", path.display()))?;
                let manifest: HashMap<String, String> = serde_json::from_slice(&raw)
                    .with_context(|| format!("parsing manifest {}", path.display()))?;
                Ok(Some(ArtifactSource::Manifest(manifest)))
            }
            (None, None) => Ok(None),
        }
    }
}

/// Required files not yet present under the artifacts directory.
pub fn missing_files(dir: &Path) -> Vec<&'static str> {
    required_files()
        .into_iter()
        .filter(|name| !dir.join(name).exists())
        .collect()
}

/// Make sure every required artifact exists under `dir`, fetching missing
/// ones from `source`. Files already present are never re-fetched.
#[tracing::instrument(skip(source), fields(artifacts_dir = %dir.display()))]
pub async fn ensure_artifacts(dir: &Path, source: &ArtifactSource) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating artifacts directory {}", dir.display()))?;

    let missing = missing_files(dir);
    if missing.is_empty() {
        info!("All required artifacts already present, nothing to fetch");
        return Ok(());
    }
    info!(missing = ?missing, "Fetching missing artifacts");

    match source {
        ArtifactSource::HubRepo(repo_id) => fetch_from_hub(dir, repo_id, &missing).await,
        ArtifactSource::Manifest(manifest) => fetch_from_urls(dir, manifest, &missing).await,
    }
}

async fn fetch_from_hub(dir: &Path, repo_id: &str, missing: &[&str]) -> Result<()> {
    let api = Api::new()?;
    let repo = api.repo(Repo::with_revision(
        repo_id.to_string(),
        RepoType::Model,
        "main".to_string(),
    ));

    // Scratch space inside the artifacts directory so the final copy stays
    // on one filesystem; removed on drop, success or not.
    let scratch = tempfile::tempdir_in(dir)?;

    for &name in missing {
        // Tolerate the artifacts sitting one level deep in the repo.
        let fetched = match repo.get(name).await {
            Ok(path) => Ok(path),
            Err(_) => repo.get(&format!("models/{name}")).await,
        };

        match fetched {
            Ok(cache_path) => match stage_into_place(&cache_path, scratch.path(), dir, name) {
                Ok(bytes) => info!(file = name, bytes, "Fetched artifact from hub"),
                Err(e) => error!(file = name, "Failed to place fetched artifact: {e:#}"),
            },
            Err(e) => error!(file = name, "Could not fetch from hub repo '{repo_id}': {e}"),
        }
    }

    Ok(())
}

async fn fetch_from_urls(
    dir: &Path,
    manifest: &HashMap<String, String>,
    missing: &[&str],
) -> Result<()> {
    let client = reqwest::Client::new();
    let scratch = tempfile::tempdir_in(dir)?;

    for &name in missing {
        let Some(url) = manifest.get(name) else {
            warn!(file = name, "No URL in manifest for required artifact");
            continue;
        };
        match download_one(&client, url, scratch.path(), name).await {
            Ok(staged) => match stage_into_place(&staged, scratch.path(), dir, name) {
                Ok(bytes) => info!(file = name, bytes, "Downloaded artifact"),
                Err(e) => error!(file = name, "Failed to place downloaded artifact: {e:#}"),
            },
            Err(e) => error!(file = name, url, "Download failed: {e:#}"),
        }
    }

    Ok(())
}

/// Stream one URL into a scratch file, logging progress as bytes arrive.
async fn download_one(
    client: &reqwest::Client,
    url: &str,
    scratch: &Path,
    name: &str,
) -> Result<PathBuf> {
    let response = client
        .get(url)
        .send()
        .await
        .context("request failed")?
        .error_for_status()
        .context("server returned an error status")?;

    let total = response.content_length();
    let staged = scratch.join(name);
    let mut file = std::fs::File::create(&staged)
        .with_context(|| format!("creating scratch file for {name}"))?;

    let mut stream = response.bytes_stream();
    let mut downloaded: u64 = 0;
    let mut last_logged: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("reading response body")?;
        file.write_all(&chunk)?;
        downloaded += chunk.len() as u64;
        // Progress every mebibyte; small artifacts log only the final line.
        if downloaded - last_logged >= 1024 * 1024 {
            last_logged = downloaded;
            match total {
                Some(total) => info!(file = name, downloaded, total, "Download progress"),
                None => info!(file = name, downloaded, "Download progress"),
            }
        }
    }
    file.flush()?;

    Ok(staged)
}

/// Copy a fetched file into the artifacts directory via the scratch area.
fn stage_into_place(fetched: &Path, scratch: &Path, dir: &Path, name: &str) -> Result<u64> {
    let staged = scratch.join(name);
    if fetched != staged {
        std::fs::copy(fetched, &staged)
            .with_context(|| format!("staging {}", fetched.display()))?;
    }
    let destination = dir.join(name);
    let bytes = std::fs::copy(&staged, &destination)
        .with_context(|| format!("installing {}", destination.display()))?;
    Ok(bytes)
}
