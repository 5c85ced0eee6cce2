//! Remote checkpoint fetching.
//!
//! An `https://` checkpoint location is materialized into a local cache
//! directory before reading: the manifest is fetched first, then every
//! shard archive it references. Legacy checkpoints without a manifest are
//! probed by shard index until the first miss. Files already present in
//! the cache are skipped, so re-opening a remote checkpoint is cheap.

use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};

use crate::MeshCkptError;

use super::MANIFEST_FILE;

/// Materialize a remote checkpoint into `cache_dir` and return the local
/// directory holding it.
pub async fn fetch_checkpoint(base_url: &str, cache_dir: &Path) -> crate::Result<PathBuf> {
    let dest_dir = cache_dir.join(sanitize_url(base_url));
    std::fs::create_dir_all(&dest_dir)?;

    tracing::info!("Fetching checkpoint {} into {:?}", base_url, dest_dir);

    let client = reqwest::Client::new();

    let archives = match fetch_file(&client, base_url, MANIFEST_FILE, &dest_dir).await? {
        true => {
            let manifest_path = dest_dir.join(MANIFEST_FILE);
            let text = std::fs::read_to_string(&manifest_path)?;
            shard_files_from_manifest(&text)?
        }
        false => probe_legacy_shards(&client, base_url, &dest_dir).await?,
    };

    if archives.is_empty() {
        return Err(MeshCkptError::DownloadError(format!(
            "no manifest and no shard files at {}",
            base_url
        )));
    }

    let pb = ProgressBar::new(archives.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("=>-"),
    );

    for name in &archives {
        pb.set_message(name.clone());
        if !fetch_file(&client, base_url, name, &dest_dir).await? {
            return Err(MeshCkptError::DownloadError(format!(
                "shard archive {} referenced by manifest missing at {}",
                name, base_url
            )));
        }
        pb.inc(1);
    }
    pb.finish_with_message("checkpoint fetched");

    Ok(dest_dir)
}

/// Download one file if not cached. Returns false on HTTP 404 (file does
/// not exist at the origin), which legacy probing relies on.
async fn fetch_file(
    client: &reqwest::Client,
    base_url: &str,
    filename: &str,
    dest_dir: &Path,
) -> crate::Result<bool> {
    let dest_path = dest_dir.join(filename);
    if dest_path.exists() {
        tracing::debug!("File {} already cached, skipping", filename);
        return Ok(true);
    }

    let url = format!("{}/{}", base_url, filename);
    let response = client.get(&url).send().await.map_err(|e| {
        MeshCkptError::DownloadError(format!("failed to fetch {}: {}", filename, e))
    })?;

    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Ok(false);
    }
    if !response.status().is_success() {
        return Err(MeshCkptError::DownloadError(format!(
            "failed to fetch {}: HTTP {}",
            filename,
            response.status()
        )));
    }

    let bytes = response.bytes().await.map_err(|e| {
        MeshCkptError::DownloadError(format!("failed to read {}: {}", filename, e))
    })?;

    // Fresh temp name then rename, same write-once discipline as the
    // local store.
    let tmp_path = dest_dir.join(format!(".{}.tmp-{}", filename, std::process::id()));
    tokio::fs::write(&tmp_path, &bytes).await?;
    std::fs::rename(&tmp_path, &dest_path)?;

    tracing::debug!("Downloaded {} ({} bytes)", filename, bytes.len());
    Ok(true)
}

/// Shard archive names referenced by a manifest document. Parsed loosely;
/// full manifest validation happens in the checkpoint layer.
fn shard_files_from_manifest(text: &str) -> crate::Result<Vec<String>> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| MeshCkptError::ManifestError(format!("corrupt remote manifest: {}", e)))?;
    let files = value["shard_files"]
        .as_array()
        .ok_or_else(|| {
            MeshCkptError::ManifestError("remote manifest lists no shard files".to_string())
        })?
        .iter()
        .filter_map(|f| f.as_str().map(String::from))
        .collect();
    Ok(files)
}

/// Probe `shard_0.safetensors`, `shard_1.safetensors`, … until the first
/// 404, downloading as we go.
async fn probe_legacy_shards(
    client: &reqwest::Client,
    base_url: &str,
    dest_dir: &Path,
) -> crate::Result<Vec<String>> {
    let mut names = Vec::new();
    loop {
        let name = format!("shard_{}.safetensors", names.len());
        if !fetch_file(client, base_url, &name, dest_dir).await? {
            break;
        }
        names.push(name);
    }
    Ok(names)
}

fn sanitize_url(url: &str) -> String {
    url.trim_start_matches("https://")
        .trim_start_matches("http://")
        .replace(['/', ':'], "--")
}
