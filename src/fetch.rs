//! Download a pretrained model and its image processor from a Hugging Face
//! style registry into a local directory, so the server can start offline

use crate::config::{FetchSettings, MODEL_FILE};
use reqwest::{Client as HttpClient, StatusCode};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::*;

/// Errors returned by the fetcher
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Transport level failure talking to the registry
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The registry answered with a non-success status
    #[error("Download failed for {path}: {details}")]
    DownloadFailed { path: String, details: String },
    /// The repo exists but ships no TorchScript export
    #[error(
        "{model_id} does not publish a TorchScript `{file}`; export the model with \
         `torch.jit.trace(model, example).save(\"{file}\")`, upload it to the repo \
         and fetch again"
    )]
    MissingTorchScript { model_id: String, file: String },
    #[error("Registry returned an empty file: {0}")]
    EmptyFile(String),
    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

/// Where a single artifact comes from
pub fn resolve_url(settings: &FetchSettings, file: &str) -> String {
    format!(
        "{}/{}/resolve/{}/{}",
        settings.registry_url.trim_end_matches('/'),
        settings.model_id.trim_matches('/'),
        settings.revision,
        file
    )
}

/// Download every configured artifact of `settings.model_id` into `dest`,
/// replacing whatever was there. `dest` is only touched once all files have
/// been downloaded
pub async fn fetch_model(
    settings: &FetchSettings,
    dest: &Path,
) -> Result<Vec<PathBuf>, FetchError> {
    let staging = staging_dir(dest)?;
    if fs::metadata(&staging).await.is_ok() {
        fs::remove_dir_all(&staging).await?;
    }
    fs::create_dir_all(&staging).await?;

    info!("fetching {} into {}", settings.model_id, dest.display());

    let http = HttpClient::new();
    for file in &settings.files {
        download_one(&http, settings, file, &staging).await?;
    }

    if fs::metadata(dest).await.is_ok() {
        debug!("replacing previous contents of {}", dest.display());
        fs::remove_dir_all(dest).await?;
    }
    fs::rename(&staging, dest).await?;

    Ok(settings.files.iter().map(|f| dest.join(f)).collect())
}

/// Stream one artifact to `dir/file`
async fn download_one(
    http: &HttpClient,
    settings: &FetchSettings,
    file: &str,
    dir: &Path,
) -> Result<(), FetchError> {
    let url = resolve_url(settings, file);
    debug!("GET {url}");

    let mut req = http.get(&url);
    if let Some(token) = &settings.token {
        req = req.bearer_auth(token);
    }
    let mut resp = req.send().await?;

    if resp.status() == StatusCode::NOT_FOUND && file == MODEL_FILE {
        return Err(FetchError::MissingTorchScript {
            model_id: settings.model_id.clone(),
            file: file.to_string(),
        });
    }
    if !resp.status().is_success() {
        return Err(FetchError::DownloadFailed {
            path: file.to_string(),
            details: format!("HTTP {} from {url}", resp.status()),
        });
    }

    let dest = dir.join(file);
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut out = File::create(&dest).await?;
    let mut total = 0u64;
    while let Some(chunk) = resp.chunk().await? {
        out.write_all(&chunk).await?;
        total += chunk.len() as u64;
    }
    out.flush().await?;

    if total == 0 {
        return Err(FetchError::EmptyFile(file.to_string()));
    }

    info!("downloaded {file} ({total} bytes)");
    Ok(())
}

/// Sibling of `dest` used while downloading
fn staging_dir(dest: &Path) -> Result<PathBuf, FetchError> {
    let name = dest
        .file_name()
        .ok_or_else(|| FetchError::InvalidPath(format!("{} has no file name", dest.display())))?
        .to_string_lossy();
    Ok(dest.with_file_name(format!(".{name}.partial")))
}
