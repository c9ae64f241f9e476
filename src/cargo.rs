//! Cargo shipping: streaming remote artifacts into a server's volume.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::AppError;
use crate::models::CargoFile;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Normalizes a cargo target path to a safe path relative to the volume
/// root. Traversal segments are dropped rather than rejected; a hostile
/// panel can at worst write inside the volume.
pub fn safe_relative_path(target: &str) -> PathBuf {
    let mut parts: Vec<&str> = Vec::new();
    for segment in target.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.iter().collect()
}

/// Downloads every cargo entry into the volume, applying the readonly
/// file-mode policy. `hidden`, `noDelete`, and custom properties are
/// metadata for the panel; the daemon does not enforce them.
pub async fn ship_cargo(
    http: &reqwest::Client,
    volume_dir: &Path,
    cargo: &[CargoFile],
) -> Result<(), AppError> {
    for entry in cargo {
        ship_one(http, volume_dir, entry).await?;
    }
    Ok(())
}

async fn ship_one(
    http: &reqwest::Client,
    volume_dir: &Path,
    entry: &CargoFile,
) -> Result<(), AppError> {
    let relative = safe_relative_path(&entry.target_path);
    if relative.as_os_str().is_empty() {
        warn!(url = %entry.url, "Cargo entry resolves to an empty path, skipping.");
        return Ok(());
    }
    let target = volume_dir.join(&relative);
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await?;
    }

    debug!(url = %entry.url, target = %target.display(), "Shipping cargo.");
    let response = http
        .get(&entry.url)
        .timeout(DOWNLOAD_TIMEOUT)
        .send()
        .await
        .map_err(|e| AppError::Internal(format!("cargo download '{}': {e}", entry.url)))?;
    if !response.status().is_success() {
        return Err(AppError::Internal(format!(
            "cargo download '{}' returned {}",
            entry.url,
            response.status()
        )));
    }

    let mut file = fs::File::create(&target).await?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk =
            chunk.map_err(|e| AppError::Internal(format!("cargo stream '{}': {e}", entry.url)))?;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    drop(file);

    if entry.properties.readonly {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&target, std::fs::Permissions::from_mode(0o444)).await?;
        }
    }
    Ok(())
}
