// Downloads submission and harness archives and unpacks them.
//
// http(s) URLs go through reqwest; file:// URLs are read from disk. Archives
// are zip files whose entries must stay inside the destination directory.

use anyhow::{anyhow, bail, Context, Result};
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Upper bound on an unpacked archive
const MAX_UNPACKED_BYTES: u64 = 512 * 1024 * 1024;

#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
}

impl Fetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }

    pub async fn download(&self, url: &str) -> Result<Vec<u8>> {
        if let Some(path) = url.strip_prefix("file://") {
            return tokio::fs::read(path)
                .await
                .with_context(|| format!("Failed to read {}", path));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            bail!("Unsupported file URL: {}", url);
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to download {}", url))?
            .error_for_status()?;
        let bytes = response.bytes().await?;
        debug!(url = %url, bytes = bytes.len(), "Downloaded archive");
        Ok(bytes.to_vec())
    }

    /// Download `url` and unpack it into `dest`
    pub async fn fetch_into(&self, url: &str, dest: &Path) -> Result<Vec<PathBuf>> {
        let bytes = self.download(url).await?;
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || extract_zip(&bytes, &dest)).await?
    }
}

/// Unpack a zip archive into `dest`, returning the written files.
///
/// Any entry that would land outside `dest` rejects the whole archive.
pub fn extract_zip(bytes: &[u8], dest: &Path) -> Result<Vec<PathBuf>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).context("Invalid zip archive")?;
    std::fs::create_dir_all(dest)?;

    let mut written = Vec::new();
    let mut total: u64 = 0;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let rel = entry
            .enclosed_name()
            .ok_or_else(|| anyhow!("Archive entry escapes its directory: {}", entry.name()))?;
        let target = dest.join(rel);

        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut buf = Vec::new();
        (&mut entry).take(MAX_UNPACKED_BYTES + 1).read_to_end(&mut buf)?;
        total += buf.len() as u64;
        if total > MAX_UNPACKED_BYTES {
            bail!("Archive exceeds {} bytes when unpacked", MAX_UNPACKED_BYTES);
        }
        std::fs::write(&target, &buf).with_context(|| format!("Failed to write {}", target.display()))?;
        written.push(target);
    }
    Ok(written)
}
