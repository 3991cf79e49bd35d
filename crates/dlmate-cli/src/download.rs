use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use dlmate_core::{ArtifactCatalog, ArtifactSource, Mirror, PlatformTag, ToolkitVersion};
use dlmate_installer::{ArtifactFetcher, EngineError, FetchedArtifact};
use dlmate_security::verify_sha256_file;
use tracing::{debug, info, warn};

use crate::render::{OutputStyle, TerminalRenderer};

const USER_AGENT: &str = concat!("dlmate/", env!("CARGO_PKG_VERSION"));
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const CHUNK_SIZE: usize = 64 * 1024;

/// Fetches toolkit runfiles over HTTP from the catalog's mirror.
pub(crate) struct HttpArtifactFetcher {
    catalog: ArtifactCatalog,
    mirror: Mirror,
    style: OutputStyle,
    client: reqwest::blocking::Client,
}

impl HttpArtifactFetcher {
    pub(crate) fn new(catalog: ArtifactCatalog, mirror: Mirror, style: OutputStyle) -> Result<Self> {
        Ok(Self {
            catalog,
            mirror,
            style,
            client: create_download_client()?,
        })
    }

    fn resolve(&self, version: &ToolkitVersion, platform: PlatformTag) -> Result<ArtifactSource> {
        self.catalog
            .resolve(version, platform, self.mirror)
            .ok_or_else(|| {
                anyhow::Error::from(EngineError::UnsupportedVersion {
                    version: version.to_string(),
                    platform: platform.as_str().to_string(),
                })
            })
    }
}

impl ArtifactFetcher for HttpArtifactFetcher {
    fn supports(&self, version: &ToolkitVersion, platform: PlatformTag) -> bool {
        self.catalog.supports(version, platform)
    }

    fn fetch(
        &self,
        version: &ToolkitVersion,
        platform: PlatformTag,
        dest_dir: &Path,
        cancel: &AtomicBool,
    ) -> Result<FetchedArtifact> {
        let source = self.resolve(version, platform)?;
        let dest = dest_dir.join(&source.file_name);

        if dest.is_file() {
            match &source.sha256 {
                Some(expected) if !verify_sha256_file(&dest, expected)? => {
                    warn!(path = %dest.display(), "cached artifact failed checksum; downloading again");
                }
                _ => {
                    info!(path = %dest.display(), "reusing downloaded artifact");
                    return Ok(FetchedArtifact {
                        path: dest,
                        downloaded: false,
                    });
                }
            }
        }

        info!(url = %source.url, mirror = self.mirror.as_str(), "downloading CUDA {version}");
        let renderer = TerminalRenderer::from_style(self.style);
        let mut progress = renderer.start_download(&format!("cuda {version}"), None);
        let result = download_artifact(&self.client, &source.url, &dest, cancel, |downloaded, total| {
            progress.set(downloaded, total)
        });
        match result {
            Ok(bytes) => {
                progress.finish_success();
                debug!(bytes, path = %dest.display(), "artifact downloaded");
            }
            Err(err) => {
                progress.finish_abandon();
                return Err(err);
            }
        }

        if let Some(expected) = &source.sha256 {
            if !verify_sha256_file(&dest, expected)? {
                let _ = fs::remove_file(&dest);
                return Err(anyhow!(
                    "sha256 mismatch for {}: expected {expected}",
                    source.file_name
                ));
            }
        }

        Ok(FetchedArtifact {
            path: dest,
            downloaded: true,
        })
    }
}

pub(crate) fn create_download_client() -> Result<reqwest::blocking::Client> {
    reqwest::blocking::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(None::<Duration>)
        .build()
        .context("failed to build blocking HTTP client")
}

/// Streams `url` into `<cache_path>.part` and renames it into place once the
/// body is complete. The partial file is removed on any failure, including
/// `cancel` being set between chunks.
pub(crate) fn download_artifact<F>(
    client: &reqwest::blocking::Client,
    url: &str,
    cache_path: &Path,
    cancel: &AtomicBool,
    mut on_progress: F,
) -> Result<u64>
where
    F: FnMut(u64, Option<u64>),
{
    if let Some(parent) = cache_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create download dir: {}", parent.display()))?;
    }

    let part_path = part_path_for(cache_path);
    let downloaded = match stream_to_file(client, url, &part_path, cancel, &mut on_progress) {
        Ok(downloaded) => downloaded,
        Err(err) => {
            let _ = fs::remove_file(&part_path);
            return Err(err);
        }
    };

    if cache_path.exists() {
        fs::remove_file(cache_path)
            .with_context(|| format!("failed to replace artifact: {}", cache_path.display()))?;
    }
    fs::rename(&part_path, cache_path).with_context(|| {
        format!(
            "failed to move downloaded artifact into place: {}",
            cache_path.display()
        )
    })?;

    Ok(downloaded)
}

pub(crate) fn part_path_for(cache_path: &Path) -> PathBuf {
    cache_path.with_file_name(format!(
        "{}.part",
        cache_path
            .file_name()
            .and_then(|v| v.to_str())
            .unwrap_or("artifact")
    ))
}

fn stream_to_file(
    client: &reqwest::blocking::Client,
    url: &str,
    part_path: &Path,
    cancel: &AtomicBool,
    on_progress: &mut dyn FnMut(u64, Option<u64>),
) -> Result<u64> {
    if cancel.load(Ordering::SeqCst) {
        return Err(anyhow!("download cancelled: {url}"));
    }
    let mut response = client
        .get(url)
        .send()
        .with_context(|| format!("download request failed: {url}"))?;
    let status = response.status();
    if !status.is_success() {
        return Err(anyhow!("download failed: {url} returned HTTP {status}"));
    }

    let total = response.content_length();
    on_progress(0, total);

    let mut file = File::create(part_path)
        .with_context(|| format!("failed to create {}", part_path.display()))?;
    let mut buffer = vec![0_u8; CHUNK_SIZE];
    let mut downloaded = 0_u64;
    loop {
        if cancel.load(Ordering::SeqCst) {
            return Err(anyhow!("download cancelled: {url}"));
        }
        let read = response
            .read(&mut buffer)
            .with_context(|| format!("failed reading response body: {url}"))?;
        if read == 0 {
            break;
        }
        file.write_all(&buffer[..read])
            .with_context(|| format!("failed writing {}", part_path.display()))?;
        downloaded += read as u64;
        on_progress(downloaded, total);
    }
    file.sync_all()
        .with_context(|| format!("failed to sync {}", part_path.display()))?;

    if let Some(total) = total {
        if downloaded != total {
            return Err(anyhow!(
                "download truncated: {url} delivered {downloaded} of {total} bytes"
            ));
        }
    }

    Ok(downloaded)
}
