//! Plugin Fetcher
//!
//! Retrieves plugin bundles from HTTP(S) URLs, local directories or local
//! `.tar.gz` archives. Fetching never writes to disk; materializing a
//! bundle into the version store is a separate step.

use std::fs;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::thread;
use std::time::Duration;

use flate2::read::GzDecoder;
use reqwest::blocking::Client;
use sha2::{Digest, Sha256};
use tar::Archive;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{PlugError, Result};
use crate::manifest::{Manifest, MANIFEST_FILE};
use crate::source::{FetchDescriptor, Location};

const USER_AGENT: &str = concat!("plugctl/", env!("CARGO_PKG_VERSION"));

/// Opaque handle to fetched plugin content
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bundle {
    /// Plugin source directory on the local filesystem
    Directory(PathBuf),
    /// Gzip-compressed tarball held in memory
    Archive(Vec<u8>),
}

impl Bundle {
    /// sha256 of the bundle content, `sha256:<hex>`
    pub fn checksum(&self) -> Result<String> {
        let mut hasher = Sha256::new();
        match self {
            Bundle::Archive(bytes) => hasher.update(bytes),
            Bundle::Directory(dir) => {
                for entry in WalkDir::new(dir)
                    .sort_by_file_name()
                    .into_iter()
                    .filter_entry(|e| e.file_name() != ".git")
                {
                    let entry = entry.map_err(std::io::Error::from)?;
                    if !entry.file_type().is_file() {
                        continue;
                    }
                    let rel = entry.path().strip_prefix(dir).unwrap_or(entry.path());
                    hasher.update(rel.to_string_lossy().as_bytes());
                    hasher.update(fs::read(entry.path())?);
                }
            }
        }
        Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
    }

    /// Write the bundle content into `dest` (created if missing)
    pub fn materialize(&self, dest: &Path) -> Result<()> {
        fs::create_dir_all(dest)?;
        match self {
            Bundle::Directory(src) => copy_dir_recursive(src, dest),
            Bundle::Archive(bytes) => unpack_archive(bytes, dest),
        }
    }
}

/// A manifest together with the content it came from
#[derive(Debug, Clone)]
pub struct FetchedPlugin {
    pub manifest: Manifest,
    pub bundle: Bundle,
    pub location: Location,
}

/// Retrieval capability used by the resolver and orchestrator
pub trait Fetch: Send + Sync {
    fn fetch(&self, descriptor: &FetchDescriptor) -> Result<FetchedPlugin>;
}

/// Bounded retry for transient fetch failures
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            attempts: 1,
            backoff: Duration::ZERO,
        }
    }
}

/// Fetch, retrying transient failures up to `policy.attempts` times
pub fn fetch_with_retry(
    fetcher: &dyn Fetch,
    descriptor: &FetchDescriptor,
    policy: RetryPolicy,
) -> Result<FetchedPlugin> {
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match fetcher.fetch(descriptor) {
            Err(e) if e.is_transient() && attempt < attempts => {
                warn!(
                    plugin = %descriptor.name,
                    location = %descriptor.location,
                    attempt,
                    "transient fetch failure, retrying: {}",
                    e
                );
                thread::sleep(policy.backoff * attempt);
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Plugin Fetcher - HTTP and local filesystem retrieval
pub struct PluginFetcher {
    client: Client,
}

impl PluginFetcher {
    /// Create a fetcher whose HTTP requests time out after `timeout`
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| PlugError::Fetch {
                location: "<client>".to_string(),
                message: e.to_string(),
                transient: false,
            })?;

        Ok(Self { client })
    }

    fn fetch_http(&self, descriptor: &FetchDescriptor, url: &reqwest::Url) -> Result<FetchedPlugin> {
        debug!(plugin = %descriptor.name, %url, "downloading plugin bundle");

        let transient = |message: String| PlugError::Fetch {
            location: url.to_string(),
            message,
            transient: true,
        };

        let response = self
            .client
            .get(url.clone())
            .send()
            .map_err(|e| transient(e.to_string()))?;

        if !response.status().is_success() {
            return Err(transient(format!("HTTP {}", response.status())));
        }

        let bytes = response.bytes().map_err(|e| transient(e.to_string()))?.to_vec();
        let manifest = read_archive_manifest(&bytes, url.as_str())?;

        Ok(FetchedPlugin {
            manifest,
            bundle: Bundle::Archive(bytes),
            location: Location::Http(url.clone()),
        })
    }

    fn fetch_path(&self, descriptor: &FetchDescriptor, path: &Path) -> Result<FetchedPlugin> {
        debug!(plugin = %descriptor.name, path = %path.display(), "reading plugin bundle");

        if !path.exists() {
            return Err(PlugError::Fetch {
                location: path.display().to_string(),
                message: "path does not exist".to_string(),
                transient: false,
            });
        }

        let (manifest, bundle) = if path.is_dir() {
            if !path.join(MANIFEST_FILE).exists() {
                return Err(PlugError::Fetch {
                    location: path.display().to_string(),
                    message: format!("no {} in directory", MANIFEST_FILE),
                    transient: false,
                });
            }
            (Manifest::load(path)?, Bundle::Directory(path.to_path_buf()))
        } else if is_archive_path(path) {
            let bytes = fs::read(path)?;
            let manifest = read_archive_manifest(&bytes, &path.display().to_string())?;
            (manifest, Bundle::Archive(bytes))
        } else {
            return Err(PlugError::Fetch {
                location: path.display().to_string(),
                message: "expected a plugin directory or a .tar.gz archive".to_string(),
                transient: false,
            });
        };

        Ok(FetchedPlugin {
            manifest,
            bundle,
            location: Location::Path(path.to_path_buf()),
        })
    }
}

impl Fetch for PluginFetcher {
    fn fetch(&self, descriptor: &FetchDescriptor) -> Result<FetchedPlugin> {
        match &descriptor.location {
            Location::Http(url) => self.fetch_http(descriptor, url),
            Location::Path(path) => self.fetch_path(descriptor, path),
        }
    }
}

fn is_archive_path(path: &Path) -> bool {
    let name = path.to_string_lossy();
    name.ends_with(".tar.gz") || name.ends_with(".tgz")
}

// ========== Archive Handling ==========

/// Find `plugin.json` at the archive root or under a single top-level
/// directory. Returns the directory prefix it was found under.
fn locate_manifest_entry(bytes: &[u8]) -> Result<Option<(PathBuf, Vec<u8>)>> {
    let mut archive = Archive::new(GzDecoder::new(bytes));
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let components = significant_components(&path);

        let prefix = match components.as_slice() {
            [Component::Normal(file)] if *file == MANIFEST_FILE => PathBuf::new(),
            [Component::Normal(dir), Component::Normal(file)] if *file == MANIFEST_FILE => {
                PathBuf::from(dir)
            }
            _ => continue,
        };

        let mut content = Vec::new();
        entry.read_to_end(&mut content)?;
        return Ok(Some((prefix, content)));
    }
    Ok(None)
}

/// Path components with `.` dropped, so `./pkg/x` and `pkg/x` compare equal
fn significant_components(path: &Path) -> Vec<Component<'_>> {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

fn read_archive_manifest(bytes: &[u8], location: &str) -> Result<Manifest> {
    let (prefix, content) = locate_manifest_entry(bytes)
        .map_err(|e| PlugError::Fetch {
            location: location.to_string(),
            message: format!("unreadable archive: {}", e),
            transient: false,
        })?
        .ok_or_else(|| PlugError::Fetch {
            location: location.to_string(),
            message: format!("no {} in archive", MANIFEST_FILE),
            transient: false,
        })?;

    Manifest::from_slice(&content, &Path::new(location).join(prefix).join(MANIFEST_FILE))
}

fn unpack_archive(bytes: &[u8], dest: &Path) -> Result<()> {
    let prefix = locate_manifest_entry(bytes)?
        .map(|(prefix, _)| prefix)
        .unwrap_or_default();

    let mut archive = Archive::new(GzDecoder::new(bytes));
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        // Links could point later entries outside the version directory
        let entry_type = entry.header().entry_type();
        if entry_type.is_symlink() || entry_type.is_hard_link() {
            warn!(path = %path.display(), "skipping link entry in plugin archive");
            continue;
        }

        let components = significant_components(&path);
        if !components.iter().all(|c| matches!(c, Component::Normal(_))) {
            continue;
        }
        let normalized: PathBuf = components.iter().collect();
        let Ok(rel) = normalized.strip_prefix(&prefix) else {
            continue;
        };
        if rel.as_os_str().is_empty() {
            continue;
        }

        let target = dest.join(rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        entry.unpack(&target)?;
    }
    Ok(())
}

// ========== File Operations ==========

/// Copy directory recursively, skipping `.git`
fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        if src_path.is_dir() {
            if entry.file_name() == ".git" {
                continue;
            }
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)?;
        }
    }

    Ok(())
}
