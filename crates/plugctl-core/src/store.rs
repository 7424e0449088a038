//! Version Store
//!
//! Side-by-side plugin versions on disk plus one active pointer per plugin:
//!
//! ```text
//! <root>/<name>/<version>/          materialized bundle + .receipt.toml
//! <root>/<name>/ACTIVE              active version marker
//! ```
//!
//! Versions are written to a staging directory and renamed into place, and
//! the marker is replaced by write-then-rename, so an interrupted install
//! never leaves the marker pointing at a partially written version.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{PlugError, Result};
use crate::fetcher::Bundle;
use crate::manifest::Manifest;
use crate::source::is_valid_name;
use crate::version::Version;

pub const ACTIVE_FILE: &str = "ACTIVE";
const RECEIPT_FILE: &str = ".receipt.toml";
const STAGING_PREFIX: &str = ".staging-";
const TRASH_PREFIX: &str = ".trash-";

/// Bookkeeping written next to the materialized bundle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallReceipt {
    pub installed_at: DateTime<Utc>,
    pub origin: String,
    pub checksum: String,
}

/// One installed (name, version) pair
#[derive(Debug, Clone)]
pub struct StoredVersion {
    pub name: String,
    pub version: Version,
    pub storage_path: PathBuf,
    pub manifest: Manifest,
    pub installed_at: DateTime<Utc>,
    pub origin: String,
    pub checksum: String,
}

/// Per-name mutual exclusion for store mutations
#[derive(Default)]
struct NameLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl NameLocks {
    fn get(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(name.to_string()).or_default().clone()
    }
}

/// Version Store - owns every installed plugin version
pub struct VersionStore {
    root: PathBuf,
    locks: NameLocks,
}

impl VersionStore {
    /// Open (creating if needed) a store rooted at `root`.
    ///
    /// Leftover staging and trash directories from an interrupted run are
    /// swept away.
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        let store = Self {
            root: root.to_path_buf(),
            locks: NameLocks::default(),
        };
        store.sweep()?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn plugin_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn version_dir(&self, name: &str, version: &Version) -> PathBuf {
        self.plugin_dir(name).join(version.to_string())
    }

    fn sweep(&self) -> Result<()> {
        for plugin in fs::read_dir(&self.root)? {
            let plugin = plugin?;
            if !plugin.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(plugin.path())? {
                let entry = entry?;
                let file_name = entry.file_name();
                let file_name = file_name.to_string_lossy();
                if file_name.starts_with(STAGING_PREFIX) || file_name.starts_with(TRASH_PREFIX) {
                    warn!(path = %entry.path().display(), "removing leftover directory");
                    fs::remove_dir_all(entry.path())?;
                }
            }
        }
        Ok(())
    }

    // ========== Writes ==========

    /// Run `f` while holding the per-name lock of `name`.
    ///
    /// Every mutation made through the [`LockedPlugin`] happens under the
    /// same guard, so a multi-step change (store, run a hook, activate or
    /// roll back) cannot interleave with another change to that plugin.
    pub fn with_lock<T>(&self, name: &str, f: impl FnOnce(&LockedPlugin<'_>) -> Result<T>) -> Result<T> {
        let lock = self.locks.get(name);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        f(&LockedPlugin { store: self, name })
    }

    /// Persist a version. Storing an existing (name, version) is a no-op
    /// returning the existing record.
    pub fn put(
        &self,
        name: &str,
        version: &Version,
        manifest: &Manifest,
        bundle: &Bundle,
        origin: &str,
    ) -> Result<StoredVersion> {
        self.with_lock(name, |plugin| plugin.put(version, manifest, bundle, origin))
    }

    /// Point the plugin at an already stored version
    pub fn set_active(&self, name: &str, version: &Version) -> Result<()> {
        self.with_lock(name, |plugin| plugin.set_active(version))
    }

    /// Remove one stored version.
    ///
    /// The active version can only be removed when `replacement` names
    /// another stored version (which becomes active first) or when it is
    /// the last stored version of the plugin.
    pub fn remove(&self, name: &str, version: &Version, replacement: Option<&Version>) -> Result<()> {
        self.with_lock(name, |plugin| plugin.remove(version, replacement))
    }

    fn put_locked(
        &self,
        name: &str,
        version: &Version,
        manifest: &Manifest,
        bundle: &Bundle,
        origin: &str,
    ) -> Result<StoredVersion> {
        if manifest.name != name || manifest.version != *version {
            return Err(PlugError::Manifest {
                path: self.version_dir(name, version),
                message: format!("manifest declares {}, expected {}@{}", manifest.id(), name, version),
            });
        }
        check_name(name)?;

        if let Some(existing) = self.load(name, version)? {
            debug!(plugin = name, %version, "version already stored");
            return Ok(existing);
        }

        let plugin_dir = self.plugin_dir(name);
        fs::create_dir_all(&plugin_dir)?;

        let staging = plugin_dir.join(format!("{}{}", STAGING_PREFIX, uuid::Uuid::new_v4()));
        let receipt = InstallReceipt {
            installed_at: Utc::now(),
            origin: origin.to_string(),
            checksum: bundle.checksum()?,
        };

        let staged = bundle.materialize(&staging).and_then(|()| {
            let content = toml::to_string_pretty(&receipt)?;
            fs::write(staging.join(RECEIPT_FILE), content)?;
            Ok(())
        });

        let target = self.version_dir(name, version);
        let result = staged.and_then(|()| fs::rename(&staging, &target).map_err(PlugError::from));
        if let Err(e) = result {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        info!(plugin = name, %version, path = %target.display(), "stored plugin version");

        Ok(StoredVersion {
            name: name.to_string(),
            version: *version,
            storage_path: target,
            manifest: manifest.clone(),
            installed_at: receipt.installed_at,
            origin: receipt.origin,
            checksum: receipt.checksum,
        })
    }

    fn set_active_locked(&self, name: &str, version: &Version) -> Result<()> {
        if !self.contains(name, version) {
            return Err(PlugError::not_found(name, Some(version.to_string())));
        }

        let plugin_dir = self.plugin_dir(name);
        let tmp = plugin_dir.join(format!(".{}.{}.tmp", ACTIVE_FILE, uuid::Uuid::new_v4()));
        fs::write(&tmp, format!("{}\n", version))?;
        if let Err(e) = fs::rename(&tmp, plugin_dir.join(ACTIVE_FILE)) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }

        info!(plugin = name, %version, "activated plugin version");
        Ok(())
    }

    fn remove_locked(&self, name: &str, version: &Version, replacement: Option<&Version>) -> Result<()> {
        if !self.contains(name, version) {
            return Err(PlugError::not_found(name, Some(version.to_string())));
        }

        let active = self.read_marker(name)?;
        match replacement {
            Some(next) if next == version => {
                return Err(PlugError::ActiveVersion {
                    name: name.to_string(),
                    version: version.to_string(),
                });
            }
            Some(next) => self.set_active_locked(name, next)?,
            None if active.as_ref() == Some(version) => {
                let others = self
                    .list_versions(name)?
                    .into_iter()
                    .filter(|v| v != version)
                    .count();
                if others > 0 {
                    return Err(PlugError::ActiveVersion {
                        name: name.to_string(),
                        version: version.to_string(),
                    });
                }
                fs::remove_file(self.plugin_dir(name).join(ACTIVE_FILE))?;
            }
            None => {}
        }

        let plugin_dir = self.plugin_dir(name);
        let trash = plugin_dir.join(format!("{}{}", TRASH_PREFIX, uuid::Uuid::new_v4()));
        fs::rename(self.version_dir(name, version), &trash)?;
        fs::remove_dir_all(&trash)?;

        if self.list_versions(name)?.is_empty() {
            let _ = fs::remove_dir_all(&plugin_dir);
        }

        info!(plugin = name, %version, "removed plugin version");
        Ok(())
    }

    // ========== Reads ==========

    pub fn contains(&self, name: &str, version: &Version) -> bool {
        self.version_dir(name, version).join(RECEIPT_FILE).is_file()
    }

    pub fn get(&self, name: &str, version: &Version) -> Result<StoredVersion> {
        self.load(name, version)?
            .ok_or_else(|| PlugError::not_found(name, Some(version.to_string())))
    }

    fn load(&self, name: &str, version: &Version) -> Result<Option<StoredVersion>> {
        if !self.contains(name, version) {
            return Ok(None);
        }

        let dir = self.version_dir(name, version);
        let receipt: InstallReceipt = toml::from_str(&fs::read_to_string(dir.join(RECEIPT_FILE))?)?;
        let manifest = Manifest::load(&dir)?;

        Ok(Some(StoredVersion {
            name: name.to_string(),
            version: *version,
            storage_path: dir,
            manifest,
            installed_at: receipt.installed_at,
            origin: receipt.origin,
            checksum: receipt.checksum,
        }))
    }

    fn read_marker(&self, name: &str) -> Result<Option<Version>> {
        let path = self.plugin_dir(name).join(ACTIVE_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)?;
        Ok(Some(Version::parse(content.trim())?))
    }

    /// Version the active pointer references, if any
    pub fn active_version(&self, name: &str) -> Result<Option<Version>> {
        Ok(self
            .read_marker(name)?
            .filter(|version| self.contains(name, version)))
    }

    pub fn get_active(&self, name: &str) -> Result<StoredVersion> {
        match self.active_version(name)? {
            Some(version) => self.get(name, &version),
            None => Err(PlugError::not_found(name, None)),
        }
    }

    /// Stored versions of a plugin, ascending
    pub fn list_versions(&self, name: &str) -> Result<Vec<Version>> {
        let dir = self.plugin_dir(name);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut versions = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let Ok(version) = Version::parse(&entry.file_name().to_string_lossy()) else {
                continue;
            };
            if self.contains(name, &version) {
                versions.push(version);
            }
        }
        versions.sort();
        Ok(versions)
    }

    /// Names of plugins with at least one stored version, sorted
    pub fn list_plugins(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || !is_valid_name(&name) {
                continue;
            }
            if !self.list_versions(&name)?.is_empty() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Active record of every plugin that has one, sorted by name
    pub fn active_versions(&self) -> Result<Vec<StoredVersion>> {
        let mut active = Vec::new();
        for name in self.list_plugins()? {
            if let Some(version) = self.active_version(&name)? {
                active.push(self.get(&name, &version)?);
            }
        }
        Ok(active)
    }
}

/// One plugin's store operations, valid while its name lock is held
pub struct LockedPlugin<'s> {
    store: &'s VersionStore,
    name: &'s str,
}

impl LockedPlugin<'_> {
    pub fn name(&self) -> &str {
        self.name
    }

    pub fn contains(&self, version: &Version) -> bool {
        self.store.contains(self.name, version)
    }

    pub fn get(&self, version: &Version) -> Result<StoredVersion> {
        self.store.get(self.name, version)
    }

    pub fn active_version(&self) -> Result<Option<Version>> {
        self.store.active_version(self.name)
    }

    pub fn list_versions(&self) -> Result<Vec<Version>> {
        self.store.list_versions(self.name)
    }

    pub fn put(
        &self,
        version: &Version,
        manifest: &Manifest,
        bundle: &Bundle,
        origin: &str,
    ) -> Result<StoredVersion> {
        self.store.put_locked(self.name, version, manifest, bundle, origin)
    }

    pub fn set_active(&self, version: &Version) -> Result<()> {
        self.store.set_active_locked(self.name, version)
    }

    pub fn remove(&self, version: &Version, replacement: Option<&Version>) -> Result<()> {
        self.store.remove_locked(self.name, version, replacement)
    }
}

fn check_name(name: &str) -> Result<()> {
    if is_valid_name(name) {
        Ok(())
    } else {
        Err(PlugError::InvalidReference {
            reference: name.to_string(),
            reason: "invalid plugin name".to_string(),
        })
    }
}
