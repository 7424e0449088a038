//! Plugin Registry
//!
//! Manages `registry.toml`, the default origin for dependency references
//! that name a plugin without an explicit source.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PlugError, Result};
use crate::source::{is_valid_name, Location};
use crate::version::Constraint;

pub const REGISTRY_FILE: &str = "registry.toml";

/// One `[plugins.<name>]` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    /// Archive URL, `file://` path, or path relative to the registry file
    pub url: String,
    /// Constraint every version served from this entry must satisfy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// registry.toml structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryFile {
    #[serde(default)]
    pub plugins: BTreeMap<String, RegistryEntry>,
}

/// Resolved registry lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryTarget {
    pub location: Location,
    pub constraint: Constraint,
}

/// Plugin Registry - reads and edits the registry reference file
pub struct PluginRegistry {
    path: PathBuf,
    file: RegistryFile,
}

impl PluginRegistry {
    /// Load the registry file; a missing file is an empty registry
    pub fn load(path: &Path) -> Result<Self> {
        let file = if path.exists() {
            let content = fs::read_to_string(path)?;
            toml::from_str(&content).map_err(|e| PlugError::ConfigParse {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?
        } else {
            RegistryFile::default()
        };

        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Build an in-memory registry (for testing)
    pub fn from_file(path: &Path, file: RegistryFile) -> Self {
        Self {
            path: path.to_path_buf(),
            file,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Save registry.toml
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(&self.file)?;
        fs::write(&self.path, content)?;
        Ok(())
    }

    /// Add an entry; refuses to overwrite an existing one
    pub fn add(&mut self, name: &str, entry: RegistryEntry) -> Result<()> {
        if !is_valid_name(name) {
            return Err(PlugError::InvalidReference {
                reference: name.to_string(),
                reason: "invalid plugin name".to_string(),
            });
        }
        if let Some(version) = &entry.version {
            Constraint::parse(version)?;
        }
        if self.file.plugins.contains_key(name) {
            return Err(PlugError::RegistryEntryExists {
                name: name.to_string(),
            });
        }

        self.file.plugins.insert(name.to_string(), entry);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Result<RegistryEntry> {
        self.file
            .plugins
            .remove(name)
            .ok_or_else(|| PlugError::not_found(name, None))
    }

    pub fn get(&self, name: &str) -> Option<&RegistryEntry> {
        self.file.plugins.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = (&String, &RegistryEntry)> {
        self.file.plugins.iter()
    }

    /// Resolve a name to a fetch location and the entry's constraint
    pub fn lookup(&self, name: &str) -> Result<Option<RegistryTarget>> {
        let Some(entry) = self.file.plugins.get(name) else {
            return Ok(None);
        };

        let base_dir = self.path.parent().unwrap_or(Path::new("."));
        let location = Location::parse(&entry.url, base_dir)?;
        let constraint = match &entry.version {
            Some(raw) => Constraint::parse(raw)?,
            None => Constraint::ANY,
        };

        Ok(Some(RegistryTarget {
            location,
            constraint,
        }))
    }
}
