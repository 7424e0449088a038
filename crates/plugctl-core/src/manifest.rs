//! Plugin manifest parsing for `plugin.json`
//!
//! Every plugin bundle carries a `plugin.json` at its root declaring its
//! identity, dependencies and lifecycle hooks.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PlugError, Result};
use crate::source::{is_valid_name, DependencySpec};
use crate::version::Version;

pub const MANIFEST_FILE: &str = "plugin.json";

/// What a plugin offers to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PluginType {
    Library,
    Cli,
    LibraryCli,
}

impl PluginType {
    /// Whether the plugin contributes commands to the host CLI
    pub fn has_cli(&self) -> bool {
        matches!(self, Self::Cli | Self::LibraryCli)
    }
}

impl fmt::Display for PluginType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Library => write!(f, "library"),
            Self::Cli => write!(f, "cli"),
            Self::LibraryCli => write!(f, "library-cli"),
        }
    }
}

/// Lifecycle entry points, each an argv run inside the version directory
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookTable {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub register_commands: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uninstall: Option<Vec<String>>,
    /// Handler for the plugin's CLI commands
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<Vec<String>>,
}

/// Parsed `plugin.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub version: Version,
    #[serde(rename = "type")]
    pub plugin_type: PluginType,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub provides: BTreeSet<String>,
    #[serde(default)]
    pub depends_on: Vec<DependencySpec>,
    #[serde(default)]
    pub cli_command: Option<String>,
    #[serde(default)]
    pub cli_usage: Option<String>,
    #[serde(default)]
    pub hooks: HookTable,
}

impl Manifest {
    /// Load `plugin.json` from a bundle directory
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILE);
        let content = fs::read(&path)?;
        Self::from_slice(&content, &path)
    }

    /// Parse manifest bytes; `origin` is only used in error messages
    pub fn from_slice(content: &[u8], origin: &Path) -> Result<Self> {
        let manifest: Manifest =
            serde_json::from_slice(content).map_err(|e| PlugError::Manifest {
                path: origin.to_path_buf(),
                message: e.to_string(),
            })?;
        manifest.validate(origin)?;
        Ok(manifest)
    }

    pub fn parse_str(content: &str) -> Result<Self> {
        Self::from_slice(content.as_bytes(), &PathBuf::from("<string>"))
    }

    fn validate(&self, origin: &Path) -> Result<()> {
        if !is_valid_name(&self.name) {
            return Err(PlugError::Manifest {
                path: origin.to_path_buf(),
                message: format!("invalid plugin name '{}'", self.name),
            });
        }

        Ok(())
    }

    /// `name@version` label used in logs and reports
    pub fn id(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}
