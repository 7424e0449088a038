use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PlugError, Result};
use crate::fetcher::RetryPolicy;
use crate::registry::REGISTRY_FILE;

const CONFIG_FILE: &str = "config.toml";
const STORE_DIR: &str = "plugins";

/// Default config template with rich comments
const DEFAULT_CONFIG_TEMPLATE: &str = r#"# plugctl configuration file
# Location: ~/.plugctl/config.toml

[fetch]
# Seconds before an HTTP download is abandoned
# Default: 30
timeout_secs = 30

# Attempts for transient fetch failures (unreachable host, non-2xx, timeout)
# Default: 3
retries = 3

[hooks]
# Seconds a lifecycle hook may run before it is killed
# Default: 300
timeout_secs = 300

[store]
# Where plugin versions are stored
# Default: <base>/plugins
# root = "/opt/plugctl/plugins"

[registry]
# Registry reference file for plugins named without a source
# Default: <base>/registry.toml
# path = "/etc/plugctl/registry.toml"
"#;

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub hooks: HooksConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
}

fn default_fetch_timeout() -> u64 {
    30
}

fn default_retries() -> u32 {
    3
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_fetch_timeout(),
            retries: default_retries(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HooksConfig {
    #[serde(default = "default_hook_timeout")]
    pub timeout_secs: u64,
}

fn default_hook_timeout() -> u64 {
    300
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_hook_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoreConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RegistryConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl Config {
    /// Load config from base directory
    pub fn load(base_dir: &Path) -> Result<Self> {
        let path = base_dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)?;
        let config: Config = toml::from_str(&content).map_err(|e| PlugError::ConfigParse {
            path: path.clone(),
            message: e.to_string(),
        })?;

        Ok(config)
    }

    /// Save config to base directory
    pub fn save(&self, base_dir: &Path) -> Result<()> {
        let path = base_dir.join(CONFIG_FILE);
        fs::create_dir_all(base_dir)?;

        let content = toml::to_string_pretty(self).map_err(|e| PlugError::ConfigParse {
            path: path.clone(),
            message: e.to_string(),
        })?;

        fs::write(&path, content)?;
        Ok(())
    }

    /// Get config file path
    pub fn path(base_dir: &Path) -> PathBuf {
        base_dir.join(CONFIG_FILE)
    }

    /// Initialize config with default template (rich comments)
    pub fn init(base_dir: &Path) -> Result<PathBuf> {
        let path = base_dir.join(CONFIG_FILE);
        fs::create_dir_all(base_dir)?;

        if !path.exists() {
            fs::write(&path, DEFAULT_CONFIG_TEMPLATE)?;
        }

        Ok(path)
    }

    /// Get a config value by dot-notation key
    pub fn get(&self, key: &str) -> Option<String> {
        self.list()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, value)| value)
    }

    /// Set a config value by dot-notation key
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let value = value.trim();
        match key {
            "fetch.timeout_secs" => self.fetch.timeout_secs = parse_number(key, value)?,
            "fetch.retries" => self.fetch.retries = parse_number(key, value)?,
            "hooks.timeout_secs" => self.hooks.timeout_secs = parse_number(key, value)?,
            "store.root" => self.store.root = parse_optional_path(value),
            "registry.path" => self.registry.path = parse_optional_path(value),
            _ => {
                return Err(PlugError::ConfigKeyNotFound {
                    key: key.to_string(),
                })
            }
        }
        Ok(())
    }

    /// List all config keys with their current values
    pub fn list(&self) -> Vec<(String, String)> {
        let optional = |path: &Option<PathBuf>| {
            path.as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(default)".to_string())
        };

        vec![
            ("fetch.timeout_secs".to_string(), self.fetch.timeout_secs.to_string()),
            ("fetch.retries".to_string(), self.fetch.retries.to_string()),
            ("hooks.timeout_secs".to_string(), self.hooks.timeout_secs.to_string()),
            ("store.root".to_string(), optional(&self.store.root)),
            ("registry.path".to_string(), optional(&self.registry.path)),
        ]
    }

    /// Version store root, relative paths resolved against `base_dir`
    pub fn store_root(&self, base_dir: &Path) -> PathBuf {
        match &self.store.root {
            Some(root) => base_dir.join(root),
            None => base_dir.join(STORE_DIR),
        }
    }

    /// Registry reference file, relative paths resolved against `base_dir`
    pub fn registry_path(&self, base_dir: &Path) -> PathBuf {
        match &self.registry.path {
            Some(path) => base_dir.join(path),
            None => base_dir.join(REGISTRY_FILE),
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch.timeout_secs)
    }

    pub fn hook_timeout(&self) -> Duration {
        Duration::from_secs(self.hooks.timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.fetch.retries.max(1),
            ..RetryPolicy::default()
        }
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| PlugError::ConfigParse {
        path: PathBuf::from(CONFIG_FILE),
        message: format!("{} expects a non-negative integer, got '{}'", key, value),
    })
}

/// Empty or `default` clears the override
fn parse_optional_path(value: &str) -> Option<PathBuf> {
    match value {
        "" | "default" => None,
        path => Some(PathBuf::from(path)),
    }
}
