//! Source Locator
//!
//! Parses dependency references (`name`, `name>=1.0.0`, `name@https://..`,
//! `name@file://..`, `name@./..`) and turns them into fetch descriptors.

use std::fmt;
use std::path::{Path, PathBuf};

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::{PlugError, Result};
use crate::version::{Constraint, Operator, Version};

/// Where a dependency is declared to come from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Looked up by name in the registry reference file
    Registry,
    /// `http://` or `https://` URL
    Url(String),
    /// `file://` path
    File(PathBuf),
    /// `./` or `../` path, relative to the referencing plugin's source
    Relative(String),
}

impl Origin {
    pub fn is_explicit(&self) -> bool {
        !matches!(self, Origin::Registry)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registry => write!(f, "registry"),
            Self::Url(url) => write!(f, "{}", url),
            Self::File(path) => write!(f, "file://{}", path.display()),
            Self::Relative(rel) => write!(f, "{}", rel),
        }
    }
}

/// One parsed dependency reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DependencySpec {
    pub target_name: String,
    pub constraint: Constraint,
    pub origin: Origin,
}

impl DependencySpec {
    /// Unconstrained registry reference
    pub fn named(name: &str) -> Self {
        Self {
            target_name: name.to_string(),
            constraint: Constraint::ANY,
            origin: Origin::Registry,
        }
    }

    pub fn operator(&self) -> Operator {
        self.constraint.operator
    }

    pub fn required_version(&self) -> Option<&Version> {
        self.constraint.bound.as_ref()
    }

    /// An explicit origin combined with a version operator
    pub fn is_pinned_with_constraint(&self) -> bool {
        self.origin.is_explicit() && !self.constraint.is_any()
    }
}

impl fmt::Display for DependencySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.target_name)?;
        if !self.constraint.is_any() {
            write!(f, "{}", self.constraint)?;
        }
        if self.origin.is_explicit() {
            write!(f, "@{}", self.origin)?;
        }
        Ok(())
    }
}

impl TryFrom<String> for DependencySpec {
    type Error = PlugError;

    fn try_from(raw: String) -> Result<Self> {
        locate(&raw)
    }
}

impl From<DependencySpec> for String {
    fn from(spec: DependencySpec) -> Self {
        spec.to_string()
    }
}

/// Parse a dependency reference string
pub fn locate(raw: &str) -> Result<DependencySpec> {
    let trimmed = raw.trim();

    let (head, origin) = match trimmed.split_once('@') {
        Some((head, location)) => (head, parse_origin(raw, location.trim())?),
        None => (trimmed, Origin::Registry),
    };

    let (name, constraint) = match head.find(['<', '>', '=']) {
        Some(pos) => {
            let constraint = Constraint::parse(&head[pos..]).map_err(|e| invalid(raw, &e.to_string()))?;
            (head[..pos].trim(), constraint)
        }
        None => (head.trim(), Constraint::ANY),
    };

    validate_name(raw, name)?;

    Ok(DependencySpec {
        target_name: name.to_string(),
        constraint,
        origin,
    })
}

fn parse_origin(raw: &str, location: &str) -> Result<Origin> {
    if location.is_empty() {
        return Err(invalid(raw, "empty source after '@'"));
    }

    if location.starts_with("http://") || location.starts_with("https://") {
        Url::parse(location).map_err(|e| invalid(raw, &e.to_string()))?;
        Ok(Origin::Url(location.to_string()))
    } else if let Some(path) = location.strip_prefix("file://") {
        if path.is_empty() {
            return Err(invalid(raw, "empty file:// path"));
        }
        Ok(Origin::File(PathBuf::from(path)))
    } else if location.starts_with("./") || location.starts_with("../") {
        Ok(Origin::Relative(location.to_string()))
    } else {
        Err(invalid(raw, "unrecognized source scheme"))
    }
}

fn validate_name(raw: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(invalid(raw, "empty plugin name"));
    }
    if !is_valid_name(name) {
        return Err(invalid(
            raw,
            "plugin names may only contain alphanumerics, '.', '-' and '_'",
        ));
    }
    Ok(())
}

/// Plugin names double as directory names in the version store
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

fn invalid(raw: &str, reason: &str) -> PlugError {
    PlugError::InvalidReference {
        reference: raw.to_string(),
        reason: reason.to_string(),
    }
}

// ========== Fetch Descriptors ==========

/// A concrete place the fetcher can read a plugin from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Location {
    Http(Url),
    Path(PathBuf),
}

impl Location {
    /// Interpret a location string from the registry file.
    /// Plain paths are relative to `base_dir`.
    pub fn parse(raw: &str, base_dir: &Path) -> Result<Self> {
        if raw.starts_with("http://") || raw.starts_with("https://") {
            let url = Url::parse(raw).map_err(|e| invalid(raw, &e.to_string()))?;
            return Ok(Location::Http(url));
        }

        let path = raw.strip_prefix("file://").unwrap_or(raw);
        Ok(Location::Path(normalize(&base_dir.join(path))))
    }

    /// Resolve a `./` or `../` reference against this location's directory
    pub fn join_relative(&self, relative: &str) -> Result<Self> {
        match self {
            Location::Http(url) => url
                .join(relative)
                .map(Location::Http)
                .map_err(|e| invalid(relative, &e.to_string())),
            Location::Path(path) => {
                let dir = if path.is_dir() {
                    path.as_path()
                } else {
                    path.parent().unwrap_or(Path::new("."))
                };
                Ok(Location::Path(normalize(&dir.join(relative))))
            }
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(url) => write!(f, "{}", url),
            Self::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Prefer the canonical path so the same directory reached through two
/// spellings compares equal.
fn normalize(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// What the fetcher needs to retrieve one plugin
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FetchDescriptor {
    pub name: String,
    pub location: Location,
}

impl FetchDescriptor {
    pub fn new(name: &str, location: Location) -> Self {
        Self {
            name: name.to_string(),
            location,
        }
    }

    /// Build the descriptor for an explicit origin.
    ///
    /// `referrer` is the location of the plugin declaring the dependency;
    /// root requests resolve relative paths against `cwd`.
    pub fn for_explicit(
        spec: &DependencySpec,
        referrer: Option<&Location>,
        cwd: &Path,
    ) -> Result<Option<Self>> {
        let location = match &spec.origin {
            Origin::Registry => return Ok(None),
            Origin::Url(url) => Location::Http(
                Url::parse(url).map_err(|e| invalid(&spec.to_string(), &e.to_string()))?,
            ),
            Origin::File(path) => Location::Path(normalize(&cwd.join(path))),
            Origin::Relative(rel) => match referrer {
                Some(base) => base.join_relative(rel)?,
                None => Location::Path(normalize(&cwd.join(rel))),
            },
        };

        Ok(Some(Self::new(&spec.target_name, location)))
    }
}
