use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Why a dependency graph could not be turned into an install plan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionKind {
    /// The same plugin name is reachable through two different origins
    ConflictingOrigin,
    /// A requester's constraint rejects the version already chosen for a name
    ConstraintViolation,
    /// The dependency graph loops back on itself
    CyclicDependency,
    /// No explicit origin and no registry entry for the name
    UnknownPlugin,
    /// The fetched manifest declares a different name than was requested
    NameMismatch,
    /// An explicit origin was combined with a version operator
    PinnedConstraint,
}

impl fmt::Display for ResolutionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConflictingOrigin => write!(f, "conflicting origin"),
            Self::ConstraintViolation => write!(f, "constraint violation"),
            Self::CyclicDependency => write!(f, "cyclic dependency"),
            Self::UnknownPlugin => write!(f, "unknown plugin"),
            Self::NameMismatch => write!(f, "name mismatch"),
            Self::PinnedConstraint => write!(f, "pinned source with version constraint"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorKind {
    CommandCollision,
}

impl fmt::Display for OrchestratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CommandCollision => write!(f, "command collision"),
        }
    }
}

#[derive(Debug, Error)]
pub enum PlugError {
    #[error("Invalid version '{input}': {reason}")]
    Parse { input: String, reason: String },

    #[error("Invalid manifest {path}: {message}")]
    Manifest { path: PathBuf, message: String },

    #[error("Invalid dependency reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("Fetch failed for {location}{}: {message}", transient_suffix(.transient))]
    Fetch {
        location: String,
        message: String,
        transient: bool,
    },

    #[error("Resolution failed ({kind}) for {plugin}: {message}")]
    Resolution {
        kind: ResolutionKind,
        plugin: String,
        message: String,
    },

    #[error("Hook '{hook}' failed for {plugin} {version}: {message}")]
    HookFailure {
        plugin: String,
        version: String,
        hook: String,
        message: String,
    },

    #[error("Orchestration failed ({kind}) at {plugin} {version}: {message}")]
    Orchestrator {
        kind: OrchestratorKind,
        plugin: String,
        version: String,
        message: String,
    },

    #[error("Plugin not found: {name}{}", version_suffix(.version))]
    NotFound {
        name: String,
        version: Option<String>,
    },

    #[error("Refusing to remove active version {version} of {name} without a replacement")]
    ActiveVersion { name: String, version: String },

    #[error("Registry entry already exists: {name}")]
    RegistryEntryExists { name: String },

    #[error("Config key not found: {key}")]
    ConfigKeyNotFound { key: String },

    #[error("Config parse error in {path}: {message}")]
    ConfigParse { path: PathBuf, message: String },

    #[error("Command not found: {name}")]
    CommandNotFound { name: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
}

fn transient_suffix(transient: &bool) -> &'static str {
    if *transient {
        " (transient)"
    } else {
        ""
    }
}

fn version_suffix(version: &Option<String>) -> String {
    version.as_ref().map(|v| format!(" {}", v)).unwrap_or_default()
}

pub type Result<T> = std::result::Result<T, PlugError>;

impl PlugError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Parse { .. } | Self::Manifest { .. } | Self::InvalidReference { .. } => 2,
            Self::Fetch { .. } => 3,
            Self::Resolution { .. } => 4,
            Self::HookFailure { .. } => 5,
            Self::Orchestrator { .. } => 6,
            Self::NotFound { .. } | Self::CommandNotFound { .. } => 7,
            Self::ActiveVersion { .. } => 8,
            _ => 1,
        }
    }

    /// Whether retrying the failed operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Fetch { transient: true, .. })
    }

    pub(crate) fn resolution(
        kind: ResolutionKind,
        plugin: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Resolution {
            kind,
            plugin: plugin.into(),
            message: message.into(),
        }
    }

    pub(crate) fn not_found(name: &str, version: Option<String>) -> Self {
        Self::NotFound {
            name: name.to_string(),
            version,
        }
    }
}
