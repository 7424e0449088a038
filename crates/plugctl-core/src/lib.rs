pub mod commands;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod hooks;
pub mod manifest;
pub mod orchestrator;
pub mod registry;
pub mod resolver;
pub mod source;
pub mod store;
pub mod version;

pub use commands::{collect, dispatch, ArgSpec, CommandBinding, CommandDescriptor, CommandTable};
pub use config::Config;
pub use error::{OrchestratorKind, PlugError, ResolutionKind, Result};
pub use fetcher::{fetch_with_retry, Bundle, Fetch, FetchedPlugin, PluginFetcher, RetryPolicy};
pub use hooks::{HookContext, HookKind, HookOutput, HookRunner, ProcessHookRunner};
pub use manifest::{HookTable, Manifest, PluginType, MANIFEST_FILE};
pub use orchestrator::{
    CheckReport, ExecuteOptions, InstallFailure, InstallReport, Orchestrator, PluginStatus,
    StepOutcome, StepReport,
};
pub use registry::{PluginRegistry, RegistryEntry, RegistryFile, RegistryTarget, REGISTRY_FILE};
pub use resolver::{InstallPlan, PlanStep, Resolver};
pub use source::{locate, DependencySpec, FetchDescriptor, Location, Origin};
pub use store::{InstallReceipt, LockedPlugin, StoredVersion, VersionStore};
pub use version::{compare, satisfies, Constraint, Operator, Version};
