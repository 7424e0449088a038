//! Lifecycle Orchestrator
//!
//! Drives install plans through the version store and lifecycle hooks, and
//! implements the single-plugin operations (uninstall, switch, list, check).

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::path::PathBuf;

use tracing::{info, warn};

use crate::commands::CommandTable;
use crate::error::{PlugError, Result};
use crate::fetcher::{fetch_with_retry, Fetch, FetchedPlugin, RetryPolicy};
use crate::hooks::{self, HookRunner};
use crate::resolver::{InstallPlan, PlanStep, Resolver};
use crate::source::{DependencySpec, FetchDescriptor};
use crate::store::{LockedPlugin, StoredVersion, VersionStore};
use crate::version::Version;

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecuteOptions {
    /// Re-run the install hook for versions that are already stored
    pub force: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Newly stored and installed
    Installed,
    /// Already stored; install hook re-run
    Reinstalled,
    /// Already stored; only (re)activated
    Activated,
}

#[derive(Debug, Clone)]
pub struct StepReport {
    pub name: String,
    pub version: Version,
    pub outcome: StepOutcome,
    pub storage_path: PathBuf,
}

#[derive(Debug, Default)]
pub struct InstallReport {
    pub steps: Vec<StepReport>,
    /// Commands contributed by the plugins in this plan
    pub commands: CommandTable,
}

/// A plan that stopped part way: `report` holds the steps that completed
/// and the commands they contributed, `error` the failure that stopped it
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct InstallFailure {
    pub report: InstallReport,
    pub error: PlugError,
}

impl From<PlugError> for InstallFailure {
    fn from(error: PlugError) -> Self {
        Self {
            report: InstallReport::default(),
            error,
        }
    }
}

impl From<InstallFailure> for PlugError {
    fn from(failure: InstallFailure) -> Self {
        failure.error
    }
}

/// Stored versions of one plugin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginStatus {
    pub name: String,
    pub versions: Vec<Version>,
    pub active: Option<Version>,
}

#[derive(Debug, Clone)]
pub struct CheckReport {
    pub plugin: String,
    pub version: Version,
    /// `None` when the plugin declares no check hook
    pub components: Option<BTreeMap<String, bool>>,
}

/// Lifecycle Orchestrator
pub struct Orchestrator<'a> {
    store: &'a VersionStore,
    fetcher: &'a dyn Fetch,
    hooks: &'a dyn HookRunner,
    retry: RetryPolicy,
}

impl<'a> Orchestrator<'a> {
    pub fn new(store: &'a VersionStore, fetcher: &'a dyn Fetch, hooks: &'a dyn HookRunner) -> Self {
        Self {
            store,
            fetcher,
            hooks,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &VersionStore {
        self.store
    }

    /// Resolve `request` and execute the resulting plan
    pub fn install(
        &self,
        resolver: &Resolver<'_>,
        request: &DependencySpec,
        options: ExecuteOptions,
    ) -> std::result::Result<InstallReport, InstallFailure> {
        let plan = resolver.resolve(request)?;
        self.execute(&plan, options)
    }

    /// Execute a plan in order. A failing step aborts the rest of the plan;
    /// steps that already completed stay installed and active and are
    /// returned with the failure.
    pub fn execute(
        &self,
        plan: &InstallPlan,
        options: ExecuteOptions,
    ) -> std::result::Result<InstallReport, InstallFailure> {
        let mut report = InstallReport::default();

        for step in &plan.steps {
            if let Err(error) = self.execute_step(step, options, &mut report) {
                warn!(
                    plugin = %step.name,
                    version = %step.version,
                    completed = report.steps.len(),
                    "install plan aborted: {}",
                    error
                );
                return Err(InstallFailure { report, error });
            }
        }

        Ok(report)
    }

    fn execute_step(&self, step: &PlanStep, options: ExecuteOptions, report: &mut InstallReport) -> Result<()> {
        let (outcome, stored) = self.store.with_lock(&step.name, |plugin| {
            let outcome = self.install_step(plugin, step, options)?;
            plugin.set_active(&step.version)?;
            Ok((outcome, plugin.get(&step.version)?))
        })?;

        let descriptors = hooks::register_commands(self.hooks, &stored)?;
        report.commands.register(&stored, descriptors)?;

        info!(plugin = %step.name, version = %step.version, ?outcome, "plan step complete");
        report.steps.push(StepReport {
            name: step.name.clone(),
            version: step.version,
            outcome,
            storage_path: stored.storage_path,
        });
        Ok(())
    }

    /// Store and install one step; the caller holds the plugin's lock
    fn install_step(&self, plugin: &LockedPlugin<'_>, step: &PlanStep, options: ExecuteOptions) -> Result<StepOutcome> {
        let existed = plugin.contains(&step.version);
        if existed && !options.force {
            info!(plugin = %step.name, version = %step.version, "already installed");
            return Ok(StepOutcome::Activated);
        }

        let stored = if existed {
            plugin.get(&step.version)?
        } else {
            let fetched = self.fetched(step)?;
            plugin.put(
                &step.version,
                &fetched.manifest,
                &fetched.bundle,
                &step.location.to_string(),
            )?
        };

        if let Err(e) = hooks::install(self.hooks, &stored) {
            // Only a version this step created is rolled back
            if !existed {
                if let Err(cleanup) = plugin.remove(&step.version, None) {
                    warn!(plugin = %step.name, version = %step.version, "rollback failed: {}", cleanup);
                }
            }
            return Err(e);
        }

        Ok(if existed {
            StepOutcome::Reinstalled
        } else {
            StepOutcome::Installed
        })
    }

    fn fetched<'s>(&self, step: &'s PlanStep) -> Result<Cow<'s, FetchedPlugin>> {
        match &step.fetched {
            Some(fetched) => Ok(Cow::Borrowed(fetched)),
            None => {
                let descriptor = FetchDescriptor::new(&step.name, step.location.clone());
                fetch_with_retry(self.fetcher, &descriptor, self.retry).map(Cow::Owned)
            }
        }
    }

    /// Remove one version. The uninstall hook is best-effort; removing the
    /// active version activates the highest remaining one.
    pub fn uninstall(&self, name: &str, version: &Version) -> Result<()> {
        let stored = self.store.get(name, version)?;

        if let Err(e) = hooks::uninstall(self.hooks, &stored) {
            warn!(plugin = name, %version, "uninstall hook failed, removing anyway: {}", e);
        }

        self.store.with_lock(name, |plugin| {
            let replacement = if plugin.active_version()?.as_ref() == Some(version) {
                plugin
                    .list_versions()?
                    .into_iter()
                    .filter(|v| v != version)
                    .max()
            } else {
                None
            };

            plugin.remove(version, replacement.as_ref())?;
            if let Some(next) = replacement {
                info!(plugin = name, version = %next, "activated remaining version");
            }
            Ok(())
        })
    }

    /// Point `name` at an already stored version; no hooks run
    pub fn switch(&self, name: &str, version: &Version) -> Result<StoredVersion> {
        let stored = self.store.get(name, version)?;
        self.store.set_active(name, version)?;
        Ok(stored)
    }

    pub fn list(&self) -> Result<Vec<PluginStatus>> {
        self.store
            .list_plugins()?
            .into_iter()
            .map(|name| {
                Ok(PluginStatus {
                    versions: self.store.list_versions(&name)?,
                    active: self.store.active_version(&name)?,
                    name,
                })
            })
            .collect()
    }

    /// Run the active version's check hook
    pub fn check(&self, name: &str) -> Result<CheckReport> {
        let stored = self.store.get_active(name)?;
        let components = hooks::check(self.hooks, &stored)?;
        Ok(CheckReport {
            plugin: stored.name,
            version: stored.version,
            components,
        })
    }
}
