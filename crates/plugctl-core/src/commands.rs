//! Command Registry Bridge
//!
//! Collects the command descriptors contributed by active plugins into one
//! dispatch table for the host CLI. The host never hands its own parser to
//! a plugin; plugins only describe their commands.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{OrchestratorKind, PlugError, Result};
use crate::hooks::{self, plugin_command, HookContext, HookRunner};
use crate::manifest::Manifest;
use crate::source::is_valid_name;
use crate::store::StoredVersion;
use crate::version::Version;

/// One positional argument of a plugin command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgSpec {
    pub name: String,
    #[serde(default)]
    pub help: String,
    #[serde(default)]
    pub required: bool,
}

/// Neutral description of a command a plugin adds to the host CLI
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandDescriptor {
    pub name: String,
    #[serde(default)]
    pub help: String,
    #[serde(default)]
    pub args: Vec<ArgSpec>,
    /// argv to execute; defaults to the plugin's `run` hook
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<Vec<String>>,
}

impl CommandDescriptor {
    /// Descriptor derived from `cli_command`/`cli_usage` for CLI plugins
    /// that do not declare `register_commands`
    pub fn implicit(manifest: &Manifest) -> Option<Self> {
        if !manifest.plugin_type.has_cli() {
            return None;
        }
        let name = manifest.cli_command.as_ref()?;
        let help = manifest
            .cli_usage
            .clone()
            .or_else(|| manifest.description.clone())
            .unwrap_or_default();

        Some(Self {
            name: name.clone(),
            help,
            args: Vec::new(),
            handler: None,
        })
    }
}

/// A command bound to the plugin version that provides it
#[derive(Debug, Clone)]
pub struct CommandBinding {
    pub plugin: String,
    pub version: Version,
    pub descriptor: CommandDescriptor,
    /// Resolved handler argv, `None` when the plugin declares no handler
    pub handler: Option<Vec<String>>,
    pub install_dir: PathBuf,
}

/// Command name to binding
#[derive(Debug, Clone, Default)]
pub struct CommandTable {
    bindings: BTreeMap<String, CommandBinding>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a plugin version's descriptors. A name already bound to any
    /// plugin is a collision; nothing from `descriptors` is added then.
    pub fn register(&mut self, stored: &StoredVersion, descriptors: Vec<CommandDescriptor>) -> Result<()> {
        let mut pending: BTreeMap<String, CommandBinding> = BTreeMap::new();

        for descriptor in descriptors {
            if !is_valid_name(&descriptor.name) {
                warn!(plugin = %stored.name, command = %descriptor.name, "skipping command with invalid name");
                continue;
            }

            let owner = self
                .bindings
                .get(&descriptor.name)
                .or_else(|| pending.get(&descriptor.name));
            if let Some(owner) = owner {
                return Err(PlugError::Orchestrator {
                    kind: OrchestratorKind::CommandCollision,
                    plugin: stored.name.clone(),
                    version: stored.version.to_string(),
                    message: format!(
                        "command '{}' is already provided by {}@{}",
                        descriptor.name, owner.plugin, owner.version
                    ),
                });
            }

            let handler = match &descriptor.handler {
                Some(argv) => Some(argv.clone()),
                None => stored.manifest.hooks.run.as_ref().map(|run| {
                    let mut argv = run.clone();
                    argv.push(descriptor.name.clone());
                    argv
                }),
            };

            pending.insert(
                descriptor.name.clone(),
                CommandBinding {
                    plugin: stored.name.clone(),
                    version: stored.version,
                    descriptor,
                    handler,
                    install_dir: stored.storage_path.clone(),
                },
            );
        }

        self.bindings.append(&mut pending);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&CommandBinding> {
        self.bindings.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &CommandBinding)> {
        self.bindings.iter()
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

/// Build the dispatch table from the active version of every plugin
pub fn collect(runner: &dyn HookRunner, active: &[StoredVersion]) -> Result<CommandTable> {
    let mut table = CommandTable::new();
    for stored in active {
        let descriptors = hooks::register_commands(runner, stored)?;
        debug!(plugin = %stored.name, count = descriptors.len(), "collected commands");
        table.register(stored, descriptors)?;
    }
    Ok(table)
}

/// Run a bound command with inherited stdio; returns the handler's exit code
pub fn dispatch(binding: &CommandBinding, args: &[String]) -> Result<i32> {
    let ctx = HookContext {
        plugin: binding.plugin.clone(),
        version: binding.version,
        install_dir: binding.install_dir.clone(),
    };
    let no_handler = || PlugError::HookFailure {
        plugin: binding.plugin.clone(),
        version: binding.version.to_string(),
        hook: "run".to_string(),
        message: format!("no handler declared for command '{}'", binding.descriptor.name),
    };

    let mut argv = binding.handler.clone().ok_or_else(no_handler)?;
    argv.extend(args.iter().cloned());
    let mut command = plugin_command(&ctx, &argv).ok_or_else(no_handler)?;

    debug!(command = %binding.descriptor.name, plugin = %binding.plugin, ?argv, "dispatching");

    let status = command
        .env("PLUGCTL_COMMAND", &binding.descriptor.name)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .map_err(|e| PlugError::HookFailure {
            plugin: binding.plugin.clone(),
            version: binding.version.to_string(),
            hook: "run".to_string(),
            message: e.to_string(),
        })?;

    Ok(status.code().unwrap_or(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::test_support::ScriptedRunner;
    use crate::hooks::HookKind;
    use chrono::Utc;
    use std::path::Path;

    fn stored(manifest_json: &str) -> StoredVersion {
        let manifest = Manifest::parse_str(manifest_json).unwrap();
        StoredVersion {
            name: manifest.name.clone(),
            version: manifest.version,
            storage_path: Path::new("/plugins").join(&manifest.name),
            manifest,
            installed_at: Utc::now(),
            origin: "test".to_string(),
            checksum: String::new(),
        }
    }

    fn descriptor(name: &str) -> CommandDescriptor {
        CommandDescriptor {
            name: name.to_string(),
            help: String::new(),
            args: Vec::new(),
            handler: None,
        }
    }

    #[test]
    fn test_register_resolves_run_hook_handler() {
        let plugin = stored(
            r#"{"name": "scanner", "version": "1.0.0", "type": "cli",
                "hooks": {"run": ["python3", "main.py"]}}"#,
        );
        let mut table = CommandTable::new();
        table.register(&plugin, vec![descriptor("scan")]).unwrap();

        let binding = table.get("scan").unwrap();
        assert_eq!(binding.plugin, "scanner");
        assert_eq!(
            binding.handler.as_deref(),
            Some(&["python3".to_string(), "main.py".to_string(), "scan".to_string()][..])
        );
    }

    #[test]
    fn test_explicit_handler_wins() {
        let plugin = stored(
            r#"{"name": "scanner", "version": "1.0.0", "type": "library", "hooks": {"run": ["main"]}}"#,
        );
        let mut cmd = descriptor("scan");
        cmd.handler = Some(vec!["./bin/scan".to_string()]);

        let mut table = CommandTable::new();
        table.register(&plugin, vec![cmd]).unwrap();
        assert_eq!(
            table.get("scan").unwrap().handler.as_deref(),
            Some(&["./bin/scan".to_string()][..])
        );
    }

    #[test]
    fn test_collision_across_plugins() {
        let first = stored(r#"{"name": "scanner", "version": "1.0.0", "type": "library"}"#);
        let second = stored(r#"{"name": "sweeper", "version": "2.0.0", "type": "library"}"#);

        let mut table = CommandTable::new();
        table.register(&first, vec![descriptor("scan")]).unwrap();
        let err = table
            .register(&second, vec![descriptor("sweep"), descriptor("scan")])
            .unwrap_err();

        match err {
            PlugError::Orchestrator { kind, plugin, message, .. } => {
                assert_eq!(kind, OrchestratorKind::CommandCollision);
                assert_eq!(plugin, "sweeper");
                assert!(message.contains("scanner@1.0.0"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(table.get("sweep").is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_collect_from_active_versions() {
        let runner = ScriptedRunner::default().respond(
            "scanner",
            HookKind::RegisterCommands,
            true,
            r#"[{"name": "scan"}, {"name": "sweep", "help": "Sweep a subnet"}]"#,
        );
        let active = vec![
            stored(
                r#"{"name": "scanner", "version": "1.0.0", "type": "cli",
                    "hooks": {"register_commands": ["sh", "commands.sh"]}}"#,
            ),
            stored(
                r#"{"name": "reporter", "version": "0.2.0", "type": "library-cli",
                    "cli_command": "report"}"#,
            ),
            stored(r#"{"name": "utils", "version": "3.0.0", "type": "library"}"#),
        ];

        let table = collect(&runner, &active).unwrap();
        let names: Vec<&String> = table.iter().map(|(name, _)| name).collect();
        assert_eq!(names, ["report", "scan", "sweep"]);
        assert!(table.get("report").unwrap().handler.is_none());
    }

    #[test]
    fn test_dispatch_without_handler() {
        let plugin = stored(r#"{"name": "scanner", "version": "1.0.0", "type": "library"}"#);
        let mut table = CommandTable::new();
        table.register(&plugin, vec![descriptor("scan")]).unwrap();

        let err = dispatch(table.get("scan").unwrap(), &[]).unwrap_err();
        assert!(matches!(err, PlugError::HookFailure { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn test_dispatch_returns_exit_code() {
        let temp = tempfile::TempDir::new().unwrap();
        let binding = CommandBinding {
            plugin: "scanner".to_string(),
            version: Version::new(1, 0, 0),
            descriptor: descriptor("scan"),
            handler: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                "test \"$PLUGCTL_COMMAND\" = scan && exit \"$0\"".to_string(),
            ]),
            install_dir: temp.path().to_path_buf(),
        };

        assert_eq!(dispatch(&binding, &["4".to_string()]).unwrap(), 4);
    }
}
