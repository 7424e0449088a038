//! Lifecycle hooks
//!
//! Hooks are argv arrays declared in `plugin.json`. They run as child
//! processes inside the version directory with a cleared environment that
//! only carries `PATH` and the `PLUGCTL_*` variables, and are killed once
//! their timeout elapses.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::commands::CommandDescriptor;
use crate::error::{PlugError, Result};
use crate::manifest::HookTable;
use crate::store::StoredVersion;
use crate::version::Version;

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    Install,
    Check,
    RegisterCommands,
    Uninstall,
}

impl HookKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Check => "check",
            Self::RegisterCommands => "register_commands",
            Self::Uninstall => "uninstall",
        }
    }

    /// The argv declared for this hook, if any
    pub fn argv<'a>(&self, hooks: &'a HookTable) -> Option<&'a [String]> {
        let argv = match self {
            Self::Install => hooks.install.as_ref(),
            Self::Check => hooks.check.as_ref(),
            Self::RegisterCommands => hooks.register_commands.as_ref(),
            Self::Uninstall => hooks.uninstall.as_ref(),
        };
        argv.map(Vec::as_slice).filter(|argv| !argv.is_empty())
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which plugin version a hook runs for
#[derive(Debug, Clone)]
pub struct HookContext {
    pub plugin: String,
    pub version: Version,
    pub install_dir: PathBuf,
}

impl HookContext {
    pub fn for_version(stored: &StoredVersion) -> Self {
        Self {
            plugin: stored.name.clone(),
            version: stored.version,
            install_dir: stored.storage_path.clone(),
        }
    }

    fn failure(&self, hook: HookKind, message: impl Into<String>) -> PlugError {
        PlugError::HookFailure {
            plugin: self.plugin.clone(),
            version: self.version.to_string(),
            hook: hook.to_string(),
            message: message.into(),
        }
    }
}

/// Captured result of one hook process
#[derive(Debug, Clone, Default)]
pub struct HookOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Executes hook argv for a plugin version
pub trait HookRunner: Send + Sync {
    fn run(&self, ctx: &HookContext, hook: HookKind, argv: &[String]) -> Result<HookOutput>;
}

/// Build the child command with the restricted environment shared by hooks
/// and command handlers.
pub(crate) fn plugin_command(ctx: &HookContext, argv: &[String]) -> Option<Command> {
    let (program, args) = argv.split_first()?;

    // `./install.sh` means a script shipped inside the version directory
    let program_path = Path::new(program);
    let program: OsString = if program_path.is_relative() && program_path.components().count() > 1 {
        ctx.install_dir.join(program_path).into_os_string()
    } else {
        OsString::from(program)
    };

    let path = std::env::var_os("PATH").unwrap_or_else(|| OsString::from(FALLBACK_PATH));

    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(&ctx.install_dir)
        .env_clear()
        .env("PATH", path)
        .env("PLUGCTL_INSTALL_DIR", &ctx.install_dir)
        .env("PLUGCTL_PLUGIN", &ctx.plugin)
        .env("PLUGCTL_VERSION", ctx.version.to_string());
    Some(command)
}

/// Runs hooks as child processes with a timeout
pub struct ProcessHookRunner {
    timeout: Duration,
}

impl ProcessHookRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn wait(&self, ctx: &HookContext, hook: HookKind, mut child: Child) -> Result<HookOutput> {
        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let started = Instant::now();
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if started.elapsed() >= self.timeout {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ctx.failure(
                    hook,
                    format!("timed out after {}s", self.timeout.as_secs_f32()),
                ));
            }
            thread::sleep(POLL_INTERVAL);
        };

        let collect = |handle: Option<thread::JoinHandle<String>>| {
            handle
                .and_then(|h| h.join().ok())
                .unwrap_or_default()
        };

        Ok(HookOutput {
            success: status.success(),
            stdout: collect(stdout),
            stderr: collect(stderr),
        })
    }
}

impl HookRunner for ProcessHookRunner {
    fn run(&self, ctx: &HookContext, hook: HookKind, argv: &[String]) -> Result<HookOutput> {
        let mut command =
            plugin_command(ctx, argv).ok_or_else(|| ctx.failure(hook, "empty hook command"))?;

        debug!(plugin = %ctx.plugin, version = %ctx.version, %hook, ?argv, "running hook");

        let child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ctx.failure(hook, format!("failed to start {}: {}", argv[0], e)))?;

        self.wait(ctx, hook, child)
    }
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

// ========== Hook contract ==========

fn run_declared(
    runner: &dyn HookRunner,
    stored: &StoredVersion,
    hook: HookKind,
) -> Result<Option<(HookContext, HookOutput)>> {
    let Some(argv) = hook.argv(&stored.manifest.hooks) else {
        return Ok(None);
    };
    let ctx = HookContext::for_version(stored);
    let output = runner.run(&ctx, hook, argv)?;
    Ok(Some((ctx, output)))
}

fn require_success(ctx: &HookContext, hook: HookKind, output: &HookOutput) -> Result<()> {
    if output.success {
        return Ok(());
    }
    let detail = output.stderr.trim();
    let message = if detail.is_empty() {
        "exited with non-zero status".to_string()
    } else {
        detail.to_string()
    };
    Err(ctx.failure(hook, message))
}

/// `install`: a plugin without an install hook installs trivially
pub fn install(runner: &dyn HookRunner, stored: &StoredVersion) -> Result<()> {
    match run_declared(runner, stored, HookKind::Install)? {
        Some((ctx, output)) => require_success(&ctx, HookKind::Install, &output),
        None => Ok(()),
    }
}

pub fn uninstall(runner: &dyn HookRunner, stored: &StoredVersion) -> Result<()> {
    match run_declared(runner, stored, HookKind::Uninstall)? {
        Some((ctx, output)) => require_success(&ctx, HookKind::Uninstall, &output),
        None => Ok(()),
    }
}

/// `check`: component name to health, `None` when the plugin declares no check
pub fn check(runner: &dyn HookRunner, stored: &StoredVersion) -> Result<Option<BTreeMap<String, bool>>> {
    let Some((ctx, output)) = run_declared(runner, stored, HookKind::Check)? else {
        return Ok(None);
    };
    require_success(&ctx, HookKind::Check, &output)?;

    serde_json::from_str(output.stdout.trim())
        .map(Some)
        .map_err(|e| ctx.failure(HookKind::Check, format!("expected a JSON object of booleans: {}", e)))
}

/// Command descriptors the plugin contributes to the host CLI.
///
/// Without a `register_commands` hook, a `cli`/`library-cli` plugin with a
/// `cli_command` contributes a single descriptor built from its manifest.
pub fn register_commands(
    runner: &dyn HookRunner,
    stored: &StoredVersion,
) -> Result<Vec<CommandDescriptor>> {
    let Some((ctx, output)) = run_declared(runner, stored, HookKind::RegisterCommands)? else {
        return Ok(CommandDescriptor::implicit(&stored.manifest).into_iter().collect());
    };
    require_success(&ctx, HookKind::RegisterCommands, &output)?;

    let descriptors: Vec<CommandDescriptor> = serde_json::from_str(output.stdout.trim())
        .map_err(|e| {
            ctx.failure(
                HookKind::RegisterCommands,
                format!("expected a JSON array of command descriptors: {}", e),
            )
        })?;

    if descriptors.is_empty() {
        warn!(plugin = %ctx.plugin, "register_commands returned no commands");
    }
    Ok(descriptors)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Scripted runner: hooks answer from a table keyed by
    /// `(plugin, hook)`; unscripted hooks succeed with empty output.
    #[derive(Default)]
    pub struct ScriptedRunner {
        outputs: HashMap<(String, &'static str), HookOutput>,
        delay: Duration,
        pub calls: Mutex<Vec<String>>,
    }

    impl ScriptedRunner {
        pub fn respond(mut self, plugin: &str, hook: HookKind, success: bool, stdout: &str) -> Self {
            self.outputs.insert(
                (plugin.to_string(), hook.as_str()),
                HookOutput {
                    success,
                    stdout: stdout.to_string(),
                    stderr: if success { String::new() } else { "boom".to_string() },
                },
            );
            self
        }

        /// Every hook sleeps this long before answering
        pub fn slow(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl HookRunner for ScriptedRunner {
        fn run(&self, ctx: &HookContext, hook: HookKind, _argv: &[String]) -> Result<HookOutput> {
            thread::sleep(self.delay);
            self.calls
                .lock()
                .unwrap()
                .push(format!("{}@{}:{}", ctx.plugin, ctx.version, hook));
            Ok(self
                .outputs
                .get(&(ctx.plugin.clone(), hook.as_str()))
                .cloned()
                .unwrap_or(HookOutput {
                    success: true,
                    ..HookOutput::default()
                }))
        }
    }
}
