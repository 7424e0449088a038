use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{CommandFactory, Parser};
use clap_complete::generate;
use colored::Colorize;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use plugctl_core::{
    locate, Config, ExecuteOptions, InstallFailure, Orchestrator, PlugError, PluginFetcher,
    PluginRegistry, ProcessHookRunner, RegistryEntry, Resolver, Result, StepOutcome, Version,
    VersionStore,
};

mod args;
use args::{Cli, Commands, ConfigAction, RegistryAction, Shell};

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let base_dir = resolve_base_dir(cli.base_dir);
    debug!(base_dir = %base_dir.display(), "starting");

    let result = match cli.command {
        Some(Commands::Install {
            plugin,
            force,
            dry_run,
        }) => Context::load(&base_dir).and_then(|ctx| handle_install(&ctx, &plugin, force, dry_run)),
        Some(Commands::Switch { plugin, version }) => {
            Context::load(&base_dir).and_then(|ctx| handle_switch(&ctx, &plugin, &version))
        }
        Some(Commands::List { long }) => {
            Context::load(&base_dir).and_then(|ctx| handle_list(&ctx, long))
        }
        Some(Commands::Uninstall { plugin, version }) => {
            Context::load(&base_dir).and_then(|ctx| handle_uninstall(&ctx, &plugin, &version))
        }
        Some(Commands::Check { plugin }) => {
            Context::load(&base_dir).and_then(|ctx| handle_check(&ctx, &plugin))
        }
        Some(Commands::Commands) => Context::load(&base_dir).and_then(|ctx| handle_commands(&ctx)),
        Some(Commands::Run { command, args }) => {
            return match Context::load(&base_dir).and_then(|ctx| handle_run(&ctx, &command, &args)) {
                Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
                Err(e) => report_error(e),
            };
        }
        Some(Commands::Registry { action }) => {
            Context::load(&base_dir).and_then(|ctx| handle_registry(&ctx, action))
        }
        Some(Commands::Config { action }) => handle_config(action, &base_dir),
        Some(Commands::Completions { shell }) => {
            handle_completions(shell);
            Ok(())
        }
        None => {
            Cli::command().print_help().ok();
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => report_error(e),
    }
}

fn report_error(e: PlugError) -> ExitCode {
    eprintln!("{} {}", "[ERROR]".red().bold(), e);
    ExitCode::from(e.exit_code() as u8)
}

/// Logs go to stderr; `PLUGCTL_LOG` overrides the level chosen by flags
fn init_tracing(verbose: bool, quiet: bool) {
    let default = if verbose {
        "plugctl=debug,plugctl_core=debug"
    } else if quiet {
        "error"
    } else {
        "warn"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("PLUGCTL_LOG").unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn resolve_base_dir(cli_base: Option<PathBuf>) -> PathBuf {
    if let Some(base) = cli_base {
        return base;
    }

    if let Ok(base) = std::env::var("PLUGCTL_BASE") {
        return PathBuf::from(base);
    }

    dirs::home_dir()
        .map(|h| h.join(".plugctl"))
        .unwrap_or_else(|| PathBuf::from(".plugctl"))
}

/// Everything a plugin operation needs, built from the base directory
struct Context {
    base_dir: PathBuf,
    config: Config,
}

impl Context {
    fn load(base_dir: &Path) -> Result<Self> {
        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            config: Config::load(base_dir)?,
        })
    }

    fn store(&self) -> Result<VersionStore> {
        VersionStore::open(&self.config.store_root(&self.base_dir))
    }

    fn registry(&self) -> Result<PluginRegistry> {
        PluginRegistry::load(&self.config.registry_path(&self.base_dir))
    }

    fn fetcher(&self) -> Result<PluginFetcher> {
        PluginFetcher::new(self.config.fetch_timeout())
    }

    fn hooks(&self) -> ProcessHookRunner {
        ProcessHookRunner::new(self.config.hook_timeout())
    }
}

fn handle_install(ctx: &Context, reference: &str, force: bool, dry_run: bool) -> Result<()> {
    let request = locate(reference)?;
    let store = ctx.store()?;
    let registry = ctx.registry()?;
    let fetcher = ctx.fetcher()?;
    let hooks = ctx.hooks();

    println!();
    println!("Resolving {}...", request.to_string().cyan());

    let resolver = Resolver::new(&fetcher, &registry).with_retry(ctx.config.retry_policy());
    let plan = resolver.resolve(&request)?;

    println!("Install plan:");
    for (i, step) in plan.steps.iter().enumerate() {
        let state = if store.contains(&step.name, &step.version) {
            " (installed)".dimmed().to_string()
        } else {
            String::new()
        };
        println!("  {}. {} {}{}", i + 1, step.name.cyan(), step.version, state);
    }
    println!();

    if dry_run {
        println!("{}", "[DRY RUN] No plugins were installed.".yellow());
        return Ok(());
    }

    let orchestrator =
        Orchestrator::new(&store, &fetcher, &hooks).with_retry(ctx.config.retry_policy());
    let (report, failure) = match orchestrator.execute(&plan, ExecuteOptions { force }) {
        Ok(report) => (report, None),
        Err(InstallFailure { report, error }) => (report, Some(error)),
    };

    for step in &report.steps {
        let label = match step.outcome {
            StepOutcome::Installed => "installed",
            StepOutcome::Reinstalled => "reinstalled",
            StepOutcome::Activated => "already installed, activated",
        };
        println!("  {} {} {} {}", "[OK]".green(), step.name, step.version, label);
    }

    if !report.commands.is_empty() {
        println!();
        println!("Commands:");
        for (name, binding) in report.commands.iter() {
            println!("  {} ({})", name.cyan(), binding.plugin);
        }
    }

    println!();
    if let Some(error) = failure {
        println!(
            "{} {} of {} plugin(s) installed before the failure",
            "Aborted:".red(),
            report.steps.len(),
            plan.len()
        );
        return Err(error);
    }
    println!("{} {} plugin(s)", "Done:".green(), report.steps.len());
    Ok(())
}

fn handle_switch(ctx: &Context, plugin: &str, version: &Version) -> Result<()> {
    let store = ctx.store()?;
    let fetcher = ctx.fetcher()?;
    let hooks = ctx.hooks();
    let orchestrator = Orchestrator::new(&store, &fetcher, &hooks);

    let stored = orchestrator.switch(plugin, version)?;
    println!(
        "{} {} -> {}",
        "Switched:".green(),
        stored.name.cyan(),
        stored.version
    );
    Ok(())
}

fn handle_list(ctx: &Context, long: bool) -> Result<()> {
    let store = ctx.store()?;
    let fetcher = ctx.fetcher()?;
    let hooks = ctx.hooks();
    let orchestrator = Orchestrator::new(&store, &fetcher, &hooks);

    let plugins = orchestrator.list()?;
    if plugins.is_empty() {
        println!("No plugins installed.");
        println!();
        println!("Install one with: plugctl install <name>");
        return Ok(());
    }

    println!();
    for status in plugins {
        println!("  {}", status.name.cyan().bold());
        for version in &status.versions {
            let is_active = status.active.as_ref() == Some(version);
            let marker = if is_active { "*".green() } else { " ".normal() };
            let suffix = if is_active {
                " (active)".green().to_string()
            } else {
                String::new()
            };
            println!("    {} {}{}", marker, version, suffix);

            if long {
                let stored = store.get(&status.name, version)?;
                println!("        Origin:    {}", stored.origin);
                println!(
                    "        Installed: {}",
                    stored
                        .installed_at
                        .with_timezone(&chrono::Local)
                        .format("%Y-%m-%d %H:%M:%S")
                );
                println!("        Checksum:  {}", stored.checksum.dimmed());
                println!("        Path:      {}", stored.storage_path.display());
            }
        }
        println!();
    }
    Ok(())
}

fn handle_uninstall(ctx: &Context, plugin: &str, version: &Version) -> Result<()> {
    let store = ctx.store()?;
    let fetcher = ctx.fetcher()?;
    let hooks = ctx.hooks();
    let orchestrator = Orchestrator::new(&store, &fetcher, &hooks);

    orchestrator.uninstall(plugin, version)?;
    println!("{} {} {}", "Removed:".green(), plugin.cyan(), version);

    match store.active_version(plugin)? {
        Some(active) => println!("  Active version is now {}", active),
        None if store.list_versions(plugin)?.is_empty() => {
            println!("  No versions of {} remain", plugin)
        }
        None => {}
    }
    Ok(())
}

fn handle_check(ctx: &Context, plugin: &str) -> Result<()> {
    let store = ctx.store()?;
    let fetcher = ctx.fetcher()?;
    let hooks = ctx.hooks();
    let orchestrator = Orchestrator::new(&store, &fetcher, &hooks);

    let report = orchestrator.check(plugin)?;

    println!();
    println!("{} {}", report.plugin.cyan().bold(), report.version);
    match report.components {
        None => println!("  No check hook declared."),
        Some(components) if components.is_empty() => println!("  No components reported."),
        Some(components) => {
            for (component, ok) in components {
                let status = if ok { "[OK]".green() } else { "[FAIL]".red() };
                println!("  {} {}", status, component);
            }
        }
    }
    println!();
    Ok(())
}

fn handle_commands(ctx: &Context) -> Result<()> {
    let store = ctx.store()?;
    let hooks = ctx.hooks();
    let table = plugctl_core::collect(&hooks, &store.active_versions()?)?;

    if table.is_empty() {
        println!("No plugin commands available.");
        return Ok(());
    }

    println!();
    for (name, binding) in table.iter() {
        let args: Vec<String> = binding
            .descriptor
            .args
            .iter()
            .map(|arg| {
                if arg.required {
                    format!("<{}>", arg.name)
                } else {
                    format!("[{}]", arg.name)
                }
            })
            .collect();

        println!(
            "  {} {}  {}",
            name.cyan().bold(),
            args.join(" "),
            format!("({} {})", binding.plugin, binding.version).dimmed()
        );
        if !binding.descriptor.help.is_empty() {
            println!("      {}", binding.descriptor.help);
        }
    }
    println!();
    Ok(())
}

fn handle_run(ctx: &Context, command: &str, args: &[String]) -> Result<i32> {
    let store = ctx.store()?;
    let hooks = ctx.hooks();
    let table = plugctl_core::collect(&hooks, &store.active_versions()?)?;

    let binding = table.get(command).ok_or_else(|| PlugError::CommandNotFound {
        name: command.to_string(),
    })?;
    plugctl_core::dispatch(binding, args)
}

fn handle_registry(ctx: &Context, action: RegistryAction) -> Result<()> {
    let mut registry = ctx.registry()?;

    match action {
        RegistryAction::Add {
            name,
            url,
            version,
            description,
        } => {
            registry.add(
                &name,
                RegistryEntry {
                    url: url.clone(),
                    version,
                    description,
                },
            )?;
            registry.save()?;
            println!("{} {} -> {}", "Registered:".green(), name.cyan(), url);
        }
        RegistryAction::Remove { name } => {
            registry.remove(&name)?;
            registry.save()?;
            println!("{} {}", "Unregistered:".green(), name.cyan());
        }
        RegistryAction::List => {
            let entries: Vec<_> = registry.list().collect();
            if entries.is_empty() {
                println!("No registry entries in {}", registry.path().display());
                println!();
                println!("Add one with: plugctl registry add <name> <url>");
                return Ok(());
            }

            println!();
            for (name, entry) in entries {
                let constraint = entry.version.as_deref().unwrap_or("*");
                println!("  {} {}", name.cyan().bold(), constraint.dimmed());
                println!("    {}", entry.url);
                if let Some(description) = &entry.description {
                    println!("    {}", description);
                }
            }
            println!();
        }
    }

    Ok(())
}

fn handle_config(action: ConfigAction, base_dir: &Path) -> Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let config = Config::load(base_dir)?;
            match config.get(&key) {
                Some(value) => {
                    println!("{}", value);
                }
                None => {
                    return Err(PlugError::ConfigKeyNotFound { key });
                }
            }
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load(base_dir)?;
            config.set(&key, &value)?;
            config.save(base_dir)?;
            println!("{} {} = {}", "Set:".green(), key, value);
        }
        ConfigAction::List => {
            let config = Config::load(base_dir)?;
            println!();
            for (key, value) in config.list() {
                println!("{} = {}", key.cyan(), value);
            }
            println!();
        }
        ConfigAction::Path => {
            let path = Config::path(base_dir);
            println!("{}", path.display());
        }
        ConfigAction::Init => {
            let path = Config::init(base_dir)?;
            println!("{} {}", "Initialized:".green(), path.display());
        }
    }

    Ok(())
}

fn handle_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let shell = match shell {
        Shell::Bash => clap_complete::Shell::Bash,
        Shell::Zsh => clap_complete::Shell::Zsh,
        Shell::Fish => clap_complete::Shell::Fish,
        Shell::PowerShell => clap_complete::Shell::PowerShell,
        Shell::Elvish => clap_complete::Shell::Elvish,
    };
    generate(shell, &mut cmd, "plugctl", &mut io::stdout());
}
