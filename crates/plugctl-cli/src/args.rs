use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use plugctl_core::Version;

#[derive(Parser)]
#[command(name = "plugctl")]
#[command(about = "Plugin manager for the audit framework: resolve, install and switch plugin versions")]
#[command(version)]
pub struct Cli {
    /// Verbose output (debug logging)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Quiet output (errors only)
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Base directory (default: ~/.plugctl)
    #[arg(long, global = true)]
    pub base_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
#[allow(clippy::enum_variant_names)]
pub enum Shell {
    Bash,
    Zsh,
    Fish,
    PowerShell,
    Elvish,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Install a plugin and its dependencies
    Install {
        /// Dependency reference (e.g., "scanner", "scanner>=1.2.0", "scanner@./scanner")
        plugin: String,

        /// Re-run install hooks for versions that are already installed
        #[arg(short, long)]
        force: bool,

        /// Resolve and print the install plan without installing
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Activate another installed version of a plugin
    Switch {
        /// Plugin name
        plugin: String,

        /// Installed version to activate
        #[arg(value_parser = parse_version)]
        version: Version,
    },

    /// List installed plugins and their versions
    List {
        /// Show origin, install time and checksum of every version
        #[arg(short = 'l', long)]
        long: bool,
    },

    /// Remove one installed version of a plugin
    Uninstall {
        /// Plugin name
        plugin: String,

        /// Version to remove
        #[arg(value_parser = parse_version)]
        version: Version,
    },

    /// Run the check hook of a plugin's active version
    Check {
        /// Plugin name
        plugin: String,
    },

    /// List commands contributed by active plugins
    Commands,

    /// Run a command contributed by a plugin
    Run {
        /// Command name (see `plugctl commands`)
        command: String,

        /// Arguments passed to the plugin's handler
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Manage the plugin registry reference file
    Registry {
        #[command(subcommand)]
        action: RegistryAction,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
pub enum RegistryAction {
    /// Register a plugin source
    Add {
        /// Plugin name
        name: String,

        /// Archive URL, file:// path, or path relative to the registry file
        url: String,

        /// Constraint every served version must satisfy (e.g., ">=1.2.0")
        #[arg(long)]
        version: Option<String>,

        /// Short description
        #[arg(short, long)]
        description: Option<String>,
    },

    /// Remove a registered plugin source
    Remove {
        /// Plugin name
        name: String,
    },

    /// List registered plugin sources
    List,
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Get a config value
    Get {
        /// Config key (e.g., fetch.retries)
        key: String,
    },

    /// Set a config value
    Set {
        /// Config key (e.g., fetch.retries)
        key: String,

        /// Value to set ("default" clears store.root / registry.path)
        value: String,
    },

    /// List all config values
    List,

    /// Show config file path
    Path,

    /// Initialize config file with defaults and comments
    Init,
}

fn parse_version(raw: &str) -> Result<Version, String> {
    Version::parse(raw).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_switch() {
        let cli = Cli::try_parse_from(["plugctl", "switch", "scanner", "1.2.0"]).unwrap();
        match cli.command {
            Some(Commands::Switch { plugin, version }) => {
                assert_eq!(plugin, "scanner");
                assert_eq!(version, Version::new(1, 2, 0));
            }
            _ => panic!("expected switch"),
        }
    }

    #[test]
    fn test_rejects_malformed_version() {
        assert!(Cli::try_parse_from(["plugctl", "uninstall", "scanner", "1.2"]).is_err());
    }

    #[test]
    fn test_run_passes_hyphenated_args() {
        let cli = Cli::try_parse_from(["plugctl", "run", "scan", "--ports", "1-1024", "host"])
            .unwrap();
        match cli.command {
            Some(Commands::Run { command, args }) => {
                assert_eq!(command, "scan");
                assert_eq!(args, ["--ports", "1-1024", "host"]);
            }
            _ => panic!("expected run"),
        }
    }
}
