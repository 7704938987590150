//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Kestrel - Declarative k3s cluster provisioning.
#[derive(Parser, Debug)]
#[command(name = "kestrel")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "KESTREL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Log line format (text, json).
    #[arg(long, global = true, default_value = "text", env = "KESTREL_LOG_FORMAT")]
    pub log_format: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a starter kestrel.yaml.
    Init {
        /// Directory to initialize (defaults to current directory).
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Force overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },

    /// Validate the configuration and the descriptors it expands to.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Show what apply would do.
    Plan {
        /// Show attribute changes for updates.
        #[arg(short, long)]
        detailed: bool,
    },

    /// Converge the cluster towards the configuration.
    Apply {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Delete every managed resource.
    Destroy {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Show applied resources and pending changes.
    Status {
        /// Ask the provider whether each resource still exists.
        #[arg(short, long)]
        refresh: bool,
    },

    /// Inspect or repair the state file.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show current state.
    Show,

    /// Remove a stale lock.
    Unlock {
        /// Lock ID to release; defaults to whatever lock is present.
        #[arg(long)]
        lock_id: Option<String>,

        /// Release even if the lock has not expired.
        #[arg(long)]
        force: bool,
    },

    /// Forget a resource without deleting it upstream.
    Rm {
        /// Resource name.
        name: String,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_apply_with_globals() {
        let cli = Cli::try_parse_from(["kestrel", "apply", "--yes", "--output", "json", "-v"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.output, OutputFormat::Json);
        assert!(matches!(cli.command, Commands::Apply { yes: true }));
    }

    #[test]
    fn test_parse_state_rm() {
        let cli = Cli::try_parse_from(["kestrel", "state", "rm", "nic-0"]).unwrap();
        match cli.command {
            Commands::State {
                command: StateCommands::Rm { name },
            } => assert_eq!(name, "nic-0"),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
