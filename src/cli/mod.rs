//! CLI module for the Kestrel provisioning tool.
//!
//! This module provides the command-line interface for planning, applying
//! and inspecting cluster deployments.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::{MessageLevel, OutputFormatter};
