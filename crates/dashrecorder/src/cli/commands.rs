//! CLI command definitions.
//!
//! This module defines the structure of all CLI subcommands.

use std::path::PathBuf;

use clap::{Args, Subcommand, ValueEnum};

/// Run command arguments.
#[derive(Debug, Args)]
pub struct RunCommand {
    /// Do not start the upload scheduler, whatever the configuration says
    #[arg(long)]
    pub no_upload: bool,
}

/// Status command arguments.
#[derive(Debug, Args)]
pub struct StatusCommand {
    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// List command arguments.
#[derive(Debug, Args)]
pub struct ListCommand {
    /// Only show preserved (crash) segments
    #[arg(short, long)]
    pub preserved: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value = "table")]
    pub format: OutputFormat,
}

/// Verify command arguments.
#[derive(Debug, Args)]
pub struct VerifyCommand {
    /// Segment to verify; all segments when omitted
    pub name: Option<String>,

    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Preserve command arguments.
#[derive(Debug, Args)]
pub struct PreserveCommand {
    /// Segment to preserve; the most recent completed one when omitted
    pub name: Option<String>,
}

/// Purge command arguments.
#[derive(Debug, Args)]
pub struct PurgeCommand {
    /// Segment to delete
    pub name: String,

    /// Skip confirmation; required to delete a preserved segment
    #[arg(short, long)]
    pub yes: bool,
}

/// Enforce command arguments.
#[derive(Debug, Args)]
pub struct EnforceCommand {
    /// Output as JSON
    #[arg(short, long)]
    pub json: bool,
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show the configuration file path
    Path,

    /// Validate configuration
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

/// Output format for commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Plain text output
    #[default]
    Plain,
    /// Formatted table
    Table,
    /// JSON output
    Json,
}
