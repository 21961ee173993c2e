//! Command-line interface for dashrecorder.
//!
//! This module provides the CLI structure for the `dashrec` binary.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

pub use commands::{
    ConfigCommand, EnforceCommand, ListCommand, OutputFormat, PreserveCommand, PurgeCommand,
    RunCommand, StatusCommand, VerifyCommand,
};

/// dashrec - Record, keep and verify dashcam footage
///
/// Records the camera in fixed-length segments, keeps the footage around a
/// detected impact, evicts old footage when space runs low and fingerprints
/// every segment so tampering can be detected.
#[derive(Debug, Parser)]
#[command(name = "dashrec")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to custom configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// The command to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Record until interrupted
    Run(RunCommand),

    /// Show segment counts and disk usage
    Status(StatusCommand),

    /// List recorded segments
    List(ListCommand),

    /// Check segments against their recorded fingerprints
    Verify(VerifyCommand),

    /// Preserve a segment as crash footage
    Preserve(PreserveCommand),

    /// Delete a segment, preserved or not
    Purge(PurgeCommand),

    /// Apply the retention policy once
    Enforce(EnforceCommand),

    /// View or validate configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

impl Cli {
    /// Get the verbosity level based on flags.
    #[must_use]
    pub fn verbosity(&self) -> crate::logging::Verbosity {
        if self.quiet {
            crate::logging::Verbosity::Quiet
        } else {
            match self.verbose {
                0 => crate::logging::Verbosity::Normal,
                1 => crate::logging::Verbosity::Verbose,
                _ => crate::logging::Verbosity::Trace,
            }
        }
    }
}
