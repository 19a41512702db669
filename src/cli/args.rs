//! Command-line argument parsing for modelvault
//!
//! This module defines the CLI structure using clap derive macros, covering
//! download submission, library management, verification, and cleanup.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::app::Priority;

/// modelvault - download and manage large model artifacts
#[derive(Parser, Debug)]
#[command(
    name = "modelvault",
    version,
    about = "Download large model artifacts with resumable transfers and verified storage",
    long_about = "A high-performance downloader for large model artifacts.
Features chunked resumable transfers, streaming integrity verification,
content-addressed storage with deduplication, and scored cleanup suggestions."
)]
pub struct Cli {
    /// Global options
    #[command(flatten)]
    pub global: GlobalArgs,

    /// Subcommands
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Parse arguments from the process environment
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Effective log level from verbosity flags
    pub fn log_level(&self) -> &'static str {
        if self.global.very_verbose {
            "debug"
        } else if self.global.verbose {
            "info"
        } else if self.global.quiet {
            "error"
        } else {
            "warn"
        }
    }
}

/// Global arguments available to all subcommands
#[derive(Args, Debug)]
pub struct GlobalArgs {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Very verbose logging (debug level)
    #[arg(long, global = true)]
    pub very_verbose: bool,

    /// Quiet mode - suppress non-essential output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Configuration file path
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Storage root directory
    #[arg(long, global = true, value_name = "DIR")]
    pub root: Option<PathBuf>,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download a model artifact
    Download(DownloadArgs),

    /// List installed models
    List,

    /// Remove an installed model
    Remove(RemoveArgs),

    /// Suggest (and optionally apply) cleanup to reclaim disk space
    Cleanup(CleanupArgs),

    /// Re-hash every installed blob against its manifest
    Verify,

    /// Show storage accounting and live sessions
    Status,
}

/// Priority tier accepted on the command line
#[derive(ValueEnum, Debug, Clone, Copy, Default)]
pub enum PriorityArg {
    /// Background tier
    Low,
    /// Default tier
    #[default]
    Normal,
    /// Served ahead of queued normal/low downloads
    High,
}

impl From<PriorityArg> for Priority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::Low => Priority::Low,
            PriorityArg::Normal => Priority::Normal,
            PriorityArg::High => Priority::High,
        }
    }
}

impl std::fmt::Display for PriorityArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PriorityArg::Low => "low",
            PriorityArg::Normal => "normal",
            PriorityArg::High => "high",
        };
        write!(f, "{s}")
    }
}

/// Arguments for the download command
#[derive(Args, Debug, Clone)]
pub struct DownloadArgs {
    /// Source URL of the artifact
    pub url: String,

    /// Expected artifact size in bytes
    #[arg(long)]
    pub size: u64,

    /// Expected SHA-256 content hash (64 hex characters)
    #[arg(long)]
    pub hash: String,

    /// Catalog model identifier
    #[arg(short, long)]
    pub model: String,

    /// Variant identifier (e.g. quantization label)
    #[arg(long, default_value = "")]
    pub variant: String,

    /// Admission priority
    #[arg(long, value_enum, default_value_t = PriorityArg::Normal)]
    pub priority: PriorityArg,
}

/// Arguments for the remove command
#[derive(Args, Debug, Clone)]
pub struct RemoveArgs {
    /// Manifest key of the installed model (as shown by `list`)
    pub model_id: String,
}

/// Arguments for the cleanup command
#[derive(Args, Debug, Clone)]
pub struct CleanupArgs {
    /// Target amount of space to reclaim, in MiB (0 = full audit)
    #[arg(long, default_value_t = 0)]
    pub target_mib: u64,

    /// Delete the suggested models instead of only listing them
    #[arg(long)]
    pub apply: bool,
}
