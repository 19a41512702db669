//! Command-line interface components
//!
//! CLI-specific code for modelvault: argument parsing and command handlers.

pub mod args;
pub mod commands;

pub use args::{
    CleanupArgs, Cli, Commands, DownloadArgs, GlobalArgs, PriorityArg, RemoveArgs,
};
pub use commands::{
    handle_cleanup, handle_download, handle_list, handle_remove, handle_status, handle_verify,
};
