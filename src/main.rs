//! modelvault CLI application
//!
//! Command-line interface for downloading and managing large model
//! artifacts with resumable transfers and verified storage.

use std::process;

use tracing_subscriber::{fmt, EnvFilter};

use anyhow::Result;
use modelvault::cli::{
    handle_cleanup, handle_download, handle_list, handle_remove, handle_status, handle_verify, Cli,
    Commands,
};

#[tokio::main]
async fn main() {
    let result = run().await;

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

/// Main application logic
async fn run() -> Result<()> {
    let cli = Cli::parse_args();
    init_logging(&cli);

    match cli.command {
        Commands::Download(ref args) => handle_download(&cli.global, args.clone()).await,
        Commands::List => handle_list(&cli.global).await,
        Commands::Remove(ref args) => handle_remove(&cli.global, args.clone()).await,
        Commands::Cleanup(ref args) => handle_cleanup(&cli.global, args.clone()).await,
        Commands::Verify => handle_verify(&cli.global).await,
        Commands::Status => handle_status(&cli.global).await,
    }
}

/// Initialize logging based on CLI verbosity settings
fn init_logging(cli: &Cli) {
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("modelvault={}", cli.log_level()).parse().unwrap());

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
