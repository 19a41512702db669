//! Command handlers for the modelvault CLI
//!
//! Each handler builds the engine from configuration, performs its
//! operation, and renders results for the terminal. Download progress is
//! rendered with an indicatif bar fed from the progress event bus.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use crate::app::{
    AllowAll, ArtifactRef, DownloadRequest, HttpTransferClient, SessionManager, SessionStatus,
    Sha256Hash,
};
use crate::cli::{CleanupArgs, DownloadArgs, GlobalArgs, RemoveArgs};
use crate::config::AppConfig;

/// Build the engine from global arguments and configuration
async fn build_engine(global: &GlobalArgs) -> Result<Arc<SessionManager>> {
    let mut config = AppConfig::load(global.config.as_deref()).await?;
    if let Some(root) = &global.root {
        config.storage.root = Some(root.clone());
    }

    let client = Arc::new(HttpTransferClient::with_config(config.to_client_config())?);
    let manager =
        SessionManager::new(config.to_engine_config(), client, Arc::new(AllowAll)).await?;
    Ok(manager)
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

/// Handle the download command
pub async fn handle_download(global: &GlobalArgs, args: DownloadArgs) -> Result<()> {
    let manager = build_engine(global).await?;

    let artifact = ArtifactRef {
        model_id: args.model.clone(),
        variant_id: args.variant.clone(),
        source_url: args
            .url
            .parse()
            .with_context(|| format!("invalid URL '{}'", args.url))?,
        total_bytes: args.size,
        expected_hash: Sha256Hash::from_hex(&args.hash).context("invalid --hash value")?,
    };

    let mut events = manager.events().subscribe();
    let request = DownloadRequest::with_priority(artifact, "cli", args.priority.into());
    let session_id = manager.start(request).await?;
    info!(%session_id, "download submitted");

    let bar = ProgressBar::new(args.size);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}",
        )
        .expect("static progress template")
        .progress_chars("#>-"),
    );

    let final_status = loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
            Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                break SessionStatus::Failed;
            }
        };
        if event.session_id != session_id {
            continue;
        }
        bar.set_position(event.downloaded_bytes);
        bar.set_message(event.status.to_string());
        if event.status.is_terminal() {
            break event.status;
        }
    };

    match final_status {
        SessionStatus::Completed => {
            bar.finish_with_message("completed");
            println!("Installed {}@{}", args.model, args.variant);
            Ok(())
        }
        status => {
            bar.abandon_with_message(status.to_string());
            let record = manager.get_session(&session_id).await?;
            bail!(
                "download {}: {}",
                status,
                record
                    .session
                    .error_message
                    .unwrap_or_else(|| "no error recorded".into())
            );
        }
    }
}

/// Handle the list command
pub async fn handle_list(global: &GlobalArgs) -> Result<()> {
    let manager = build_engine(global).await?;
    let models = manager.storage().list_models().await?;

    if models.is_empty() {
        println!("No models installed.");
        return Ok(());
    }

    for model in models {
        let quant = model.quantization.as_deref().unwrap_or("-");
        let arch = model.metadata.architecture.as_deref().unwrap_or("-");
        let last_used = model
            .stats
            .last_used_at
            .map(|t| t.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "never".into());
        println!(
            "{:<40} {:>10} {:<8} {:<10} used {} ({}x)",
            model.model_id,
            format_bytes(model.size_bytes),
            quant,
            arch,
            last_used,
            model.stats.usage_count,
        );
    }
    Ok(())
}

/// Handle the remove command
pub async fn handle_remove(global: &GlobalArgs, args: RemoveArgs) -> Result<()> {
    let manager = build_engine(global).await?;
    let freed = manager.storage().remove_model(&args.model_id).await?;
    if freed > 0 {
        println!("Removed {} ({} reclaimed)", args.model_id, format_bytes(freed));
    } else {
        println!(
            "Removed {} (blob retained, still referenced by another manifest)",
            args.model_id
        );
    }
    Ok(())
}

/// Handle the cleanup command
pub async fn handle_cleanup(global: &GlobalArgs, args: CleanupArgs) -> Result<()> {
    let manager = build_engine(global).await?;
    let target_bytes = args.target_mib * 1024 * 1024;
    let suggestions = manager.suggest_cleanup(target_bytes, None).await?;

    if suggestions.is_empty() {
        println!("Nothing to clean up.");
        return Ok(());
    }

    println!("{:<40} {:>10} {:>7} reason", "model", "size", "score");
    for suggestion in &suggestions {
        println!(
            "{:<40} {:>10} {:>7.3} {:?}",
            suggestion.model_id,
            format_bytes(suggestion.size_bytes),
            suggestion.priority_score,
            suggestion.reason,
        );
    }

    if args.apply {
        let mut freed = 0u64;
        for suggestion in &suggestions {
            freed += manager.storage().remove_model(&suggestion.model_id).await?;
        }
        println!("Reclaimed {}", format_bytes(freed));
    } else {
        println!("Run with --apply to delete the suggested models.");
    }
    Ok(())
}

/// Handle the verify command
pub async fn handle_verify(global: &GlobalArgs) -> Result<()> {
    let manager = build_engine(global).await?;
    let verifier = crate::app::Verifier::default();
    let report = manager.storage().verify_library(&verifier).await?;

    println!(
        "Checked {} models: {} ok, {} failed",
        report.files_checked,
        report.files_checked - report.files_failed,
        report.files_failed,
    );
    for failure in &report.failures {
        println!("  {}: {}", failure.model_id, failure.reason);
    }
    if report.is_successful() {
        Ok(())
    } else {
        bail!("library verification failed");
    }
}

/// Handle the status command
pub async fn handle_status(global: &GlobalArgs) -> Result<()> {
    let manager = build_engine(global).await?;
    let stats = manager.storage().stats().await?;
    let queue = manager.queue().stats().await;

    println!("Storage root: {}", manager.storage().root().display());
    println!("  models:    {} ({})", stats.model_count, format_bytes(stats.committed_bytes));
    println!("  partial:   {}", format_bytes(stats.partial_bytes));
    println!("  orphaned:  {}", format_bytes(stats.orphaned_bytes));
    println!(
        "  disk:      {} free of {}{}",
        format_bytes(stats.free_disk_bytes),
        format_bytes(stats.total_disk_bytes),
        if stats.low_on_space { " (LOW)" } else { "" },
    );
    println!(
        "Queue: {} active, {} queued ({} admitted total)",
        queue.active,
        queue.queued_total(),
        queue.admitted_total,
    );

    let sessions = manager.list_sessions().await;
    for record in sessions {
        println!(
            "  {} {:<12} {:>10}/{:<10} {}",
            record.session.id,
            record.session.status.to_string(),
            format_bytes(record.downloaded_bytes()),
            format_bytes(record.session.total_bytes()),
            record.session.artifact.model_id,
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KiB");
        assert_eq!(format_bytes(10 * 1024 * 1024), "10.00 MiB");
        assert_eq!(format_bytes(5 * 1024 * 1024 * 1024), "5.00 GiB");
    }
}
