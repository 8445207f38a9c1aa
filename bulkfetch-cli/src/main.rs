//! bulkfetch CLI - command-line front end for the download engine.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::error;
use tracing_subscriber::EnvFilter;

use bulkfetch::{format_size, DownloadStatus, Engine, EngineConfig, ProgressUpdate};

#[derive(Parser)]
#[command(name = "bulkfetch")]
#[command(about = "Bulk-download the files listed in a JSON manifest", long_about = None)]
struct Args {
    /// Path to the manifest file
    #[arg(long)]
    manifest: PathBuf,

    /// Directory downloads are written to
    #[arg(long, default_value = "downloads")]
    output: PathBuf,

    /// State file for resumable progress (falls back to the user-data
    /// directory when not writable)
    #[arg(long, default_value = "bulkfetch_state.json")]
    state: PathBuf,

    /// Base URL for manifests that carry bare digests instead of URLs
    #[arg(long)]
    base_url: Option<String>,

    /// Maximum concurrent downloads
    #[arg(long, default_value_t = 50)]
    concurrency: usize,

    /// Drop state records for entries no longer in the manifest
    #[arg(long)]
    prune: bool,

    /// Disable HTTP/2 negotiation entirely
    #[arg(long)]
    http1_only: bool,

    /// Only download the named entries (repeatable)
    #[arg(long = "only")]
    only: Vec<String>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = EngineConfig {
        state_path: args.state.clone(),
        base_url: args.base_url.clone(),
        max_concurrency: args.concurrency,
        prefer_http2: !args.http1_only,
        prune_on_merge: args.prune,
        ..Default::default()
    };

    let engine = match Engine::new(config) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            error!("failed to initialise engine: {e}");
            process::exit(1);
        }
    };

    let diff = match engine.load_manifest(&args.manifest).await {
        Ok(diff) => diff,
        Err(e) => {
            error!("failed to load manifest: {e}");
            process::exit(1);
        }
    };
    println!(
        "manifest: {} new, {} updated, {} unchanged, {} stale",
        diff.added.len(),
        diff.updated.len(),
        diff.preserved.len(),
        diff.removed.len()
    );

    if let Err(e) = engine.set_download_root(&args.output).await {
        error!("cannot use download root {}: {e}", args.output.display());
        process::exit(1);
    }

    if !args.only.is_empty() {
        engine.select(args.only.clone());
    }

    let total = engine
        .records()
        .await
        .iter()
        .filter(|r| !r.status.is_done())
        .count();

    let bar = ProgressBar::new(total as u64);
    bar.set_style(
        ProgressStyle::with_template("{prefix} [{elapsed_precise}] {wide_bar} {pos}/{len} {msg}")
            .expect("static template")
            .progress_chars("##-"),
    );
    bar.set_prefix("downloading");

    {
        let bar_update = bar.clone();
        let bar_println = bar.clone();
        engine.subscribe(
            Some(Arc::new(move |update: &ProgressUpdate| {
                match update.status {
                    DownloadStatus::Completed
                    | DownloadStatus::Skipped
                    | DownloadStatus::Failed
                    | DownloadStatus::VerifyFailed => bar_update.inc(1),
                    DownloadStatus::InProgress if update.rate_bps > 0.0 => {
                        bar_update.set_message(format!("{}/s", format_size(update.rate_bps as u64)));
                    }
                    _ => {}
                }
            })),
            Some(Arc::new(move |line: &str| bar_println.println(line))),
        );
    }

    // Ctrl-C requests a graceful drain; in-flight chunks finish and
    // partial progress is persisted for the next run.
    {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\ninterrupt received, draining...");
                engine.cancel();
            }
        });
    }

    let summary = match engine.start().await {
        Ok(summary) => summary,
        Err(e) => {
            error!("run failed: {e}");
            process::exit(1);
        }
    };
    bar.finish_and_clear();

    let stats = engine.statistics().await;
    println!(
        "{} completed, {} skipped, {} failed, {} cancelled in {:.1}s",
        summary.completed,
        summary.skipped,
        summary.failed,
        summary.cancelled,
        stats.elapsed.as_secs_f64()
    );
    println!(
        "transferred {} on the wire for {} on disk (ratio {:.2}), h2/h1 requests {}/{}",
        format_size(stats.raw_bytes),
        format_size(stats.decoded_bytes),
        stats.compression_ratio,
        stats.h2_requests,
        stats.h1_requests
    );

    if let Err(e) = engine.close().await {
        error!("shutdown checkpoint failed: {e}");
        process::exit(1);
    }

    if summary.failed > 0 {
        process::exit(1);
    }
}
