//! fetch-engine CLI - Main entry point
//!
//! Thin embedder around the engine: loads a manifest, runs the selection,
//! prints progress from the subscribe callback.

use anyhow::Result;
use clap::Parser;
use fetch_engine::progress::{format_bytes, format_speed};
use fetch_engine::{Engine, EngineConfig, LogLevel};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the manifest JSON file
    manifest: PathBuf,

    /// Directory downloaded files land in (default: ./downloads)
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// State file location (falls back to the user-data dir if unwritable)
    #[arg(short, long)]
    state: Option<PathBuf>,

    /// Base URL for manifest entries that carry only a digest
    #[arg(short, long)]
    base_url: Option<String>,

    /// Path to a TOML configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Maximum concurrent downloads (overrides config)
    #[arg(short = 'j', long)]
    max_concurrency: Option<usize>,

    /// Drop state records for entries missing from the manifest
    #[arg(long)]
    prune: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let mut config = if let Some(path) = &args.config {
        EngineConfig::from_file(path)?
    } else {
        let root = args
            .root
            .clone()
            .unwrap_or_else(|| PathBuf::from("downloads"));
        EngineConfig::new(root)
    };
    // Explicit CLI flags win over the config file.
    if let Some(root) = args.root {
        config.download_root = root;
    }
    if let Some(state) = args.state {
        config.state_path = state;
    }
    if let Some(base) = args.base_url {
        config.base_url = Some(base);
    }
    if let Some(n) = args.max_concurrency {
        config.concurrency.max_concurrency = n;
    }

    let engine = Arc::new(Engine::new(config)?);

    let diff = engine.load_manifest_file(&args.manifest, args.prune)?;
    tracing::info!(
        "manifest: {} new, {} changed, {} unchanged",
        diff.added.len(),
        diff.updated.len(),
        diff.preserved.len()
    );

    engine.select_all();
    engine.subscribe(
        Some(Arc::new(|update| {
            tracing::debug!(
                "{}: {:?} {} / {} ({})",
                update.name,
                update.status,
                format_bytes(update.bytes_downloaded),
                update
                    .total_bytes
                    .map(format_bytes)
                    .unwrap_or_else(|| "?".to_string()),
                format_speed(update.rate_bps),
            );
        })),
        Some(Arc::new(|event| match event.level {
            LogLevel::Error => tracing::error!("{}", event.message),
            LogLevel::Warn => tracing::warn!("{}", event.message),
            _ => tracing::info!("{}", event.message),
        })),
    );

    // Ctrl-C requests a cooperative drain; tasks rewind to pending.
    let cancel_engine = engine.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, draining in-flight downloads");
            cancel_engine.cancel();
        }
    });

    let summary = engine.start().await?;
    let stats = engine.statistics();

    tracing::info!(
        "done: {} completed, {} skipped, {} failed, {} verify-failed, {} cancelled in {:?}",
        summary.completed,
        summary.skipped,
        summary.failed,
        summary.verify_failed,
        summary.cancelled,
        summary.elapsed
    );
    tracing::info!(
        "transferred {} on the wire for {} decoded (ratio {:.2}); h2 {} / h1 {} requests, reuse {:.0}%",
        format_bytes(stats.raw_bytes),
        format_bytes(stats.decoded_bytes),
        stats.compression_ratio,
        stats.transport.h2_requests,
        stats.transport.h1_requests,
        stats.transport.reuse_ratio() * 100.0
    );

    engine.close().await?;

    if summary.failed > 0 || summary.verify_failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}
