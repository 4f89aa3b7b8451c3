//! Manual smoke-test binary: builds a descriptor for a file, registers it
//! for background sharing, prints cache stats, then shuts down cleanly.
//! Not part of the public API surface — a debugging aid, same role the
//! teacher's own CLI plays for its torrent inspection.

use std::path::PathBuf;

use clap::Parser;
use kotor_dcc::{CacheOptimizer, DccConfig};
use tracing::info;

#[derive(Parser, Debug)]
#[command(about = "Probe the distributed cache core against a local file")]
struct Args {
    /// File to hash, describe, and share.
    file: PathBuf,

    /// Directory holding the cache's persisted state (port, registry,
    /// descriptors). Defaults to the platform's conventional data dir.
    #[arg(long)]
    cache_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    kotor_dcc::logging::init_tracing();
    let args = Args::parse();

    let mut config = DccConfig::default();
    if let Some(dir) = args.cache_dir {
        config = config.with_cache_dir(dir);
    }

    let optimizer = CacheOptimizer::new(config);
    optimizer.ensure_initialized()?;
    info!(nat_status = ?optimizer.get_nat_status(), "probe initialized");

    let content_key = args.file.to_string_lossy().to_string();
    let descriptor = kotor_dcc::descriptor::build_descriptor(
        &args.file,
        args.file
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unnamed"),
        None,
        None,
    )?;
    println!("content_id: {}", descriptor.content_id);
    println!("piece_length: {}", descriptor.piece_length);

    let handle = optimizer
        .start_background_sharing(&content_key, &args.file, descriptor.content_id.clone())
        .await?;
    let (active, uploaded, connected) = optimizer.get_network_cache_stats();
    println!("active_shares={active} uploaded_bytes={uploaded} connected_sources={connected}");
    println!(
        "details: {}",
        optimizer.get_shared_resource_details(Some(descriptor.content_id.as_str()))
    );

    let _ = handle;
    optimizer.graceful_shutdown().await?;
    Ok(())
}
