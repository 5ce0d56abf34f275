use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use backend::{scan_root, BackendConfig, BackendState};
use catalog::RedbCatalog;
use metadata::LoftyProber;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut args = env::args().skip(1);
    let music_root = args
        .next()
        .or_else(|| env::var("MUSIC_ROOT").ok())
        .ok_or("MUSIC_ROOT not set and no path argument")?;
    let catalog_path = args
        .next()
        .or_else(|| env::var("CATALOG_PATH").ok())
        .unwrap_or_else(|| "data/catalog.redb".to_string());

    let catalog = Arc::new(RedbCatalog::open(Path::new(&catalog_path))?);
    let mut config = BackendConfig::default();
    config.music_root = music_root.clone();
    let state = BackendState::new(
        config,
        PathBuf::from(&catalog_path),
        catalog,
        Arc::new(LoftyProber),
    );

    let summary = scan_root(&state, PathBuf::from(&music_root)).await;
    println!(
        "Indexed: {} scanned, {} upserted, {} pruned in {} seconds",
        summary.scanned, summary.upserted, summary.pruned, summary.elapsed_secs
    );

    Ok(())
}
