use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use catalog::CatalogStore;
use common::{path_to_key, SongFields};
use metadata::{ProbeData, Prober};
use tokio::sync::mpsc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::state::{BackendState, ScanStatus};
use crate::watch::configure_watcher;

/// Terminal signal of a scan: every discovered regular file, every record
/// written, every stale record swept afterwards.
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct ScanSummary {
    pub scanned: u64,
    pub upserted: u64,
    pub pruned: u64,
    pub elapsed_secs: u64,
}

pub fn start_index(state: BackendState, root: PathBuf, force_rescan: bool) {
    let rescan_at_start = state.config.read().rescan_at_start;
    if !force_rescan && !rescan_at_start && catalog_populated(&state) {
        info!("Catalog already populated; skipping startup scan");
        *state.scan_status.write() = ScanStatus::Ready(ScanSummary::default());
        configure_watcher(&state, root);
        return;
    }

    {
        let mut guard = state.scan_status.write();
        *guard = ScanStatus::Scanning {
            started: SystemTime::now(),
        };
    }
    *state.watcher.write() = None;

    tokio::spawn(async move {
        let summary = scan_root(&state, root.clone()).await;
        *state.scan_status.write() = ScanStatus::Ready(summary);
        configure_watcher(&state, root);
    });
}

fn catalog_populated(state: &BackendState) -> bool {
    match state.catalog.list_files() {
        Ok(files) => !files.is_empty(),
        Err(err) => {
            warn!("Failed to inspect catalog, scanning anyway: {}", err);
            false
        }
    }
}

/// Walks `root` and feeds every regular file through the probe pool, then
/// sweeps records whose files no longer exist. Traversal is paced by the
/// pool: the bounded channel and the probe permits cap how far the walker
/// can run ahead of the workers.
pub async fn scan_root(state: &BackendState, root: PathBuf) -> ScanSummary {
    let config = state.config.read().clone();
    let started = Instant::now();
    info!("Scanning directory: {}", root.display());

    let concurrent_probes = config.concurrent_probes.max(1);
    let (tx, mut rx) = mpsc::channel::<PathBuf>(concurrent_probes);
    let follow_symlinks = config.follow_symlinks;
    let walk_root = root.clone();
    let walker = tokio::task::spawn_blocking(move || {
        let mut discovered = 0u64;
        for entry in WalkDir::new(&walk_root).follow_links(follow_symlinks) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("Walk error under {}: {}", walk_root.display(), err);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            discovered += 1;
            if tx.blocking_send(entry.into_path()).is_err() {
                break;
            }
        }
        discovered
    });

    let scheduler = ScanScheduler::new(
        Arc::clone(&state.catalog),
        Arc::clone(&state.prober),
        config.import_formats.clone(),
        concurrent_probes,
    );
    while let Some(path) = rx.recv().await {
        debug!("Scanning: {}", path.display());
        scheduler.submit(path).await;
    }
    scheduler.drain().await;

    let scanned = match walker.await {
        Ok(discovered) => discovered,
        Err(err) => {
            warn!("Scan walk join error: {}", err);
            0
        }
    };

    let catalog = Arc::clone(&state.catalog);
    let pruned = tokio::task::spawn_blocking(move || prune_missing(catalog.as_ref()))
        .await
        .unwrap_or(0);

    let summary = ScanSummary {
        scanned,
        upserted: scheduler.upserted(),
        pruned,
        elapsed_secs: started.elapsed().as_secs(),
    };
    info!("Scanned files: {}", summary.scanned);
    info!("Upserted files: {}", summary.upserted);
    info!("Done in: {} seconds", summary.elapsed_secs);
    summary
}

/// Bounded probe pool. `submit` blocks while `concurrent_probes` items are
/// in flight; the permit drop inside the worker is the completion signal
/// and fires exactly once per item on every outcome.
struct ScanScheduler {
    semaphore: Arc<Semaphore>,
    permits: usize,
    catalog: Arc<dyn CatalogStore>,
    prober: Arc<dyn Prober>,
    formats: Arc<Vec<String>>,
    upserted: Arc<AtomicU64>,
}

impl ScanScheduler {
    fn new(
        catalog: Arc<dyn CatalogStore>,
        prober: Arc<dyn Prober>,
        formats: Vec<String>,
        concurrent_probes: usize,
    ) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrent_probes)),
            permits: concurrent_probes,
            catalog,
            prober,
            formats: Arc::new(formats),
            upserted: Arc::new(AtomicU64::new(0)),
        }
    }

    async fn submit(&self, path: PathBuf) {
        let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        let catalog = Arc::clone(&self.catalog);
        let prober = Arc::clone(&self.prober);
        let formats = Arc::clone(&self.formats);
        let upserted = Arc::clone(&self.upserted);
        tokio::task::spawn_blocking(move || {
            if probe_and_upsert(catalog.as_ref(), prober.as_ref(), &formats, &path) {
                upserted.fetch_add(1, Ordering::Relaxed);
            }
            drop(permit);
        });
    }

    async fn drain(&self) {
        let _ = self.semaphore.acquire_many(self.permits as u32).await;
    }

    fn upserted(&self) -> u64 {
        self.upserted.load(Ordering::Relaxed)
    }
}

/// One unit of catalog work: probe, apply the import policy, upsert.
/// Every failure mode is non-fatal; the file simply stays out of the
/// catalog. Returns whether a record was written.
pub(crate) fn probe_and_upsert(
    catalog: &dyn CatalogStore,
    prober: &dyn Prober,
    formats: &[String],
    path: &Path,
) -> bool {
    let data = match prober.probe(path) {
        Ok(data) => data,
        Err(err) => {
            warn!("Error while probing {}: {}", path.display(), err);
            return false;
        }
    };
    if !formats.iter().any(|format| format == &data.format_name) {
        debug!(
            "Format {} not supported, skipping {}",
            data.format_name,
            path.display()
        );
        return false;
    }

    let fields = song_fields_from_probe(path, &data);
    let file = path_to_key(path);
    match catalog.upsert(&file, &fields) {
        Ok(song) => {
            debug!("Upserted: {}", song.file);
            true
        }
        Err(err) => {
            warn!("Error while updating catalog for {}: {}", path.display(), err);
            false
        }
    }
}

fn song_fields_from_probe(path: &Path, data: &ProbeData) -> SongFields {
    let stem = path
        .file_stem()
        .map(|value| value.to_string_lossy().to_string())
        .unwrap_or_default();
    let (derived_artist, derived_title) = split_stem(&stem);

    SongFields {
        title: data.tags.get("title").cloned().unwrap_or(derived_title),
        artist: data.tags.get("artist").cloned().unwrap_or(derived_artist),
        album: data.tags.get("album").cloned().unwrap_or_default(),
        duration_ms: duration_to_ms(data.duration_secs),
    }
}

/// Best guess from an "Artist - Title" file stem when tags are missing.
/// Without the separator the whole stem is the title and the artist stays
/// empty.
fn split_stem(stem: &str) -> (String, String) {
    match stem.split_once(" - ") {
        Some((artist, title)) => (artist.trim().to_string(), title.trim().to_string()),
        None => (String::new(), stem.trim().to_string()),
    }
}

fn duration_to_ms(secs: f64) -> u64 {
    if secs <= 0.0 {
        return 0;
    }
    (secs * 1000.0).round() as u64
}

fn prune_missing(catalog: &dyn CatalogStore) -> u64 {
    let files = match catalog.list_files() {
        Ok(files) => files,
        Err(err) => {
            warn!("Prune sweep failed to list catalog: {}", err);
            return 0;
        }
    };

    let mut pruned = 0u64;
    for file in files {
        if Path::new(&file).exists() {
            continue;
        }
        match catalog.remove(&file) {
            Ok(()) => {
                info!("Pruned missing file from catalog: {}", file);
                pruned += 1;
            }
            Err(err) => warn!("Failed to prune {}: {}", file, err),
        }
    }
    pruned
}
