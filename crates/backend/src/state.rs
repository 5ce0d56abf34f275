use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use catalog::CatalogStore;
use metadata::Prober;
use notify::RecommendedWatcher;
use parking_lot::RwLock;

use crate::config::BackendConfig;
use crate::scan::ScanSummary;

/// Shared state of one backend instance. Owned here rather than in module
/// globals so independent instances (and tests) never interfere.
#[derive(Clone)]
pub struct BackendState {
    pub catalog: Arc<dyn CatalogStore>,
    pub prober: Arc<dyn Prober>,
    pub config: Arc<RwLock<BackendConfig>>,
    pub config_path: PathBuf,
    pub scan_status: Arc<RwLock<ScanStatus>>,
    pub watcher: Arc<RwLock<Option<RecommendedWatcher>>>,
}

impl BackendState {
    pub fn new(
        config: BackendConfig,
        config_path: PathBuf,
        catalog: Arc<dyn CatalogStore>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        Self {
            catalog,
            prober,
            config: Arc::new(RwLock::new(config)),
            config_path,
            scan_status: Arc::new(RwLock::new(ScanStatus::Idle)),
            watcher: Arc::new(RwLock::new(None)),
        }
    }
}

#[derive(Clone, Debug)]
pub enum ScanStatus {
    Idle,
    Missing(PathBuf),
    Scanning { started: SystemTime },
    Ready(ScanSummary),
}
