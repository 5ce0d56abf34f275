//! File-library backend: indexes a directory tree of audio files into a
//! searchable catalog and serves playable audio by transcoding sources
//! into a cached opus artifact on demand.

pub mod cache;
pub mod config;
pub mod encode;
pub mod scan;
pub mod search;
pub mod state;
pub mod watch;

#[cfg(test)]
pub(crate) mod testing;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use catalog::{CatalogError, CatalogStore, RedbCatalog};
use metadata::{LoftyProber, Prober};
use tracing::{info, warn};

pub use cache::{PrepareError, PrepareEvent, PrepareHandle, TranscodeCache};
pub use config::{
    config_path_from_env, load_or_create_config, resolve_music_root, resolve_path, BackendConfig,
    ConfigError,
};
pub use encode::{EncodeError, EncodeJob, EncodeTarget, Encoder, FfmpegEncoder, SourceStream};
pub use scan::{scan_root, start_index, ScanSummary};
pub use search::{search, SearchEntry};
pub use state::{BackendState, ScanStatus};

pub const BACKEND_NAME: &str = "file";
pub const OUTPUT_FORMAT: &str = "opus";

pub struct FileBackend {
    state: BackendState,
    cache: Arc<TranscodeCache>,
}

impl FileBackend {
    /// Wires the default collaborators: redb catalog, lofty prober, ffmpeg
    /// encoder. Writes a sample config file on first run.
    pub fn init(config_path: &Path) -> Result<Self, BackendError> {
        let (config, created) = load_or_create_config(config_path)?;
        if created {
            info!("Created default config at {:?}", config_path);
        } else {
            info!("Loaded config from {:?}", config_path);
        }

        let catalog_path = resolve_path(config_path, &config.catalog_path);
        let catalog: Arc<dyn CatalogStore> = Arc::new(RedbCatalog::open(&catalog_path)?);
        Self::with_parts(
            config,
            config_path.to_path_buf(),
            catalog,
            Arc::new(LoftyProber),
            Arc::new(FfmpegEncoder::default()),
        )
    }

    /// Assembles a backend from explicit collaborator ports.
    pub fn with_parts(
        config: BackendConfig,
        config_path: PathBuf,
        catalog: Arc<dyn CatalogStore>,
        prober: Arc<dyn Prober>,
        encoder: Arc<dyn Encoder>,
    ) -> Result<Self, BackendError> {
        let cache_root = resolve_path(&config_path, &config.cache_path);
        let state = BackendState::new(config, config_path, catalog, prober);
        let cache = Arc::new(TranscodeCache::new(
            cache_root,
            Arc::clone(&state.catalog),
            encoder,
        )?);
        Ok(Self { state, cache })
    }

    pub fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    pub fn state(&self) -> &BackendState {
        &self.state
    }

    pub fn scan_status(&self) -> ScanStatus {
        self.state.scan_status.read().clone()
    }

    /// Starts the background index of the configured music root (or
    /// resumes from the existing catalog) and arms the watcher once the
    /// scan completes.
    pub fn start(&self) {
        let config = self.state.config.read().clone();
        match resolve_music_root(&self.state.config_path, &config.music_root) {
            Some(root) if root.exists() => start_index(self.state.clone(), root, false),
            Some(root) => {
                warn!("Music directory {} not found", root.display());
                *self.state.scan_status.write() = ScanStatus::Missing(root);
            }
            None => info!("Music directory not configured"),
        }
    }

    pub fn rescan(&self) {
        let config = self.state.config.read().clone();
        if let Some(root) = resolve_music_root(&self.state.config_path, &config.music_root) {
            start_index(self.state.clone(), root, true);
        }
    }

    pub async fn search(&self, terms: &str) -> Result<Vec<SearchEntry>, CatalogError> {
        search::search(&self.state, terms).await
    }

    pub fn prepare(&self, song_id: &str) -> PrepareHandle {
        self.cache.prepare(song_id)
    }

    pub fn is_prepared(&self, song_id: &str) -> bool {
        self.cache.is_prepared(song_id)
    }
}

#[derive(Debug)]
pub enum BackendError {
    Config(ConfigError),
    Catalog(CatalogError),
    Io(std::io::Error),
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendError::Config(err) => write!(f, "config error: {}", err),
            BackendError::Catalog(err) => write!(f, "catalog error: {}", err),
            BackendError::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

impl std::error::Error for BackendError {}

impl From<ConfigError> for BackendError {
    fn from(err: ConfigError) -> Self {
        BackendError::Config(err)
    }
}

impl From<CatalogError> for BackendError {
    fn from(err: CatalogError) -> Self {
        BackendError::Catalog(err)
    }
}

impl From<std::io::Error> for BackendError {
    fn from(err: std::io::Error) -> Self {
        BackendError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeEncoder, FakeProber, MemoryCatalog};
    use bytes::Bytes;
    use tempfile::TempDir;

    #[tokio::test]
    async fn imports_searches_and_prepares_end_to_end() {
        let dir = TempDir::new().unwrap();
        let music = dir.path().join("music");
        std::fs::create_dir(&music).unwrap();
        let track = music.join("DJ X - Summer Remix.mp3");
        std::fs::write(&track, b"mp3 bytes").unwrap();
        std::fs::write(music.join("notes.txt"), b"not audio").unwrap();

        let catalog = Arc::new(MemoryCatalog::new());
        let prober = Arc::new(FakeProber::new());
        prober.add(track.to_str().unwrap(), "mp3", 212.0, &[]);
        let encoder = Arc::new(FakeEncoder::new(vec![Ok(Bytes::from_static(b"opus!"))]));

        let mut config = BackendConfig::default();
        config.music_root = music.to_string_lossy().to_string();
        config.cache_path = dir.path().join("cache").to_string_lossy().to_string();

        let backend = FileBackend::with_parts(
            config,
            dir.path().join("file-backend.yaml"),
            Arc::clone(&catalog) as Arc<dyn CatalogStore>,
            prober,
            encoder,
        )
        .unwrap();

        let summary = scan::scan_root(backend.state(), music.clone()).await;
        assert_eq!(summary.scanned, 2);
        assert_eq!(summary.upserted, 1);

        // filename-derived artist is searchable
        let results = backend.search("DJ").await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].artist, "DJ X");
        assert_eq!(results[0].title, "Summer Remix");
        assert_eq!(results[0].duration_ms, 212_000);
        let song_id = results[0].song_id.clone();

        assert!(!backend.is_prepared(&song_id));
        backend.prepare(&song_id).wait().await.unwrap();
        assert!(backend.is_prepared(&song_id));
    }
}
