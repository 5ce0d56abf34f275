//! In-memory stand-ins for the collaborator ports, shared by the unit
//! tests. No real store, prober, or subprocess is involved.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use catalog::{CatalogError, CatalogStore};
use common::{stable_id, tokenize, Song, SongFields};
use metadata::{ProbeData, ProbeError, Prober};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::BackendConfig;
use crate::encode::{EncodeError, EncodeJob, EncodeTarget, Encoder, SourceStream};
use crate::state::BackendState;

pub(crate) struct MemoryCatalog {
    songs: Mutex<HashMap<String, Song>>,
}

impl MemoryCatalog {
    pub(crate) fn new() -> Self {
        Self {
            songs: Mutex::new(HashMap::new()),
        }
    }
}

impl CatalogStore for MemoryCatalog {
    fn upsert(&self, file: &str, fields: &SongFields) -> Result<Song, CatalogError> {
        let mut songs = self.songs.lock();
        let id = songs
            .get(file)
            .map(|song| song.id.clone())
            .unwrap_or_else(|| stable_id(file));
        let song = Song {
            id,
            file: file.to_string(),
            title: fields.title.clone(),
            artist: fields.artist.clone(),
            album: fields.album.clone(),
            duration_ms: fields.duration_ms,
        };
        songs.insert(file.to_string(), song.clone());
        Ok(song)
    }

    fn find_by_id(&self, id: &str) -> Result<Option<Song>, CatalogError> {
        Ok(self
            .songs
            .lock()
            .values()
            .find(|song| song.id == id)
            .cloned())
    }

    fn text_search(&self, terms: &str) -> Result<Vec<Song>, CatalogError> {
        let query: HashSet<String> = tokenize(terms).into_iter().collect();
        Ok(self
            .songs
            .lock()
            .values()
            .filter(|song| {
                let mut words = HashSet::new();
                for field in [&song.title, &song.artist, &song.album] {
                    words.extend(tokenize(field));
                }
                query.iter().any(|token| words.contains(token))
            })
            .cloned()
            .collect())
    }

    fn remove(&self, file: &str) -> Result<(), CatalogError> {
        self.songs.lock().remove(file);
        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>, CatalogError> {
        let mut files: Vec<String> = self.songs.lock().keys().cloned().collect();
        files.sort();
        Ok(files)
    }
}

pub(crate) struct FakeProber {
    files: Mutex<HashMap<String, ProbeData>>,
}

impl FakeProber {
    pub(crate) fn new() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn add(&self, path: &str, format: &str, duration_secs: f64, tags: &[(&str, &str)]) {
        let mut data = ProbeData {
            format_name: format.to_string(),
            duration_secs,
            ..ProbeData::default()
        };
        for (key, value) in tags {
            data.tags.insert(key.to_string(), value.to_string());
        }
        self.files.lock().insert(path.to_string(), data);
    }
}

impl Prober for FakeProber {
    fn probe(&self, path: &Path) -> Result<ProbeData, ProbeError> {
        self.files
            .lock()
            .get(path.to_string_lossy().as_ref())
            .cloned()
            .ok_or_else(|| {
                ProbeError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "not probeable",
                ))
            })
    }
}

/// Scripted encoder: emits the configured chunks, then either closes the
/// stream or, in hanging mode, stays open until killed.
pub(crate) struct FakeEncoder {
    starts: AtomicUsize,
    script: Mutex<Vec<Result<Bytes, EncodeError>>>,
    hang_after_script: bool,
}

impl FakeEncoder {
    pub(crate) fn new(script: Vec<Result<Bytes, EncodeError>>) -> Self {
        Self {
            starts: AtomicUsize::new(0),
            script: Mutex::new(script),
            hang_after_script: false,
        }
    }

    pub(crate) fn hanging(script: Vec<Result<Bytes, EncodeError>>) -> Self {
        Self {
            starts: AtomicUsize::new(0),
            script: Mutex::new(script),
            hang_after_script: true,
        }
    }

    pub(crate) fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
}

impl Encoder for FakeEncoder {
    fn start(
        &self,
        _source: SourceStream,
        _target: &EncodeTarget,
    ) -> Result<EncodeJob, EncodeError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let script = self.script.lock().clone();
        let hang = self.hang_after_script;
        let cancel = CancellationToken::new();
        let job_cancel = cancel.clone();
        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            for item in script {
                if tx.send(item).await.is_err() {
                    return;
                }
            }
            if hang {
                job_cancel.cancelled().await;
            }
        });
        Ok(EncodeJob { chunks: rx, cancel })
    }
}

pub(crate) fn test_state_with<C: CatalogStore + 'static, P: Prober + 'static>(
    catalog: Arc<C>,
    prober: Arc<P>,
) -> BackendState {
    let mut config = BackendConfig::default();
    config.concurrent_probes = 2;
    BackendState::new(
        config,
        PathBuf::from("file-backend.yaml"),
        catalog,
        prober,
    )
}
