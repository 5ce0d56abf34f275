use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use catalog::CatalogStore;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::encode::{EncodeJob, EncodeTarget, Encoder};
use crate::{BACKEND_NAME, OUTPUT_FORMAT};

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Clone, Debug)]
pub enum PrepareEvent {
    /// Another encoded chunk reached the staging file.
    Progress { bytes: u64 },
    /// The artifact is published at its final path.
    Done,
    Failed(PrepareError),
}

#[derive(Clone, Debug)]
pub enum PrepareError {
    NotFound,
    Canceled,
    Source(String),
    Encoder(String),
    Store(String),
    Io(String),
}

impl std::fmt::Display for PrepareError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrepareError::NotFound => write!(f, "song not found in catalog"),
            PrepareError::Canceled => write!(f, "canceled"),
            PrepareError::Source(err) => write!(f, "source error: {}", err),
            PrepareError::Encoder(err) => write!(f, "encoder error: {}", err),
            PrepareError::Store(err) => write!(f, "store error: {}", err),
            PrepareError::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

impl std::error::Error for PrepareError {}

/// Observable, cancellable handle on one prepare job. Cancelling is
/// idempotent; after the job reaches a terminal state it is a no-op.
pub struct PrepareHandle {
    song_id: String,
    events: broadcast::Receiver<PrepareEvent>,
    cancel: CancellationToken,
}

impl PrepareHandle {
    pub fn song_id(&self) -> &str {
        &self.song_id
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn next_event(&mut self) -> Option<PrepareEvent> {
        loop {
            match self.events.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Drives the job to its terminal event.
    pub async fn wait(mut self) -> Result<(), PrepareError> {
        while let Some(event) = self.next_event().await {
            match event {
                PrepareEvent::Progress { .. } => {}
                PrepareEvent::Done => return Ok(()),
                PrepareEvent::Failed(err) => return Err(err),
            }
        }
        Err(PrepareError::Io(
            "job ended without a terminal event".to_string(),
        ))
    }
}

struct ActiveJob {
    events: broadcast::Sender<PrepareEvent>,
    cancel: CancellationToken,
}

/// On-demand transcode cache. Artifacts live at
/// `<cache_root>/file/<song_id>.opus`; in-progress encodes write to a
/// per-song path under `file/incomplete/` and publish with a rename, so a
/// file at the final path is always complete.
pub struct TranscodeCache {
    cache_root: PathBuf,
    catalog: Arc<dyn CatalogStore>,
    encoder: Arc<dyn Encoder>,
    jobs: Mutex<HashMap<String, ActiveJob>>,
}

impl TranscodeCache {
    pub fn new(
        cache_root: PathBuf,
        catalog: Arc<dyn CatalogStore>,
        encoder: Arc<dyn Encoder>,
    ) -> Result<Self, std::io::Error> {
        fs::create_dir_all(cache_root.join(BACKEND_NAME).join("incomplete"))?;
        Ok(Self {
            cache_root,
            catalog,
            encoder,
            jobs: Mutex::new(HashMap::new()),
        })
    }

    pub fn song_path(&self, song_id: &str) -> PathBuf {
        self.cache_root
            .join(BACKEND_NAME)
            .join(format!("{}.{}", song_id, OUTPUT_FORMAT))
    }

    fn staging_path(&self, song_id: &str) -> PathBuf {
        self.cache_root
            .join(BACKEND_NAME)
            .join("incomplete")
            .join(format!("{}.{}", song_id, OUTPUT_FORMAT))
    }

    /// Pure existence check on the final path; staging files never count.
    pub fn is_prepared(&self, song_id: &str) -> bool {
        self.song_path(song_id).exists()
    }

    /// Ensures a cached artifact for `song_id` exists, reusing any job
    /// already in flight for the same song. A second caller joins the
    /// first job's event stream, and cancelling through either handle
    /// cancels the shared job.
    pub fn prepare(self: &Arc<Self>, song_id: &str) -> PrepareHandle {
        let mut jobs = self.jobs.lock();
        if let Some(job) = jobs.get(song_id) {
            debug!("Joining in-flight transcode for {}", song_id);
            return PrepareHandle {
                song_id: song_id.to_string(),
                events: job.events.subscribe(),
                cancel: job.cancel.clone(),
            };
        }

        let (events, receiver) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        if self.is_prepared(song_id) {
            let _ = events.send(PrepareEvent::Done);
            return PrepareHandle {
                song_id: song_id.to_string(),
                events: receiver,
                cancel: CancellationToken::new(),
            };
        }

        let cancel = CancellationToken::new();
        jobs.insert(
            song_id.to_string(),
            ActiveJob {
                events: events.clone(),
                cancel: cancel.clone(),
            },
        );
        drop(jobs);

        let cache = Arc::clone(self);
        let id = song_id.to_string();
        let task_cancel = cancel.clone();
        let task_events = events;
        tokio::spawn(async move {
            let outcome = cache.run_job(&id, &task_cancel, &task_events).await;
            let event = match outcome {
                Ok(()) => {
                    debug!("Transcoding ended for {}", id);
                    PrepareEvent::Done
                }
                Err(PrepareError::Canceled) => {
                    debug!("Canceled preparing {}", id);
                    PrepareEvent::Failed(PrepareError::Canceled)
                }
                Err(err) => {
                    warn!("Error while transcoding {}: {}", id, err);
                    PrepareEvent::Failed(err)
                }
            };
            // Terminal event and job-table removal happen under one lock so
            // a caller joining at the same moment never misses the outcome.
            let mut jobs = cache.jobs.lock();
            let _ = task_events.send(event);
            jobs.remove(&id);
        });

        PrepareHandle {
            song_id: song_id.to_string(),
            events: receiver,
            cancel,
        }
    }

    /// All terminal filesystem transitions for one song id run inside this
    /// single task, so at most one of {publish, delete-staging-on-error,
    /// delete-staging-on-cancel} ever executes.
    async fn run_job(
        &self,
        song_id: &str,
        cancel: &CancellationToken,
        events: &broadcast::Sender<PrepareEvent>,
    ) -> Result<(), PrepareError> {
        let catalog = Arc::clone(&self.catalog);
        let lookup_id = song_id.to_string();
        let song = tokio::task::spawn_blocking(move || catalog.find_by_id(&lookup_id))
            .await
            .map_err(|err| PrepareError::Store(err.to_string()))?
            .map_err(|err| PrepareError::Store(err.to_string()))?
            .ok_or(PrepareError::NotFound)?;

        // A cancel issued while the lookup was in flight must keep the
        // encoder from ever starting.
        if cancel.is_cancelled() {
            return Err(PrepareError::Canceled);
        }

        let source = tokio::fs::File::open(&song.file)
            .await
            .map_err(|err| PrepareError::Source(format!("{}: {}", song.file, err)))?;

        let staging = self.staging_path(song_id);
        let final_path = self.song_path(song_id);
        let mut staging_file = tokio::fs::File::create(&staging)
            .await
            .map_err(|err| PrepareError::Io(err.to_string()))?;

        debug!("Transcoding {}...", song_id);
        let mut encode_job = match self
            .encoder
            .start(Box::new(source), &EncodeTarget::default())
        {
            Ok(job) => job,
            Err(err) => {
                drop(staging_file);
                let _ = tokio::fs::remove_file(&staging).await;
                return Err(PrepareError::Encoder(err.to_string()));
            }
        };

        let pumped = pump_chunks(&mut staging_file, &mut encode_job, cancel, events).await;
        drop(staging_file);

        match pumped {
            Ok(()) => {
                if let Err(err) = tokio::fs::rename(&staging, &final_path).await {
                    let _ = tokio::fs::remove_file(&staging).await;
                    return Err(PrepareError::Io(err.to_string()));
                }
                Ok(())
            }
            Err(err) => {
                encode_job.cancel.cancel();
                let _ = tokio::fs::remove_file(&staging).await;
                Err(err)
            }
        }
    }
}

async fn pump_chunks(
    staging: &mut tokio::fs::File,
    job: &mut EncodeJob,
    cancel: &CancellationToken,
    events: &broadcast::Sender<PrepareEvent>,
) -> Result<(), PrepareError> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(PrepareError::Canceled),
            chunk = job.chunks.recv() => match chunk {
                Some(Ok(bytes)) => {
                    staging
                        .write_all(&bytes)
                        .await
                        .map_err(|err| PrepareError::Io(err.to_string()))?;
                    let _ = events.send(PrepareEvent::Progress {
                        bytes: bytes.len() as u64,
                    });
                }
                Some(Err(err)) => return Err(PrepareError::Encoder(err.to_string())),
                None => {
                    staging
                        .flush()
                        .await
                        .map_err(|err| PrepareError::Io(err.to_string()))?;
                    return Ok(());
                }
            }
        }
    }
}
