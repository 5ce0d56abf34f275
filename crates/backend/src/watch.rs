use std::path::PathBuf;
use std::sync::Arc;

use common::path_to_key;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use crate::scan::probe_and_upsert;
use crate::state::BackendState;

/// Starts the post-scan incremental watch. The watcher handle lives in
/// backend state; dropping it ends the subscription, so it stays there for
/// the life of the instance.
pub fn configure_watcher(state: &BackendState, root: PathBuf) {
    let config = state.config.read().clone();
    if !config.watch_music {
        info!("Watcher disabled (watch_music=false)");
        *state.watcher.write() = None;
        return;
    }

    match setup_watcher(state.clone(), root.clone()) {
        Ok(watcher) => {
            info!("Watching {} for changes", root.display());
            *state.watcher.write() = Some(watcher);
        }
        Err(err) => {
            warn!("Failed to start watcher: {}", err);
            *state.watcher.write() = None;
        }
    }
}

fn setup_watcher(
    state: BackendState,
    root: PathBuf,
) -> Result<RecommendedWatcher, Box<dyn std::error::Error>> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Event>();
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        },
        NotifyConfig::default(),
    )?;

    watcher.watch(&root, RecursiveMode::Recursive)?;

    tokio::spawn(async move {
        watch_loop(state, rx).await;
    });

    Ok(watcher)
}

async fn watch_loop(state: BackendState, mut rx: UnboundedReceiver<Event>) {
    while let Some(event) = rx.recv().await {
        if !is_relevant_event(&event) {
            continue;
        }
        for path in event.paths {
            apply_path_event(&state, path).await;
        }
    }
}

/// Resolves one notification: re-probe the path if it still exists, drop
/// its record otherwise. Post-startup event volume is low, so this runs
/// outside the bounded probe pool. Failures are logged and never end the
/// subscription.
pub(crate) async fn apply_path_event(state: &BackendState, path: PathBuf) {
    let exists = tokio::fs::metadata(&path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false);

    let catalog = Arc::clone(&state.catalog);
    if exists {
        debug!("{} modified or created, probing", path.display());
        let prober = Arc::clone(&state.prober);
        let formats = state.config.read().import_formats.clone();
        let result = tokio::task::spawn_blocking(move || {
            probe_and_upsert(catalog.as_ref(), prober.as_ref(), &formats, &path)
        })
        .await;
        if let Err(err) = result {
            warn!("Watcher probe join error: {}", err);
        }
    } else {
        let file = path_to_key(&path);
        let log_file = file.clone();
        let result = tokio::task::spawn_blocking(move || catalog.remove(&file)).await;
        match result {
            Ok(Ok(())) => debug!("{} deleted from catalog", log_file),
            Ok(Err(err)) => warn!("Failed to remove {} from catalog: {}", log_file, err),
            Err(err) => warn!("Watcher remove join error: {}", err),
        }
    }
}

fn is_relevant_event(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

#[cfg(test)]
mod tests {
    use super::apply_path_event;
    use crate::testing::{test_state_with, FakeProber, MemoryCatalog};
    use catalog::CatalogStore;
    use common::SongFields;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn created_file_is_probed_and_upserted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("New Artist - New Song.mp3");
        std::fs::write(&path, b"mp3").unwrap();

        let catalog = Arc::new(MemoryCatalog::new());
        let prober = Arc::new(FakeProber::new());
        prober.add(path.to_str().unwrap(), "mp3", 2.0, &[]);
        let state = test_state_with(Arc::clone(&catalog), prober);

        apply_path_event(&state, path.clone()).await;

        let files = catalog.list_files().unwrap();
        assert_eq!(files, vec![path.to_string_lossy().to_string()]);
    }

    #[tokio::test]
    async fn deleted_file_is_removed_from_catalog() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gone.mp3");

        let catalog = Arc::new(MemoryCatalog::new());
        catalog
            .upsert(&path.to_string_lossy(), &SongFields::default())
            .unwrap();
        let state = test_state_with(Arc::clone(&catalog), Arc::new(FakeProber::new()));

        apply_path_event(&state, path).await;

        assert!(catalog.list_files().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unresolvable_event_leaves_catalog_intact() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog
            .upsert("/music/kept.mp3", &SongFields::default())
            .unwrap();
        let state = test_state_with(Arc::clone(&catalog), Arc::new(FakeProber::new()));

        // never-indexed path vanishing is a no-op
        apply_path_event(&state, "/music/never-indexed.mp3".into()).await;

        assert_eq!(catalog.list_files().unwrap().len(), 1);
    }
}
