use std::collections::HashSet;
use std::sync::Arc;

use catalog::CatalogError;
use common::{tokenize, Song};
use serde::Serialize;

use crate::state::BackendState;
use crate::{BACKEND_NAME, OUTPUT_FORMAT};

/// Read-only projection of a catalog record. `format` reflects the cache's
/// encoding target, not the source file's container.
#[derive(Clone, Debug, Serialize)]
pub struct SearchEntry {
    pub song_id: String,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub duration_ms: u64,
    pub score: u32,
    pub backend_name: &'static str,
    pub format: &'static str,
}

pub async fn search(state: &BackendState, terms: &str) -> Result<Vec<SearchEntry>, CatalogError> {
    let cap = state.config.read().search_result_count;
    let catalog = Arc::clone(&state.catalog);
    let query = terms.to_string();
    let candidates = tokio::task::spawn_blocking(move || catalog.text_search(&query))
        .await
        .map_err(|err| {
            CatalogError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                err.to_string(),
            ))
        })??;
    Ok(rank_candidates(terms, candidates, cap))
}

/// Secondary relevance pass over the store's candidate set: count query
/// tokens present in the candidate's own token set, sort descending,
/// truncate. The store's index already did the broad matching.
pub fn rank_candidates(terms: &str, candidates: Vec<Song>, cap: usize) -> Vec<SearchEntry> {
    let query = tokenize(terms);

    let mut scored: Vec<(u32, Song)> = candidates
        .into_iter()
        .map(|song| {
            let mut words: HashSet<String> = HashSet::new();
            for field in [&song.title, &song.artist, &song.album] {
                words.extend(tokenize(field));
            }
            let matches = query.iter().filter(|token| words.contains(*token)).count() as u32;
            (matches, song)
        })
        .collect();

    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored.truncate(cap);

    let denominator = query.len().max(1) as u32;
    scored
        .into_iter()
        .map(|(matches, song)| SearchEntry {
            song_id: song.id,
            title: song.title,
            artist: song.artist,
            album: song.album,
            duration_ms: song.duration_ms,
            score: matches * 100 / denominator,
            backend_name: BACKEND_NAME,
            format: OUTPUT_FORMAT,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{rank_candidates, search};
    use crate::testing::{test_state_with, FakeProber, MemoryCatalog};
    use catalog::CatalogStore;
    use common::{Song, SongFields};
    use std::sync::Arc;

    fn song(id: &str, title: &str, artist: &str, album: &str) -> Song {
        Song {
            id: id.to_string(),
            file: format!("/music/{}.mp3", id),
            title: title.to_string(),
            artist: artist.to_string(),
            album: album.to_string(),
            duration_ms: 200_000,
        }
    }

    #[test]
    fn matching_token_outranks_zero_matches() {
        let candidates = vec![
            song("a", "Quiet Morning", "Someone", ""),
            song("b", "Summer Remix", "DJ X", ""),
        ];
        let results = rank_candidates("Remix", candidates, 10);

        assert_eq!(results[0].song_id, "b");
        assert!(results[0].score >= 1);
        assert_eq!(results[1].score, 0);
        assert_eq!(results[0].backend_name, "file");
        assert_eq!(results[0].format, "opus");
    }

    #[test]
    fn score_counts_exact_tokens_not_substrings() {
        let candidates = vec![song("a", "Remixes", "Someone", "")];
        let results = rank_candidates("Remix", candidates, 10);
        assert_eq!(results[0].score, 0);
    }

    #[test]
    fn score_is_normalized_to_matched_share() {
        let candidates = vec![song("a", "Summer Remix", "DJ X", "")];
        let results = rank_candidates("summer remix dj x", candidates, 10);
        assert_eq!(results[0].score, 100);

        let results = rank_candidates("summer nothing", vec![song("a", "Summer Remix", "DJ X", "")], 10);
        assert_eq!(results[0].score, 50);
    }

    #[test]
    fn results_never_exceed_cap() {
        let candidates = (0..20)
            .map(|i| song(&format!("s{}", i), "Remix", "Artist", ""))
            .collect();
        let results = rank_candidates("remix", candidates, 5);
        assert_eq!(results.len(), 5);
    }

    #[tokio::test]
    async fn search_queries_store_and_ranks() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog
            .upsert(
                "/music/summer.mp3",
                &SongFields {
                    title: "Summer Remix".to_string(),
                    artist: "DJ X".to_string(),
                    album: String::new(),
                    duration_ms: 180_000,
                },
            )
            .unwrap();
        catalog
            .upsert(
                "/music/other.mp3",
                &SongFields {
                    title: "Album Cut".to_string(),
                    artist: "Someone".to_string(),
                    album: "Remix Collection".to_string(),
                    duration_ms: 120_000,
                },
            )
            .unwrap();

        let state = test_state_with(Arc::clone(&catalog), Arc::new(FakeProber::new()));
        let results = search(&state, "Remix").await.unwrap();

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|entry| entry.score >= 1));
        assert_eq!(results[0].format, "opus");
    }
}
