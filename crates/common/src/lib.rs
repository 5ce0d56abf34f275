use std::path::Path;

use serde::{Deserialize, Serialize};

/// One catalog entry per source file. `file` is the upsert key; `id` is
/// assigned on first insert and preserved across re-probes of the same file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Song {
    pub id: String,
    pub file: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub artist: String,
    #[serde(default)]
    pub album: String,
    #[serde(default)]
    pub duration_ms: u64,
}

/// Fields written by an upsert. The store fills in `id` and `file`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SongFields {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub duration_ms: u64,
}

pub fn stable_id(input: &str) -> String {
    blake3::hash(input.as_bytes()).to_hex().to_string()
}

pub fn path_to_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

/// Lower-cased whitespace tokens of a string, used both by the catalog's
/// text index and the search engine's overlap scoring.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace()
        .filter(|part| !part.is_empty())
        .map(|part| part.to_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{stable_id, tokenize};

    #[test]
    fn stable_id_is_deterministic() {
        let first = stable_id("/music/Artist - Track.mp3");
        let second = stable_id("/music/Artist - Track.mp3");
        assert_eq!(first, second);
        assert_ne!(first, stable_id("/music/Artist - Other.mp3"));
    }

    #[test]
    fn tokenize_lowercases_and_splits() {
        let tokens = tokenize("Summer  Remix\tDJ X");
        assert_eq!(tokens, vec!["summer", "remix", "dj", "x"]);
    }

    #[test]
    fn tokenize_empty_input() {
        assert!(tokenize("   ").is_empty());
    }
}
