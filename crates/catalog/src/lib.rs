use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use common::{stable_id, tokenize, Song, SongFields};
use redb::{
    CommitError, Database, DatabaseError, ReadableTable, StorageError, TableDefinition, TableError,
    TransactionError, WriteTransaction,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

const CATALOG_VERSION: u32 = 1;
const KEY_SEP: char = '\x1f';

const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");
const SONGS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("songs");
const SONG_FILES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("song_files");
const TEXT_INDEX_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("text_index");

const META_VERSION_KEY: &str = "version";

/// Narrow store interface the pipeline is written against. `upsert` is
/// keyed by `file`: insert if absent, otherwise overwrite every field
/// except `id`. Each operation is independently atomic; callers get no
/// ordering guarantees across concurrent upserts for the same key.
pub trait CatalogStore: Send + Sync {
    fn upsert(&self, file: &str, fields: &SongFields) -> Result<Song, CatalogError>;
    fn find_by_id(&self, id: &str) -> Result<Option<Song>, CatalogError>;
    fn text_search(&self, terms: &str) -> Result<Vec<Song>, CatalogError>;
    fn remove(&self, file: &str) -> Result<(), CatalogError>;
    fn list_files(&self) -> Result<Vec<String>, CatalogError>;
}

#[derive(Clone)]
pub struct RedbCatalog {
    db: Arc<Database>,
}

impl RedbCatalog {
    pub fn open(path: &Path) -> Result<Self, CatalogError> {
        let db = open_or_create_db(path)?;
        let catalog = Self { db: Arc::new(db) };
        match catalog.read_version()? {
            Some(version) if version == CATALOG_VERSION => {}
            Some(version) => {
                warn!("Catalog version mismatch ({}); resetting", version);
                catalog.reset()?;
            }
            None => catalog.reset()?,
        }
        Ok(catalog)
    }

    fn read_version(&self) -> Result<Option<u32>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let table = match read_txn.open_table(META_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let version = match table.get(META_VERSION_KEY)? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(version)
    }

    fn reset(&self) -> Result<(), CatalogError> {
        let write_txn = self.db.begin_write()?;
        clear_table(&write_txn, SONGS_TABLE)?;
        clear_table(&write_txn, SONG_FILES_TABLE)?;
        clear_table(&write_txn, TEXT_INDEX_TABLE)?;
        {
            let mut meta = write_txn.open_table(META_TABLE)?;
            let bytes = encode_value(&CATALOG_VERSION)?;
            meta.insert(META_VERSION_KEY, bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

impl CatalogStore for RedbCatalog {
    fn upsert(&self, file: &str, fields: &SongFields) -> Result<Song, CatalogError> {
        let write_txn = self.db.begin_write()?;
        let song = {
            let mut songs = write_txn.open_table(SONGS_TABLE)?;
            let mut files = write_txn.open_table(SONG_FILES_TABLE)?;
            let mut index = write_txn.open_table(TEXT_INDEX_TABLE)?;

            let existing: Option<Song> = match songs.get(file)? {
                Some(value) => Some(decode_value(value.value())?),
                None => None,
            };
            if let Some(old) = &existing {
                remove_tokens(&mut index, old)?;
            }

            let id = existing
                .map(|old| old.id)
                .unwrap_or_else(|| stable_id(file));
            let song = Song {
                id: id.clone(),
                file: file.to_string(),
                title: fields.title.clone(),
                artist: fields.artist.clone(),
                album: fields.album.clone(),
                duration_ms: fields.duration_ms,
            };

            let bytes = encode_value(&song)?;
            songs.insert(file, bytes.as_slice())?;
            files.insert(id.as_str(), file.as_bytes())?;
            insert_tokens(&mut index, &song)?;
            song
        };
        write_txn.commit()?;
        Ok(song)
    }

    fn find_by_id(&self, id: &str) -> Result<Option<Song>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let files = match read_txn.open_table(SONG_FILES_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let file = match files.get(id)? {
            Some(value) => String::from_utf8_lossy(value.value()).to_string(),
            None => return Ok(None),
        };
        let songs = read_txn.open_table(SONGS_TABLE)?;
        let song = match songs.get(file.as_str())? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(song)
    }

    fn text_search(&self, terms: &str) -> Result<Vec<Song>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let index = match read_txn.open_table(TEXT_INDEX_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let songs = match read_txn.open_table(SONGS_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut seen = HashSet::new();
        let mut matched_files = Vec::new();
        for token in tokenize(terms) {
            let prefix = format!("{}{}", token, KEY_SEP);
            let mut end = prefix.clone();
            end.push('\u{10ffff}');
            for entry in index.range(prefix.as_str()..end.as_str())? {
                let entry = entry?;
                let key = entry.0.value();
                let (_, file) = split_key_last(key)?;
                if seen.insert(file.to_string()) {
                    matched_files.push(file.to_string());
                }
            }
        }

        let mut items = Vec::with_capacity(matched_files.len());
        for file in matched_files {
            if let Some(value) = songs.get(file.as_str())? {
                items.push(decode_value(value.value())?);
            }
        }
        Ok(items)
    }

    fn remove(&self, file: &str) -> Result<(), CatalogError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut songs = write_txn.open_table(SONGS_TABLE)?;
            let mut files = write_txn.open_table(SONG_FILES_TABLE)?;
            let mut index = write_txn.open_table(TEXT_INDEX_TABLE)?;

            let existing: Option<Song> = match songs.remove(file)? {
                Some(value) => Some(decode_value(value.value())?),
                None => None,
            };
            if let Some(song) = existing {
                files.remove(song.id.as_str())?;
                remove_tokens(&mut index, &song)?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>, CatalogError> {
        let read_txn = self.db.begin_read()?;
        let songs = match read_txn.open_table(SONGS_TABLE) {
            Ok(table) => table,
            Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut out = Vec::new();
        for entry in songs.iter()? {
            let entry = entry?;
            out.push(entry.0.value().to_string());
        }
        Ok(out)
    }
}

fn song_tokens(song: &Song) -> HashSet<String> {
    let mut tokens = HashSet::new();
    for field in [&song.title, &song.artist, &song.album] {
        tokens.extend(tokenize(field));
    }
    tokens
}

fn insert_tokens(
    index: &mut redb::Table<'_, '_, &'static str, &'static [u8]>,
    song: &Song,
) -> Result<(), CatalogError> {
    let empty: &[u8] = &[];
    for token in song_tokens(song) {
        let key = format!("{}{}{}", token, KEY_SEP, song.file);
        index.insert(key.as_str(), empty)?;
    }
    Ok(())
}

fn remove_tokens(
    index: &mut redb::Table<'_, '_, &'static str, &'static [u8]>,
    song: &Song,
) -> Result<(), CatalogError> {
    for token in song_tokens(song) {
        let key = format!("{}{}{}", token, KEY_SEP, song.file);
        index.remove(key.as_str())?;
    }
    Ok(())
}

fn split_key_last(key: &str) -> Result<(&str, &str), CatalogError> {
    key.rsplit_once(KEY_SEP)
        .ok_or_else(|| CatalogError::KeyParse(key.to_string()))
}

fn open_or_create_db(path: &Path) -> Result<Database, CatalogError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    if path.exists() {
        Ok(Database::open(path)?)
    } else {
        Ok(Database::create(path)?)
    }
}

fn clear_table(
    write_txn: &WriteTransaction,
    table: TableDefinition<&'static str, &'static [u8]>,
) -> Result<(), CatalogError> {
    write_txn.delete_table(table)?;
    write_txn.open_table(table)?;
    Ok(())
}

fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, CatalogError> {
    Ok(bincode::serialize(value)?)
}

fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CatalogError> {
    Ok(bincode::deserialize(bytes)?)
}

#[derive(Debug)]
pub enum CatalogError {
    Io(std::io::Error),
    Redb(redb::Error),
    Bincode(Box<bincode::ErrorKind>),
    KeyParse(String),
}

impl std::fmt::Display for CatalogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CatalogError::Io(err) => write!(f, "io error: {}", err),
            CatalogError::Redb(err) => write!(f, "db error: {}", err),
            CatalogError::Bincode(err) => write!(f, "bincode error: {}", err),
            CatalogError::KeyParse(value) => write!(f, "key parse error: {}", value),
        }
    }
}

impl std::error::Error for CatalogError {}

impl From<std::io::Error> for CatalogError {
    fn from(err: std::io::Error) -> Self {
        CatalogError::Io(err)
    }
}

impl From<redb::Error> for CatalogError {
    fn from(err: redb::Error) -> Self {
        CatalogError::Redb(err)
    }
}

impl From<DatabaseError> for CatalogError {
    fn from(err: DatabaseError) -> Self {
        CatalogError::Redb(err.into())
    }
}

impl From<TableError> for CatalogError {
    fn from(err: TableError) -> Self {
        CatalogError::Redb(err.into())
    }
}

impl From<TransactionError> for CatalogError {
    fn from(err: TransactionError) -> Self {
        CatalogError::Redb(err.into())
    }
}

impl From<StorageError> for CatalogError {
    fn from(err: StorageError) -> Self {
        CatalogError::Redb(err.into())
    }
}

impl From<CommitError> for CatalogError {
    fn from(err: CommitError) -> Self {
        CatalogError::Redb(err.into())
    }
}

impl From<Box<bincode::ErrorKind>> for CatalogError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        CatalogError::Bincode(err)
    }
}
