use std::collections::HashMap;
use std::path::Path;

use lofty::error::LoftyError;
use lofty::file::FileType;
use lofty::prelude::{AudioFile, ItemKey, TaggedFileExt};

/// Container metadata for a single audio file. Tag keys are lower-cased
/// here, at the extraction boundary; source tag casing is inconsistent
/// across encoders.
#[derive(Debug, Default, Clone)]
pub struct ProbeData {
    pub format_name: String,
    pub tags: HashMap<String, String>,
    pub duration_secs: f64,
}

#[derive(Debug)]
pub enum ProbeError {
    Io(std::io::Error),
    Lofty(LoftyError),
}

impl std::fmt::Display for ProbeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeError::Io(err) => write!(f, "io error: {}", err),
            ProbeError::Lofty(err) => write!(f, "probe error: {}", err),
        }
    }
}

impl std::error::Error for ProbeError {}

impl From<std::io::Error> for ProbeError {
    fn from(err: std::io::Error) -> Self {
        ProbeError::Io(err)
    }
}

impl From<LoftyError> for ProbeError {
    fn from(err: LoftyError) -> Self {
        ProbeError::Lofty(err)
    }
}

/// Extraction port. The default implementation reads with lofty; tests
/// substitute a fake so no real files are needed.
pub trait Prober: Send + Sync {
    fn probe(&self, path: &Path) -> Result<ProbeData, ProbeError>;
}

pub struct LoftyProber;

impl Prober for LoftyProber {
    fn probe(&self, path: &Path) -> Result<ProbeData, ProbeError> {
        let tagged_file = lofty::read_from_path(path)?;
        let properties = tagged_file.properties();

        let mut data = ProbeData {
            format_name: format_name(tagged_file.file_type()).to_string(),
            duration_secs: properties.duration().as_secs_f64(),
            ..ProbeData::default()
        };

        if let Some(tag) = tagged_file.primary_tag().or_else(|| tagged_file.first_tag()) {
            for (key, item_key) in [
                ("title", ItemKey::TrackTitle),
                ("artist", ItemKey::TrackArtist),
                ("album", ItemKey::AlbumTitle),
                ("albumartist", ItemKey::AlbumArtist),
                ("genre", ItemKey::Genre),
                ("comment", ItemKey::Comment),
            ] {
                if let Some(value) = tag.get_string(&item_key) {
                    data.tags.insert(key.to_string(), value.to_string());
                }
            }
        }

        Ok(data)
    }
}

fn format_name(file_type: FileType) -> &'static str {
    match file_type {
        FileType::Mpeg => "mp3",
        FileType::Flac => "flac",
        FileType::Vorbis => "ogg",
        FileType::Opus => "opus",
        FileType::Aac => "aac",
        FileType::Mp4 => "mp4",
        FileType::Wav => "wav",
        FileType::Aiff => "aiff",
        FileType::Ape => "ape",
        FileType::Mpc => "mpc",
        FileType::Speex => "spx",
        FileType::WavPack => "wv",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::{format_name, FileType};

    #[test]
    fn maps_importable_formats() {
        assert_eq!(format_name(FileType::Mpeg), "mp3");
        assert_eq!(format_name(FileType::Flac), "flac");
        assert_eq!(format_name(FileType::Vorbis), "ogg");
        assert_eq!(format_name(FileType::Opus), "opus");
    }
}
