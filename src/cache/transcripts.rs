// Transcript cache: keyed text blobs from audio transcription
//
// Keys hash the exact extraction parameters, so any change in the window or
// language recomputes rather than reusing a stale transcript.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Cache key parameters. Hashed together into the blob filename.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptKey<'a> {
    pub source_hash: &'a str,
    pub audio_index: u32,
    pub start_seconds: u32,
    pub duration_seconds: u32,
    pub language: &'a str,
}

impl TranscriptKey<'_> {
    fn digest(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.source_hash.as_bytes());
        hasher.update(&self.audio_index.to_le_bytes());
        hasher.update(&self.start_seconds.to_le_bytes());
        hasher.update(&self.duration_seconds.to_le_bytes());
        hasher.update(self.language.as_bytes());
        hasher.finalize().to_hex().to_string()
    }
}

pub struct TranscriptCache {
    dir: PathBuf,
}

impl TranscriptCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn blob_path(&self, key: &TranscriptKey) -> PathBuf {
        self.dir.join(format!("{}.txt", key.digest()))
    }

    /// Best-effort read; a miss or unreadable blob returns `None`.
    pub fn get(&self, key: &TranscriptKey) -> Option<String> {
        fs::read_to_string(self.blob_path(key)).ok()
    }

    pub fn put(&self, key: &TranscriptKey, transcript: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.blob_path(key), transcript)?;
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_miss_then_hit() {
        let tmp = TempDir::new().unwrap();
        let cache = TranscriptCache::new(tmp.path());
        let key = TranscriptKey {
            source_hash: "abc123",
            audio_index: 1,
            start_seconds: 300,
            duration_seconds: 60,
            language: "en",
        };

        assert!(cache.get(&key).is_none());
        cache.put(&key, "commentary by the director").unwrap();
        assert_eq!(cache.get(&key).as_deref(), Some("commentary by the director"));
    }

    #[test]
    fn test_distinct_parameters_distinct_keys() {
        let tmp = TempDir::new().unwrap();
        let cache = TranscriptCache::new(tmp.path());
        let a = TranscriptKey {
            source_hash: "abc123",
            audio_index: 1,
            start_seconds: 300,
            duration_seconds: 60,
            language: "en",
        };
        let b = TranscriptKey { audio_index: 2, ..a.clone() };

        cache.put(&a, "track one").unwrap();
        assert!(cache.get(&b).is_none());
    }
}
