// Disc-ID cache: fingerprint -> identification result
//
// A flat JSON file of records, newest first. Best-effort on both ends:
// a miss or a read failure just means the identifier runs again.

use std::fs;
use std::io::Write;
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::constants::CACHE_TEMP_PREFIX;
use crate::error::Result;
use crate::media::MediaType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscIdRecord {
    pub disc_fingerprint: String,
    pub tmdb_id: i64,
    pub media_type: MediaType,
    pub title: String,
    pub year: Option<i32>,
    pub edition: Option<String>,
    pub season: Option<i32>,
    pub cached_at: String,
}

pub struct DiscIdCache {
    path: PathBuf,
}

impl DiscIdCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read_all(&self) -> Vec<DiscIdRecord> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(_) => return Vec::new(),
        };
        match serde_json::from_str::<Vec<DiscIdRecord>>(&raw) {
            Ok(mut records) => {
                records.sort_by(|a, b| b.cached_at.cmp(&a.cached_at));
                records
            }
            Err(e) => {
                log::warn!("Unreadable disc-ID cache at {}: {}", self.path.display(), e);
                Vec::new()
            }
        }
    }

    /// Cached identification for a fingerprint, if any.
    pub fn lookup(&self, fingerprint: &str) -> Option<DiscIdRecord> {
        self.read_all()
            .into_iter()
            .find(|r| r.disc_fingerprint == fingerprint)
    }

    /// Insert or replace the record for a fingerprint.
    pub fn store(&self, mut record: DiscIdRecord) -> Result<()> {
        if record.cached_at.is_empty() {
            record.cached_at = Utc::now().to_rfc3339();
        }
        let mut records = self.read_all();
        records.retain(|r| r.disc_fingerprint != record.disc_fingerprint);
        records.insert(0, record);

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_file_name(format!(
            "{}{}",
            CACHE_TEMP_PREFIX,
            self.path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "disc-ids.json".to_string())
        ));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(serde_json::to_string_pretty(&records)?.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// All records, newest first.
    pub fn list(&self) -> Vec<DiscIdRecord> {
        self.read_all()
    }
}
