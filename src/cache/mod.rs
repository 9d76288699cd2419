// Rip cache: content-addressed storage for ripped media
//
// One directory per disc fingerprint under the cache root, each with a
// `meta.json` sidecar. An entry without a readable sidecar is a partial
// (rip in progress, or corrupt) and is first in line for eviction.

pub mod discid;
pub mod transcripts;

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use filetime::FileTime;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::config::CacheConfig;
use crate::constants::{CACHE_METADATA_FILENAME, CACHE_TEMP_PREFIX};
use crate::error::{Result, SpindleError};

/// Sidecar describing a completed cache entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntryMeta {
    pub label: String,
    pub primary_file: Option<String>,
    pub size_bytes: u64,
    pub modified_at: String,
    pub video_file_count: u32,
}

/// One row of `stats()`, numbered newest-first for CLI cross-reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntrySummary {
    pub number: usize,
    pub fingerprint: String,
    pub label: String,
    pub size_bytes: u64,
    pub modified_unix: i64,
    pub has_metadata: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub max_bytes: u64,
    pub free_bytes: u64,
    pub free_ratio: f64,
    pub entry_summaries: Vec<EntrySummary>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EvictionReport {
    pub removed: usize,
    pub bytes_freed: u64,
}

#[derive(Debug, Clone)]
struct EntryState {
    fingerprint: String,
    path: PathBuf,
    size_bytes: u64,
    modified_unix: i64,
    meta: Option<CacheEntryMeta>,
}

/// Keeps an entry pinned against eviction while a rip or encode holds it.
/// Dropping the lease releases the pin.
pub struct CacheLease {
    fingerprint: String,
    leases: Arc<Mutex<HashSet<String>>>,
}

impl Drop for CacheLease {
    fn drop(&mut self) {
        if let Ok(mut leases) = self.leases.lock() {
            leases.remove(&self.fingerprint);
        }
    }
}

pub struct RipCache {
    root: PathBuf,
    max_bytes: u64,
    min_free_ratio: f64,
    leases: Arc<Mutex<HashSet<String>>>,
}

impl RipCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            root: config.root.clone(),
            max_bytes: config.max_bytes,
            min_free_ratio: config.min_free_ratio,
            leases: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Deterministic entry directory for a fingerprint. Does not create it.
    pub fn entry_path(&self, fingerprint: &str) -> PathBuf {
        self.root.join(fingerprint)
    }

    /// Declare intent to rip into (or encode out of) an entry. While the
    /// returned lease lives, eviction will not reclaim the entry.
    pub fn reserve(&self, fingerprint: &str) -> CacheLease {
        if let Ok(mut leases) = self.leases.lock() {
            leases.insert(fingerprint.to_string());
        }
        CacheLease {
            fingerprint: fingerprint.to_string(),
            leases: Arc::clone(&self.leases),
        }
    }

    fn is_leased(&self, fingerprint: &str) -> bool {
        self.leases
            .lock()
            .map(|leases| leases.contains(fingerprint))
            .unwrap_or(false)
    }

    /// Read an entry's sidecar. Absence (or an unreadable sidecar, which is
    /// treated as corrupt per the eviction policy) is `None`, never an error.
    pub fn load_metadata(&self, dir: &Path) -> Result<Option<CacheEntryMeta>> {
        let path = dir.join(CACHE_METADATA_FILENAME);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        match serde_json::from_str(&raw) {
            Ok(meta) => Ok(Some(meta)),
            Err(e) => {
                log::warn!("Corrupt cache metadata at {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    /// Atomic write-and-rename of the sidecar.
    pub fn write_metadata(&self, dir: &Path, meta: &CacheEntryMeta) -> Result<()> {
        fs::create_dir_all(dir)?;
        let final_path = dir.join(CACHE_METADATA_FILENAME);
        let tmp_path = dir.join(format!("{}{}", CACHE_TEMP_PREFIX, CACHE_METADATA_FILENAME));
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(serde_json::to_string_pretty(meta)?.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &final_path)?;
        Ok(())
    }

    /// Largest `.mkv` in the entry, ties broken by name ascending. `None`
    /// means the entry is not yet ripped.
    pub fn primary_video_file(&self, dir: &Path) -> Result<Option<PathBuf>> {
        let mut best: Option<(u64, PathBuf)> = None;
        if !dir.exists() {
            return Ok(None);
        }
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_mkv = path
                .extension()
                .map(|e| e.to_string_lossy().eq_ignore_ascii_case("mkv"))
                .unwrap_or(false);
            if !is_mkv {
                continue;
            }
            let size = entry.metadata()?.len();
            let better = match &best {
                None => true,
                Some((best_size, best_path)) => {
                    size > *best_size || (size == *best_size && path < *best_path)
                }
            };
            if better {
                best = Some((size, path));
            }
        }
        Ok(best.map(|(_, path)| path))
    }

    fn scan(&self) -> Result<Vec<EntryState>> {
        let mut entries = Vec::new();
        if !self.root.exists() {
            return Ok(entries);
        }
        for dir_entry in fs::read_dir(&self.root)? {
            let dir_entry = dir_entry?;
            if !dir_entry.path().is_dir() {
                continue;
            }
            let path = dir_entry.path();
            let fingerprint = dir_entry.file_name().to_string_lossy().to_string();

            let mut size_bytes = 0u64;
            let mut modified_unix = 0i64;
            for file in WalkDir::new(&path).into_iter().filter_map(|e| e.ok()) {
                if !file.file_type().is_file() {
                    continue;
                }
                if let Ok(meta) = file.metadata() {
                    size_bytes += meta.len();
                    let mtime = FileTime::from_last_modification_time(&meta).unix_seconds();
                    modified_unix = modified_unix.max(mtime);
                }
            }
            if modified_unix == 0 {
                if let Ok(meta) = fs::metadata(&path) {
                    modified_unix = FileTime::from_last_modification_time(&meta).unix_seconds();
                }
            }

            let meta = self.load_metadata(&path)?;
            entries.push(EntryState {
                fingerprint,
                path,
                size_bytes,
                modified_unix,
                meta,
            });
        }
        Ok(entries)
    }

    fn free_and_disk_bytes(&self) -> (u64, u64) {
        let free = fs2::available_space(&self.root).unwrap_or(u64::MAX);
        let disk = fs2::total_space(&self.root).unwrap_or(u64::MAX);
        (free, disk)
    }

    /// Snapshot of the cache, entries newest-first and numbered from 1.
    pub fn stats(&self) -> Result<CacheStats> {
        let mut entries = self.scan()?;
        entries.sort_by(|a, b| {
            b.modified_unix
                .cmp(&a.modified_unix)
                .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        });

        let total_bytes: u64 = entries.iter().map(|e| e.size_bytes).sum();
        let (free_bytes, disk_bytes) = self.free_and_disk_bytes();
        let free_ratio = if disk_bytes == 0 || disk_bytes == u64::MAX {
            1.0
        } else {
            free_bytes as f64 / disk_bytes as f64
        };

        let entry_summaries = entries
            .iter()
            .enumerate()
            .map(|(i, e)| EntrySummary {
                number: i + 1,
                fingerprint: e.fingerprint.clone(),
                label: e
                    .meta
                    .as_ref()
                    .map(|m| m.label.clone())
                    .unwrap_or_default(),
                size_bytes: e.size_bytes,
                modified_unix: e.modified_unix,
                has_metadata: e.meta.is_some(),
            })
            .collect();

        Ok(CacheStats {
            entries: entries.len(),
            total_bytes,
            max_bytes: self.max_bytes,
            free_bytes,
            free_ratio,
            entry_summaries,
        })
    }

    /// Remove the entry numbered `n` in the current `stats()` ordering.
    pub fn remove_entry_by_number(&self, number: usize) -> Result<(String, u64)> {
        let stats = self.stats()?;
        let summary = stats
            .entry_summaries
            .iter()
            .find(|s| s.number == number)
            .ok_or_else(|| SpindleError::NotFound(format!("cache entry #{}", number)))?;
        let freed = self.remove_by_fingerprint(&summary.fingerprint)?;
        Ok((summary.fingerprint.clone(), freed))
    }

    /// Remove one entry. Refuses while the entry is leased.
    pub fn remove_by_fingerprint(&self, fingerprint: &str) -> Result<u64> {
        if self.is_leased(fingerprint) {
            return Err(SpindleError::Conflict(format!(
                "cache entry {} is in use by a running stage",
                fingerprint
            )));
        }
        let path = self.entry_path(fingerprint);
        if !path.exists() {
            return Err(SpindleError::NotFound(format!("cache entry {}", fingerprint)));
        }
        let freed = dir_size(&path);
        fs::remove_dir_all(&path)?;
        Ok(freed)
    }

    /// Remove every non-leased entry.
    pub fn clear(&self) -> Result<(usize, u64)> {
        let mut removed = 0;
        let mut freed = 0u64;
        for entry in self.scan()? {
            if self.is_leased(&entry.fingerprint) {
                continue;
            }
            freed += entry.size_bytes;
            fs::remove_dir_all(&entry.path)?;
            removed += 1;
        }
        Ok((removed, freed))
    }

    /// Evict until both budgets hold or nothing removable remains. Partial
    /// entries (no sidecar) go first, then oldest by modified time, ties by
    /// fingerprint. Per-entry IO failures are logged and skipped so one bad
    /// directory cannot wedge the pass.
    pub fn enforce_budget(&self) -> Result<EvictionReport> {
        let mut report = EvictionReport::default();
        let mut entries = self.scan()?;
        if entries.is_empty() {
            return Ok(report);
        }

        entries.sort_by(|a, b| {
            let a_partial = a.meta.is_none();
            let b_partial = b.meta.is_none();
            b_partial
                .cmp(&a_partial)
                .then_with(|| a.modified_unix.cmp(&b.modified_unix))
                .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        });

        let mut total_bytes: u64 = entries.iter().map(|e| e.size_bytes).sum();

        let over_budget = |total: u64, cache: &Self| -> bool {
            if total > cache.max_bytes {
                return true;
            }
            let (free, disk) = cache.free_and_disk_bytes();
            if disk == 0 || disk == u64::MAX {
                return false;
            }
            (free as f64 / disk as f64) < cache.min_free_ratio
        };

        let mut candidates = entries.into_iter();
        while over_budget(total_bytes, self) {
            let Some(entry) = candidates.next() else {
                break; // only leased (or no) entries remain
            };
            if self.is_leased(&entry.fingerprint) {
                continue;
            }
            match fs::remove_dir_all(&entry.path) {
                Ok(()) => {
                    log::info!(
                        "Evicted cache entry {} ({} bytes)",
                        entry.fingerprint,
                        entry.size_bytes
                    );
                    total_bytes = total_bytes.saturating_sub(entry.size_bytes);
                    report.removed += 1;
                    report.bytes_freed += entry.size_bytes;
                }
                Err(e) => {
                    log::warn!("Failed to evict cache entry {}: {}", entry.fingerprint, e);
                }
            }
        }

        Ok(report)
    }
}

fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

#[cfg(test)]
mod tests;
