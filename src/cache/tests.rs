// Rip cache tests against temp directories.

use super::*;
use std::fs;
use tempfile::TempDir;

fn cache_at(root: &Path, max_bytes: u64) -> RipCache {
    RipCache::new(&CacheConfig {
        root: root.to_path_buf(),
        max_bytes,
        // Keep the free-space budget out of the way; eviction tests drive
        // the byte budget only.
        min_free_ratio: 0.0,
    })
}

/// Create an entry directory with one media file of `size` bytes and an
/// mtime `age_rank` hours in the past (larger = older).
fn seed_entry(cache: &RipCache, fingerprint: &str, label: &str, size: usize, age_rank: u64, with_meta: bool) {
    let dir = cache.entry_path(fingerprint);
    fs::create_dir_all(&dir).unwrap();
    let file = dir.join("title_00.mkv");
    fs::write(&file, vec![0u8; size]).unwrap();

    let mtime = FileTime::from_unix_time(1_700_000_000 - (age_rank as i64) * 3600, 0);
    filetime::set_file_mtime(&file, mtime).unwrap();

    if with_meta {
        let meta = CacheEntryMeta {
            label: label.to_string(),
            primary_file: Some("title_00.mkv".to_string()),
            size_bytes: size as u64,
            modified_at: "2023-11-14T00:00:00Z".to_string(),
            video_file_count: 1,
        };
        cache.write_metadata(&dir, &meta).unwrap();
        // Keep the sidecar from perturbing the entry's age
        filetime::set_file_mtime(dir.join(CACHE_METADATA_FILENAME), mtime).unwrap();
    }
}

#[test]
fn test_metadata_round_trip() {
    let tmp = TempDir::new().unwrap();
    let cache = cache_at(tmp.path(), 1024);
    let dir = cache.entry_path("fp-001");

    assert!(cache.load_metadata(&dir).unwrap().is_none());

    let meta = CacheEntryMeta {
        label: "TOY_STORY".to_string(),
        primary_file: Some("title_00.mkv".to_string()),
        size_bytes: 123,
        modified_at: "2023-11-14T00:00:00Z".to_string(),
        video_file_count: 1,
    };
    cache.write_metadata(&dir, &meta).unwrap();
    assert_eq!(cache.load_metadata(&dir).unwrap(), Some(meta));
}

#[test]
fn test_corrupt_metadata_treated_as_absent() {
    let tmp = TempDir::new().unwrap();
    let cache = cache_at(tmp.path(), 1024);
    let dir = cache.entry_path("fp-001");
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(CACHE_METADATA_FILENAME), "{not json").unwrap();

    assert!(cache.load_metadata(&dir).unwrap().is_none());
}

#[test]
fn test_primary_video_file_selection() {
    let tmp = TempDir::new().unwrap();
    let cache = cache_at(tmp.path(), 1024);
    let dir = cache.entry_path("fp-001");
    fs::create_dir_all(&dir).unwrap();

    assert!(cache.primary_video_file(&dir).unwrap().is_none());

    fs::write(dir.join("small.mkv"), vec![0u8; 10]).unwrap();
    fs::write(dir.join("big.mkv"), vec![0u8; 100]).unwrap();
    fs::write(dir.join("huge.mp4"), vec![0u8; 1000]).unwrap(); // wrong extension

    let primary = cache.primary_video_file(&dir).unwrap().unwrap();
    assert_eq!(primary.file_name().unwrap(), "big.mkv");

    // Equal sizes: name ascending wins
    fs::write(dir.join("aaa.mkv"), vec![0u8; 100]).unwrap();
    let primary = cache.primary_video_file(&dir).unwrap().unwrap();
    assert_eq!(primary.file_name().unwrap(), "aaa.mkv");
}

#[test]
fn test_stats_numbering_newest_first() {
    let tmp = TempDir::new().unwrap();
    let cache = cache_at(tmp.path(), 10_000);
    seed_entry(&cache, "fp-old", "OLD", 100, 3, true);
    seed_entry(&cache, "fp-mid", "MID", 200, 2, true);
    seed_entry(&cache, "fp-new", "NEW", 300, 1, true);

    let stats = cache.stats().unwrap();
    assert_eq!(stats.entries, 3);
    assert_eq!(stats.total_bytes, 600 + total_sidecar_bytes(&cache, 3));
    let order: Vec<&str> = stats
        .entry_summaries
        .iter()
        .map(|s| s.fingerprint.as_str())
        .collect();
    assert_eq!(order, vec!["fp-new", "fp-mid", "fp-old"]);
    assert_eq!(stats.entry_summaries[0].number, 1);
    assert_eq!(stats.entry_summaries[2].number, 3);
}

fn total_sidecar_bytes(cache: &RipCache, count: usize) -> u64 {
    // Sidecars count toward entry size; measure one and multiply.
    let one = fs::metadata(
        cache
            .entry_path("fp-old")
            .join(CACHE_METADATA_FILENAME),
    )
    .map(|m| m.len())
    .unwrap_or(0);
    one * count as u64
}

#[test]
fn test_empty_cache_stats_and_budget() {
    let tmp = TempDir::new().unwrap();
    let cache = cache_at(tmp.path(), 0);
    let stats = cache.stats().unwrap();
    assert_eq!(stats.entries, 0);
    assert_eq!(stats.total_bytes, 0);

    let report = cache.enforce_budget().unwrap();
    assert_eq!(report.removed, 0);
}

#[test]
fn test_eviction_removes_oldest_non_leased() {
    let tmp = TempDir::new().unwrap();
    // Budget fits two of the three 4000-byte entries (sidecars add a little)
    let cache = cache_at(tmp.path(), 8_500);
    seed_entry(&cache, "fp-t1", "T1", 4000, 3, true); // oldest
    seed_entry(&cache, "fp-t2", "T2", 4000, 2, true);
    seed_entry(&cache, "fp-t3", "T3", 4000, 1, true); // newest

    // T1 is leased by an in-flight stage; T2 is the oldest evictable
    let lease = cache.reserve("fp-t1");
    let report = cache.enforce_budget().unwrap();
    drop(lease);

    assert_eq!(report.removed, 1);
    assert!(cache.entry_path("fp-t1").exists());
    assert!(!cache.entry_path("fp-t2").exists());
    assert!(cache.entry_path("fp-t3").exists());
}

#[test]
fn test_eviction_prefers_partial_entries() {
    let tmp = TempDir::new().unwrap();
    let cache = cache_at(tmp.path(), 4_500);
    seed_entry(&cache, "fp-done", "DONE", 4000, 3, true); // older, complete
    seed_entry(&cache, "fp-part", "PART", 4000, 1, false); // newer, no sidecar

    let report = cache.enforce_budget().unwrap();
    assert_eq!(report.removed, 1);
    assert!(!cache.entry_path("fp-part").exists());
    assert!(cache.entry_path("fp-done").exists());
}

#[test]
fn test_eviction_stops_when_only_leased_remain() {
    let tmp = TempDir::new().unwrap();
    let cache = cache_at(tmp.path(), 100);
    seed_entry(&cache, "fp-a", "A", 4000, 1, true);

    let lease = cache.reserve("fp-a");
    let report = cache.enforce_budget().unwrap();
    drop(lease);

    assert_eq!(report.removed, 0);
    assert!(cache.entry_path("fp-a").exists());
}

#[test]
fn test_lease_released_on_drop() {
    let tmp = TempDir::new().unwrap();
    let cache = cache_at(tmp.path(), 100);
    seed_entry(&cache, "fp-a", "A", 4000, 1, true);

    {
        let _lease = cache.reserve("fp-a");
        assert!(matches!(
            cache.remove_by_fingerprint("fp-a").unwrap_err(),
            SpindleError::Conflict(_)
        ));
    }
    // Lease dropped; removal now succeeds
    let freed = cache.remove_by_fingerprint("fp-a").unwrap();
    assert!(freed >= 4000);
}

#[test]
fn test_remove_by_number_and_missing() {
    let tmp = TempDir::new().unwrap();
    let cache = cache_at(tmp.path(), 10_000);
    seed_entry(&cache, "fp-old", "OLD", 100, 2, true);
    seed_entry(&cache, "fp-new", "NEW", 100, 1, true);

    // #1 is the newest entry
    let (fingerprint, _) = cache.remove_entry_by_number(1).unwrap();
    assert_eq!(fingerprint, "fp-new");

    assert!(matches!(
        cache.remove_entry_by_number(9).unwrap_err(),
        SpindleError::NotFound(_)
    ));
    assert!(matches!(
        cache.remove_by_fingerprint("fp-gone").unwrap_err(),
        SpindleError::NotFound(_)
    ));
}

#[test]
fn test_clear_skips_leased() {
    let tmp = TempDir::new().unwrap();
    let cache = cache_at(tmp.path(), 10_000);
    seed_entry(&cache, "fp-a", "A", 100, 2, true);
    seed_entry(&cache, "fp-b", "B", 100, 1, true);

    let lease = cache.reserve("fp-a");
    let (removed, freed) = cache.clear().unwrap();
    drop(lease);

    assert_eq!(removed, 1);
    assert!(freed >= 100);
    assert!(cache.entry_path("fp-a").exists());
    assert!(!cache.entry_path("fp-b").exists());
}
