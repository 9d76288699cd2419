// Disc watcher
//
// Turns "a disc appeared" into a pending queue item. Detection rides on
// mounted-volume scanning; insertion events also arrive over IPC from udev
// hooks or the CLI. Fingerprinting takes the optical-drive permit so it
// never races a rip.

pub mod fingerprint;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sysinfo::Disks;

use crate::error::{Result, SpindleError};
use crate::services::Services;

/// Result of one insertion event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsertOutcome {
    pub handled: bool,
    pub item_id: Option<i64>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherStatus {
    pub paused: bool,
    pub device: PathBuf,
}

struct RecentEvent {
    device: PathBuf,
    item_id: i64,
    at: Instant,
}

pub struct DiscWatcher {
    services: Arc<Services>,
    paused: AtomicBool,
    recent: Mutex<Option<RecentEvent>>,
    wake: Box<dyn Fn() + Send + Sync>,
}

impl DiscWatcher {
    pub fn new(services: Arc<Services>, wake: Box<dyn Fn() + Send + Sync>) -> Self {
        Self {
            services,
            paused: AtomicBool::new(false),
            recent: Mutex::new(None),
            wake,
        }
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
        log::info!("Disc watcher paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
        log::info!("Disc watcher resumed");
    }

    pub fn status(&self) -> WatcherStatus {
        WatcherStatus {
            paused: self.paused.load(Ordering::Relaxed),
            device: self.services.config.optical_drive.clone(),
        }
    }

    /// Handle one insertion event for `device`. Idempotent within the
    /// debounce window; duplicate fingerprints are rejected unless the
    /// caller opted in.
    pub fn notify_inserted(&self, device: &Path, allow_duplicate: bool) -> Result<InsertOutcome> {
        if self.paused.load(Ordering::Relaxed) {
            log::info!("Ignoring disc insertion on {}: watcher paused", device.display());
            return Ok(InsertOutcome {
                handled: false,
                item_id: None,
                message: "disc watcher is paused".to_string(),
            });
        }

        // Debounce: the same device re-announcing within the window returns
        // the item the first event created.
        let debounce = Duration::from_secs(self.services.config.insert_debounce_seconds.max(0) as u64);
        if let Ok(recent) = self.recent.lock() {
            if let Some(event) = recent.as_ref() {
                if event.device == device && event.at.elapsed() < debounce {
                    return Ok(InsertOutcome {
                        handled: true,
                        item_id: Some(event.item_id),
                        message: "duplicate insertion event (debounced)".to_string(),
                    });
                }
            }
        }

        let mount = resolve_mount(device);
        let label_timeout = Duration::from_secs(self.services.config.label_read_timeout_seconds);
        let label = read_label_with_timeout(device, &mount, label_timeout).unwrap_or_else(|| {
            log::warn!("Could not read label for {}; proceeding unlabeled", device.display());
            String::new()
        });

        // Fingerprinting reads the disc: hold the drive permit
        let fp = {
            let _drive = self.services.acquire_drive();
            fingerprint::compute_fingerprint(
                &mount,
                Duration::from_secs(self.services.config.fingerprint_timeout_seconds),
            )?
        };

        if !allow_duplicate {
            if let Some(existing) = self.services.store.find_active_fingerprint(&fp)? {
                log::info!(
                    "Disc {} already in queue as item {} ({})",
                    label,
                    existing.id,
                    existing.status
                );
                return Ok(InsertOutcome {
                    handled: false,
                    item_id: Some(existing.id),
                    message: format!("already in queue as item {}", existing.id),
                });
            }
        }

        let item = self.services.store.create_disc(&label, &fp, allow_duplicate)?;
        log::info!("Item {}: created for disc '{}' ({})", item.id, label, &fp[..12.min(fp.len())]);

        if let Ok(mut recent) = self.recent.lock() {
            *recent = Some(RecentEvent {
                device: device.to_path_buf(),
                item_id: item.id,
                at: Instant::now(),
            });
        }

        self.services
            .notifier
            .notify("Spindle: disc detected", &format!("Queued '{}' for processing", label));
        (self.wake)();

        Ok(InsertOutcome {
            handled: true,
            item_id: Some(item.id),
            message: "queued".to_string(),
        })
    }

    /// Queue an existing rip-cache entry as a new item, same duplicate rule
    /// as a fresh insertion.
    pub fn process_cached_entry(&self, fp: &str, allow_duplicate: bool) -> Result<InsertOutcome> {
        let entry = self.services.cache.entry_path(fp);
        if !entry.is_dir() {
            return Err(SpindleError::NotFound(format!("cache entry {}", fp)));
        }
        let label = self
            .services
            .cache
            .load_metadata(&entry)?
            .map(|meta| meta.label)
            .unwrap_or_default();

        let item = self.services.store.create_disc(&label, fp, allow_duplicate)?;
        log::info!("Item {}: created from cached rip {}", item.id, fp);
        (self.wake)();
        Ok(InsertOutcome {
            handled: true,
            item_id: Some(item.id),
            message: "queued from cache".to_string(),
        })
    }

    /// Poll for optical media until `shutdown`. The insertion path is the
    /// same one IPC events use.
    pub fn watch_loop(&self, shutdown: Arc<AtomicBool>) {
        let poll = Duration::from_secs(2);
        let mut last_seen = false;
        while !shutdown.load(Ordering::Relaxed) {
            std::thread::sleep(poll);
            if self.paused.load(Ordering::Relaxed) {
                continue;
            }
            let device = self.services.config.optical_drive.clone();
            let present = optical_mounted(&device);
            if present && !last_seen {
                log::info!("Optical media detected on {}", device.display());
                match self.notify_inserted(&device, false) {
                    Ok(outcome) if !outcome.handled => {
                        log::info!("Insertion not handled: {}", outcome.message)
                    }
                    Ok(_) => {}
                    Err(e) => log::error!("Disc insertion failed: {}", e),
                }
            }
            last_seen = present;
        }
    }
}

/// Map a device path to its mount point via the OS volume table. A path
/// that is already a directory (tests, loop mounts) is used as-is.
fn resolve_mount(device: &Path) -> PathBuf {
    if device.is_dir() {
        return device.to_path_buf();
    }
    let disks = Disks::new_with_refreshed_list();
    disks
        .iter()
        .find(|disk| Path::new(disk.name()) == device)
        .map(|disk| disk.mount_point().to_path_buf())
        .unwrap_or_else(|| device.to_path_buf())
}

/// Best-effort label read under a deadline; a hung volume table never
/// blocks the insertion path for long.
fn read_label_with_timeout(device: &Path, mount: &Path, timeout: Duration) -> Option<String> {
    let device = device.to_path_buf();
    let mount = mount.to_path_buf();
    let (tx, rx) = std::sync::mpsc::channel();
    let spawned = std::thread::Builder::new()
        .name("label-read".to_string())
        .spawn(move || {
            let _ = tx.send(read_label(&device, &mount));
        });
    if spawned.is_err() {
        return None;
    }
    rx.recv_timeout(timeout).ok().flatten()
}

/// Best-effort label: the volume name from the OS, else the mount's
/// directory name.
fn read_label(device: &Path, mount: &Path) -> Option<String> {
    let disks = Disks::new_with_refreshed_list();
    let from_volume = disks
        .iter()
        .find(|disk| Path::new(disk.name()) == device || disk.mount_point() == mount)
        .map(|disk| disk.name().to_string_lossy().to_string())
        .filter(|name| !name.is_empty() && !name.starts_with("/dev/"));
    from_volume.or_else(|| {
        mount
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .filter(|n| !n.is_empty())
    })
}

/// Whether removable optical media is currently mounted for `device`.
fn optical_mounted(device: &Path) -> bool {
    let disks = Disks::new_with_refreshed_list();
    disks.iter().any(|disk| {
        let fs = disk.file_system().to_string_lossy().to_lowercase();
        let is_optical = fs.contains("udf") || fs.contains("iso9660");
        (Path::new(disk.name()) == device || is_optical) && disk.is_removable()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::queue::{ItemStatus, QueueStore};
    use std::fs;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    fn watcher_with_wake_counter() -> (Arc<DiscWatcher>, Arc<AtomicUsize>, TempDir) {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::default();
        config.cache.root = tmp.path().join("cache");
        fs::create_dir_all(&config.cache.root).unwrap();
        let store = Arc::new(QueueStore::open_in_memory().unwrap());
        let services = Arc::new(Services::new(config, store));
        let wakes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&wakes);
        let watcher = Arc::new(DiscWatcher::new(
            services,
            Box::new(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            }),
        ));
        (watcher, wakes, tmp)
    }

    fn fake_disc(tmp: &TempDir, name: &str, payload: &[u8]) -> PathBuf {
        let mount = tmp.path().join(name);
        fs::create_dir_all(mount.join("BDMV")).unwrap();
        fs::write(mount.join("BDMV/index.bdmv"), payload).unwrap();
        mount
    }

    #[test]
    fn test_insertion_creates_pending_item_and_wakes() {
        let (watcher, wakes, tmp) = watcher_with_wake_counter();
        let mount = fake_disc(&tmp, "TOY_STORY", b"disc payload");

        let outcome = watcher.notify_inserted(&mount, false).unwrap();
        assert!(outcome.handled);
        let item_id = outcome.item_id.unwrap();
        assert_eq!(wakes.load(Ordering::Relaxed), 1);

        let item = watcher.services.store.get(item_id).unwrap().unwrap();
        assert_eq!(item.status, ItemStatus::Pending);
        assert!(item.source.fingerprint().is_some());
    }

    #[test]
    fn test_paused_watcher_declines() {
        let (watcher, wakes, tmp) = watcher_with_wake_counter();
        let mount = fake_disc(&tmp, "DISC", b"payload");

        watcher.pause();
        let outcome = watcher.notify_inserted(&mount, false).unwrap();
        assert!(!outcome.handled);
        assert_eq!(wakes.load(Ordering::Relaxed), 0);

        watcher.resume();
        assert!(watcher.notify_inserted(&mount, false).unwrap().handled);
    }

    #[test]
    fn test_duplicate_fingerprint_declined_while_active() {
        // S2: the same disc announced twice while the first item is live
        let (watcher, _, tmp) = watcher_with_wake_counter();
        let mount_a = fake_disc(&tmp, "DISC_A", b"same payload");
        let mount_b = fake_disc(&tmp, "DISC_B", b"same payload");

        let first = watcher.notify_inserted(&mount_a, false).unwrap();
        assert!(first.handled);

        // Different mount, identical structure: same fingerprint
        let second = watcher.notify_inserted(&mount_b, false).unwrap();
        assert!(!second.handled);
        assert!(second.message.contains("already in queue"));
        assert_eq!(second.item_id, first.item_id);

        // Explicit override queues it anyway
        let forced = watcher.notify_inserted(&mount_b, true).unwrap();
        assert!(forced.handled);
        assert_ne!(forced.item_id, first.item_id);
    }

    #[test]
    fn test_debounce_returns_existing_item() {
        let (watcher, _, tmp) = watcher_with_wake_counter();
        let mount = fake_disc(&tmp, "DISC", b"payload");

        let first = watcher.notify_inserted(&mount, false).unwrap();
        let second = watcher.notify_inserted(&mount, false).unwrap();
        assert!(second.handled);
        assert_eq!(second.item_id, first.item_id);
        assert!(second.message.contains("debounced"));
    }

    #[test]
    fn test_process_cached_entry_shares_duplicate_rule() {
        let (watcher, _, tmp) = watcher_with_wake_counter();
        let entry = watcher.services.cache.entry_path("fp-cached");
        fs::create_dir_all(&entry).unwrap();
        let _ = tmp;

        let outcome = watcher.process_cached_entry("fp-cached", false).unwrap();
        assert!(outcome.handled);

        // Second attempt without the override hits the duplicate rule
        let err = watcher.process_cached_entry("fp-cached", false).unwrap_err();
        assert!(matches!(err, SpindleError::DuplicateFingerprint(_)));
        watcher.process_cached_entry("fp-cached", true).unwrap();

        // Unknown entries are rejected outright
        let err = watcher.process_cached_entry("fp-missing", false).unwrap_err();
        assert!(matches!(err, SpindleError::NotFound(_)));
    }
}
