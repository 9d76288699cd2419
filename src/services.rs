// Shared daemon services
//
// One bundle handed to stages, the workflow manager, the disc watcher, and
// the IPC server. The optical drive is a semaphore of size one carried here
// so both ripping and fingerprinting contend for the same permit.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::cache::discid::DiscIdCache;
use crate::cache::transcripts::TranscriptCache;
use crate::cache::RipCache;
use crate::config::Config;
use crate::notify::Notifier;
use crate::queue::QueueStore;

pub struct Services {
    pub config: Config,
    pub store: Arc<QueueStore>,
    pub cache: Arc<RipCache>,
    pub disc_ids: DiscIdCache,
    pub transcripts: TranscriptCache,
    pub notifier: Notifier,
    drive: Mutex<()>,
}

impl Services {
    pub fn new(config: Config, store: Arc<QueueStore>) -> Self {
        let cache = Arc::new(RipCache::new(&config.cache));
        let disc_ids = DiscIdCache::new(config.cache.root.join(crate::constants::DISC_ID_CACHE_FILENAME));
        let transcripts = TranscriptCache::new(config.transcript_cache_dir.clone());
        let notifier = Notifier::new(&config);
        Self {
            config,
            store,
            cache,
            disc_ids,
            transcripts,
            notifier,
            drive: Mutex::new(()),
        }
    }

    /// Take the optical-drive permit, blocking until free. Held for the
    /// duration of a rip or a fingerprint computation, never longer than one
    /// stage.
    pub fn acquire_drive(&self) -> MutexGuard<'_, ()> {
        self.drive.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
