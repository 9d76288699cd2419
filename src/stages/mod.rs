// Stage framework: the contract every pipeline step implements
//
// A stage gets a context scoped to one execution of one item. Heartbeats go
// through the context so the store's lease stays fresh and the stop flag is
// learned on the same round-trip; the 500 ms flush throttle lives here so
// stages can report as often as they like.

pub mod encode;
pub mod episodes;
pub mod identify;
pub mod organize;
pub mod rip;
pub mod subtitle;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::constants::PROGRESS_FLUSH_MILLIS;
use crate::error::Result;
use crate::queue::{ItemStatus, Progress, QueueStore, WorkItem};
use crate::services::Services;

/// External-tool readiness, one row per stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageHealth {
    pub stage: String,
    pub ready: bool,
    pub detail: String,
}

pub trait Stage: Send + Sync {
    /// Display label, e.g. "Identification".
    fn name(&self) -> &'static str;

    /// The status this stage claims while running.
    fn processing_status(&self) -> ItemStatus;

    /// The status a successful run leaves behind.
    fn done_status(&self) -> ItemStatus;

    /// Whether execution needs the optical-drive permit.
    fn needs_drive(&self) -> bool {
        false
    }

    /// Side-effect-light validation and pre-work. Mutations to `item` are
    /// persisted by the executor after this returns.
    fn prepare(&self, ctx: &StageContext, item: &mut WorkItem) -> Result<()>;

    /// The heavy work. Must heartbeat through `ctx` and honour
    /// `ctx.should_stop()` at natural checkpoints.
    fn execute(&self, ctx: &StageContext, item: &mut WorkItem) -> Result<()>;

    fn health_check(&self) -> StageHealth;
}

/// Execution-scoped context handed to a stage.
pub struct StageContext {
    pub item_id: i64,
    pub stage_label: &'static str,
    run_token: String,
    store: Arc<QueueStore>,
    stop_flag: Arc<AtomicBool>,
    shutdown: Arc<AtomicBool>,
    flush_state: Mutex<FlushState>,
}

struct FlushState {
    last_flush: Option<Instant>,
    last_whole_percent: i64,
}

impl StageContext {
    pub fn new(
        item: &WorkItem,
        stage_label: &'static str,
        store: Arc<QueueStore>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            item_id: item.id,
            stage_label,
            run_token: item.run_token.clone().unwrap_or_default(),
            store,
            stop_flag: Arc::new(AtomicBool::new(item.stop_requested)),
            shutdown,
            flush_state: Mutex::new(FlushState {
                last_flush: None,
                last_whole_percent: -1,
            }),
        }
    }

    /// Report progress. Flushes to the store at most every 500 ms, plus on
    /// every whole-percent boundary; either way the stop flag is refreshed
    /// whenever a flush happens.
    pub fn heartbeat(&self, percent: f64, message: &str) -> Result<()> {
        let whole = percent.floor() as i64;
        let should_flush = {
            let mut state = self
                .flush_state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let due = state
                .last_flush
                .map_or(true, |at| at.elapsed() >= Duration::from_millis(PROGRESS_FLUSH_MILLIS))
                || whole != state.last_whole_percent;
            if due {
                state.last_flush = Some(Instant::now());
                state.last_whole_percent = whole;
            }
            due
        };
        if should_flush {
            self.flush(percent, message)?;
        }
        Ok(())
    }

    /// Unthrottled flush, for stage start/end events.
    pub fn force_heartbeat(&self, percent: f64, message: &str) -> Result<()> {
        self.flush(percent, message)
    }

    fn flush(&self, percent: f64, message: &str) -> Result<()> {
        let progress = Progress {
            stage: Some(self.stage_label.to_string()),
            percent: percent.clamp(0.0, 100.0),
            message: Some(message.to_string()),
            last_heartbeat: None,
        };
        let stop = self.store.heartbeat(self.item_id, &self.run_token, &progress)?;
        if stop {
            self.stop_flag.store(true, Ordering::Relaxed);
        }
        Ok(())
    }

    /// True once a stop was requested for this item or the daemon is
    /// shutting down. Refreshed by heartbeat flushes.
    pub fn should_stop(&self) -> bool {
        self.stop_flag.load(Ordering::Relaxed) || self.shutdown.load(Ordering::Relaxed)
    }

    /// Checkpoint helper: raise `Stopped` when a stop is pending.
    pub fn check_stop(&self) -> Result<()> {
        if self.should_stop() {
            Err(crate::error::SpindleError::Stopped)
        } else {
            Ok(())
        }
    }
}

/// The fixed, ordered stage registry. The subtitler is present only when
/// subtitles are enabled; the `encoded -> organizing` claim mapping covers
/// the disabled case.
pub fn build_registry(services: &Arc<Services>) -> Vec<Arc<dyn Stage>> {
    let mut registry: Vec<Arc<dyn Stage>> = vec![
        Arc::new(identify::IdentifyStage::new(Arc::clone(services))),
        Arc::new(rip::RipStage::new(Arc::clone(services))),
        Arc::new(episodes::EpisodeIdentifyStage::new(Arc::clone(services))),
        Arc::new(encode::EncodeStage::new(Arc::clone(services))),
    ];
    if services.config.subtitles_enabled {
        registry.push(Arc::new(subtitle::SubtitleStage::new(Arc::clone(services))));
    }
    registry.push(Arc::new(organize::OrganizeStage::new(Arc::clone(services))));
    registry
}

pub fn stage_for_status(
    registry: &[Arc<dyn Stage>],
    status: ItemStatus,
) -> Option<Arc<dyn Stage>> {
    registry
        .iter()
        .find(|stage| stage.processing_status() == status)
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn services(subtitles: bool) -> Arc<Services> {
        let mut config = Config::default();
        config.subtitles_enabled = subtitles;
        let store = Arc::new(QueueStore::open_in_memory().unwrap());
        Arc::new(Services::new(config, store))
    }

    #[test]
    fn test_registry_order_with_subtitles() {
        let registry = build_registry(&services(true));
        let statuses: Vec<ItemStatus> = registry.iter().map(|s| s.processing_status()).collect();
        assert_eq!(
            statuses,
            vec![
                ItemStatus::Identifying,
                ItemStatus::Ripping,
                ItemStatus::EpisodeIdentifying,
                ItemStatus::Encoding,
                ItemStatus::Subtitling,
                ItemStatus::Organizing,
            ]
        );
    }

    #[test]
    fn test_registry_omits_subtitler_when_disabled() {
        let registry = build_registry(&services(false));
        assert!(registry
            .iter()
            .all(|s| s.processing_status() != ItemStatus::Subtitling));
        assert_eq!(registry.len(), 5);
    }

    #[test]
    fn test_stage_lookup_by_status() {
        let registry = build_registry(&services(true));
        let stage = stage_for_status(&registry, ItemStatus::Encoding).unwrap();
        assert_eq!(stage.done_status(), ItemStatus::Encoded);
        assert!(stage_for_status(&registry, ItemStatus::Pending).is_none());
    }

    #[test]
    fn test_every_stage_pairs_processing_and_done() {
        for stage in build_registry(&services(true)) {
            assert_eq!(
                stage.processing_status().done_status(),
                Some(stage.done_status()),
                "stage {} has mismatched status pair",
                stage.name()
            );
        }
    }
}
