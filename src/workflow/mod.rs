// Workflow manager: lanes, tick loop, crash recovery
//
// Two lanes, each a worker of one: the main lane walks items through
// identify/rip/encode/subtitle/organize, the background lane runs episode
// identification so a slow match cannot hold up ripping. Each lane claims,
// executes, and drains until nothing is eligible, then sleeps on its wake
// channel for at most the poll interval.

pub mod executor;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::queue::{ItemStatus, WorkItem};
use crate::services::Services;
use crate::stages::{self, Stage, StageHealth};

pub use executor::{execute_stage, StageOutcome};

/// What a lane is doing right now, for the daemon status surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaneActivity {
    pub lane: String,
    pub item_id: i64,
    pub stage: String,
}

pub struct WorkflowManager {
    services: Arc<Services>,
    registry: Vec<Arc<dyn Stage>>,
    shutdown: Arc<AtomicBool>,
    wakers: Mutex<Vec<Sender<()>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    active: Arc<Mutex<HashMap<String, LaneActivity>>>,
}

impl WorkflowManager {
    pub fn new(services: Arc<Services>) -> Self {
        let registry = stages::build_registry(&services);
        Self::with_registry(services, registry)
    }

    /// Test seam: run the manager over an arbitrary stage registry.
    pub fn with_registry(services: Arc<Services>, registry: Vec<Arc<dyn Stage>>) -> Self {
        Self {
            services,
            registry,
            shutdown: Arc::new(AtomicBool::new(false)),
            wakers: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Crash recovery, run once before the lanes start: stale-heartbeat
    /// items return to the status they were claimed from.
    pub fn recover(&self) -> Result<usize> {
        let reset = self
            .services
            .store
            .reset_stuck(self.services.config.stale_deadline_seconds())?;
        if reset > 0 {
            log::warn!("Recovered {} stuck item(s) from a previous run", reset);
        }
        Ok(reset)
    }

    /// Claim and run at most one stage on one item for the given lane.
    /// Returns true when an item was processed (caller should drain).
    pub fn run_lane_once(&self, lane: &str, eligible: &[ItemStatus]) -> Result<bool> {
        let subtitles = self.services.config.subtitles_enabled;
        let Some(item) = self.services.store.claim_next(eligible, subtitles)? else {
            return Ok(false);
        };

        let Some(stage) = stages::stage_for_status(&self.registry, item.status) else {
            // A lane claimed a status no stage owns (lane config out of step
            // with the registry). Rewinding would make the claim loop hot,
            // so park the item where an operator will see it.
            log::error!(
                "No stage registered for status {} (item {}); failing it",
                item.status,
                item.id
            );
            let mut parked = item.clone();
            parked.status = ItemStatus::Failed;
            parked.error = Some(crate::queue::ItemError {
                message: format!("no stage registered for status {}", item.status),
                needs_review: true,
                review_reason: Some("lane configuration mismatch".to_string()),
            });
            self.services.store.release(&parked)?;
            return Ok(true);
        };

        self.set_active(lane, &item, stage.name());
        let outcome = executor::execute_stage(
            &self.services,
            &stage,
            item,
            Arc::clone(&self.shutdown),
        );
        self.clear_active(lane);

        match outcome {
            Ok(outcome) => {
                self.notify_outcome(&outcome);
                self.wake();
                Ok(true)
            }
            Err(e) => {
                log::error!("Lane {}: executor error: {}", lane, e);
                Err(e)
            }
        }
    }

    fn set_active(&self, lane: &str, item: &WorkItem, stage: &str) {
        if let Ok(mut active) = self.active.lock() {
            active.insert(
                lane.to_string(),
                LaneActivity {
                    lane: lane.to_string(),
                    item_id: item.id,
                    stage: stage.to_string(),
                },
            );
        }
    }

    fn clear_active(&self, lane: &str) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(lane);
        }
    }

    pub fn lane_activity(&self) -> Vec<LaneActivity> {
        self.active
            .lock()
            .map(|active| active.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Route terminal and milestone transitions to the notifier.
    fn notify_outcome(&self, outcome: &StageOutcome) {
        let notifier = &self.services.notifier;
        match outcome.final_status {
            ItemStatus::Completed => notifier.notify(
                "Spindle: completed",
                &format!("{} is in the library", outcome.item_title),
            ),
            ItemStatus::Review => notifier.notify(
                "Spindle: needs review",
                &format!(
                    "{}: {}",
                    outcome.item_title,
                    outcome.error.as_deref().unwrap_or("needs attention")
                ),
            ),
            ItemStatus::Failed => notifier.notify(
                "Spindle: failed",
                &format!(
                    "{} failed during {}: {}",
                    outcome.item_title,
                    outcome.stage_name,
                    outcome.error.as_deref().unwrap_or("unknown error")
                ),
            ),
            ItemStatus::Identified => notifier.notify(
                "Spindle: identified",
                &format!("Disc identified as {}", outcome.item_title),
            ),
            ItemStatus::Ripped => notifier.notify(
                "Spindle: ripped",
                &format!("{} ripped to cache", outcome.item_title),
            ),
            _ => {}
        }
    }

    /// Start the lane workers and the maintenance timer.
    pub fn start(self: Arc<Self>) -> Result<()> {
        self.recover()?;

        let lanes = [
            ("main", self.services.config.main_lane.clone()),
            ("background", self.services.config.background_lane.clone()),
        ];

        for (name, eligible) in lanes {
            let (tx, rx) = channel();
            self.wakers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(tx);
            let manager = Arc::clone(&self);
            let handle = std::thread::Builder::new()
                .name(format!("lane-{}", name))
                .spawn(move || manager.lane_loop(name, &eligible, rx))?;
            self.handles
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(handle);
        }

        let manager = Arc::clone(&self);
        let handle = std::thread::Builder::new()
            .name("maintenance".to_string())
            .spawn(move || manager.maintenance_loop())?;
        self.handles
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handle);

        Ok(())
    }

    fn lane_loop(&self, lane: &'static str, eligible: &[ItemStatus], rx: Receiver<()>) {
        let poll = Duration::from_secs(self.services.config.poll_interval_seconds.max(1));
        while !self.shutdown.load(Ordering::Relaxed) {
            // Drain everything eligible, then sleep until woken or the tick
            loop {
                if self.shutdown.load(Ordering::Relaxed) {
                    return;
                }
                // Catch panics so a broken stage never kills the lane
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    self.run_lane_once(lane, eligible)
                }));
                match result {
                    Ok(Ok(true)) => continue,
                    Ok(Ok(false)) => break,
                    Ok(Err(e)) => {
                        log::error!("Lane {}: {}", lane, e);
                        break;
                    }
                    Err(_) => {
                        log::error!("Lane {}: stage panicked (recovered)", lane);
                        break;
                    }
                }
            }

            match rx.recv_timeout(poll) {
                Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn maintenance_loop(&self) {
        // Periodic cache budget pass; rip completion triggers its own.
        // Sleep in short slices so shutdown is not held up.
        const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);
        let slice = Duration::from_millis(250);
        'outer: while !self.shutdown.load(Ordering::Relaxed) {
            let mut slept = Duration::ZERO;
            while slept < MAINTENANCE_INTERVAL {
                if self.shutdown.load(Ordering::Relaxed) {
                    break 'outer;
                }
                std::thread::sleep(slice);
                slept += slice;
            }
            match self.services.cache.enforce_budget() {
                Ok(report) if report.removed > 0 => {
                    log::info!(
                        "Cache maintenance evicted {} entries ({} bytes)",
                        report.removed,
                        report.bytes_freed
                    );
                }
                Ok(_) => {}
                Err(e) => log::warn!("Cache maintenance failed: {}", e),
            }
        }
    }

    /// Nudge every lane: a new item exists, a stage finished, or a stop was
    /// requested.
    pub fn wake(&self) {
        if let Ok(wakers) = self.wakers.lock() {
            for waker in wakers.iter() {
                let _ = waker.send(());
            }
        }
    }

    /// Stop the lanes and wait for in-flight stages to wind down.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.wake();
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self
                .handles
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Per-stage external-tool readiness.
    pub fn stage_health(&self) -> Vec<StageHealth> {
        self.registry.iter().map(|stage| stage.health_check()).collect()
    }
}
