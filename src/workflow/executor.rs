// Stage executor: runs one stage for one claimed item
//
// Owns the status bookkeeping around a stage run: progress reset on entry,
// done-status promotion on success, error classification on failure, and the
// lease release either way. The optical-drive permit is taken here for
// stages that need it and dropped at the stage boundary regardless of
// outcome.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::error::{Result, SpindleError};
use crate::queue::{ItemError, ItemStatus, Progress, WorkItem};
use crate::services::Services;
use crate::stages::{Stage, StageContext};

/// What a finished stage run looked like, for notifications and logs.
#[derive(Debug, Clone)]
pub struct StageOutcome {
    pub item_id: i64,
    pub item_title: String,
    pub stage_name: &'static str,
    pub final_status: ItemStatus,
    pub error: Option<String>,
}

impl StageOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

pub fn execute_stage(
    services: &Arc<Services>,
    stage: &Arc<dyn Stage>,
    mut item: WorkItem,
    shutdown: Arc<AtomicBool>,
) -> Result<StageOutcome> {
    if item.status != stage.processing_status() {
        return Err(SpindleError::Internal(format!(
            "item {} is {} but stage {} claims {}",
            item.id,
            item.status,
            stage.name(),
            stage.processing_status()
        )));
    }

    let ctx = StageContext::new(&item, stage.name(), Arc::clone(&services.store), shutdown);

    // Fresh progress, cleared error, stamped heartbeat
    item.progress = Progress {
        stage: Some(stage.name().to_string()),
        percent: 0.0,
        message: Some(format!("{} started", stage.name())),
        last_heartbeat: item.progress.last_heartbeat.clone(),
    };
    item.error = None;
    services.store.update(&item)?;

    log::info!("Item {}: {} started", item.id, stage.name());

    // The drive permit spans prepare and execute, released on every path out
    let _drive_permit = if stage.needs_drive() {
        Some(services.acquire_drive())
    } else {
        None
    };

    let result = stage.prepare(&ctx, &mut item).and_then(|()| {
        // Persist preparation-time mutations before the heavy work
        services.store.update(&item)?;
        stage.execute(&ctx, &mut item)
    });

    let outcome = match result {
        Ok(()) => {
            if item.status == stage.processing_status() {
                item.status = stage.done_status();
            }
            item.progress = Progress {
                stage: Some(stage.name().to_string()),
                percent: 100.0,
                message: Some(format!("{} complete", stage.name())),
                last_heartbeat: None,
            };
            StageOutcome {
                item_id: item.id,
                item_title: item.display_title(),
                stage_name: stage.name(),
                final_status: item.status,
                error: None,
            }
        }
        Err(error) => {
            let (status, item_error, progress_stage) = classify_failure(&error);
            item.status = status;
            item.error = Some(item_error);
            item.progress = Progress {
                stage: Some(progress_stage.to_string()),
                percent: 0.0,
                message: Some(error.to_string()),
                last_heartbeat: None,
            };
            log::error!("Item {}: {} failed: {}", item.id, stage.name(), error);
            StageOutcome {
                item_id: item.id,
                item_title: item.display_title(),
                stage_name: stage.name(),
                final_status: status,
                error: Some(error.to_string()),
            }
        }
    };

    match services.store.release(&item) {
        Ok(()) => {}
        Err(SpindleError::Conflict(msg)) => {
            // The lease was reclaimed mid-run (stale heartbeat); the
            // reclaimer's view wins and this run's outcome is discarded.
            log::warn!("Item {}: late release discarded: {}", item.id, msg);
        }
        Err(e) => return Err(e),
    }

    if outcome.succeeded() {
        log::info!(
            "Item {}: {} complete, now {}",
            outcome.item_id,
            outcome.stage_name,
            outcome.final_status
        );
    }
    Ok(outcome)
}

/// Map a stage error onto the item status it resolves to.
fn classify_failure(error: &SpindleError) -> (ItemStatus, ItemError, &'static str) {
    match error {
        SpindleError::ReviewRequired(reason) => (
            ItemStatus::Review,
            ItemError {
                message: error.to_string(),
                needs_review: true,
                review_reason: Some(reason.clone()),
            },
            "Needs review",
        ),
        SpindleError::Stopped => (
            ItemStatus::Failed,
            ItemError {
                message: "Stopped by user".to_string(),
                needs_review: true,
                review_reason: Some(crate::constants::REVIEW_REASON_USER_STOP.to_string()),
            },
            "Failed",
        ),
        _ => (
            ItemStatus::Failed,
            ItemError {
                message: error.to_string(),
                needs_review: false,
                review_reason: None,
            },
            "Failed",
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::queue::QueueStore;
    use crate::stages::StageHealth;

    type Behavior =
        Box<dyn Fn(&StageContext, &mut WorkItem) -> crate::error::Result<()> + Send + Sync>;

    struct StubStage {
        label: &'static str,
        processing: ItemStatus,
        done: ItemStatus,
        behavior: Behavior,
    }

    impl StubStage {
        fn identify(behavior: Behavior) -> Self {
            Self {
                label: "Identification",
                processing: ItemStatus::Identifying,
                done: ItemStatus::Identified,
                behavior,
            }
        }
    }

    impl Stage for StubStage {
        fn name(&self) -> &'static str {
            self.label
        }
        fn processing_status(&self) -> ItemStatus {
            self.processing
        }
        fn done_status(&self) -> ItemStatus {
            self.done
        }
        fn prepare(&self, _ctx: &StageContext, _item: &mut WorkItem) -> crate::error::Result<()> {
            Ok(())
        }
        fn execute(&self, ctx: &StageContext, item: &mut WorkItem) -> crate::error::Result<()> {
            (self.behavior)(ctx, item)
        }
        fn health_check(&self) -> StageHealth {
            StageHealth {
                stage: self.label.to_string(),
                ready: true,
                detail: String::new(),
            }
        }
    }

    fn services() -> Arc<Services> {
        let store = Arc::new(QueueStore::open_in_memory().unwrap());
        Arc::new(Services::new(Config::default(), store))
    }

    fn claim(services: &Arc<Services>) -> WorkItem {
        services.store.create_disc("DISC", "fp-x", false).unwrap();
        services
            .store
            .claim_next(&[ItemStatus::Pending], true)
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_success_promotes_to_done_and_releases() {
        let services = services();
        let item = claim(&services);
        let stage: Arc<dyn Stage> = Arc::new(StubStage::identify(Box::new(|ctx, item| {
            ctx.heartbeat(50.0, "half way")?;
            item.metadata = Some(crate::media::MediaMetadata::movie("Toy Story", Some(1995)));
            Ok(())
        })));

        let outcome =
            execute_stage(&services, &stage, item, Arc::new(AtomicBool::new(false))).unwrap();
        assert!(outcome.succeeded());
        assert_eq!(outcome.final_status, ItemStatus::Identified);

        let loaded = services.store.get(outcome.item_id).unwrap().unwrap();
        assert_eq!(loaded.status, ItemStatus::Identified);
        assert_eq!(loaded.metadata.unwrap().title, "Toy Story");
        assert!(loaded.run_token.is_none());
        assert_eq!(loaded.progress.percent, 100.0);
        assert!(loaded.progress.last_heartbeat.is_none());
    }

    #[test]
    fn test_failure_lands_in_failed_with_message() {
        let services = services();
        let item = claim(&services);
        let stage: Arc<dyn Stage> = Arc::new(StubStage::identify(Box::new(|_, _| {
            Err(SpindleError::ExternalTool("mkv exit 5".to_string()))
        })));

        let outcome =
            execute_stage(&services, &stage, item, Arc::new(AtomicBool::new(false))).unwrap();
        assert!(!outcome.succeeded());

        let loaded = services.store.get(outcome.item_id).unwrap().unwrap();
        assert_eq!(loaded.status, ItemStatus::Failed);
        let error = loaded.error.unwrap();
        assert!(error.message.contains("mkv exit 5"));
        assert!(!error.needs_review);
        assert_eq!(loaded.progress.stage.as_deref(), Some("Failed"));
        assert_eq!(loaded.progress.percent, 0.0);
    }

    #[test]
    fn test_review_required_lands_in_review() {
        let services = services();
        let item = claim(&services);
        let stage: Arc<dyn Stage> = Arc::new(StubStage::identify(Box::new(|_, _| {
            Err(SpindleError::ReviewRequired("two candidates".to_string()))
        })));

        let outcome =
            execute_stage(&services, &stage, item, Arc::new(AtomicBool::new(false))).unwrap();
        let loaded = services.store.get(outcome.item_id).unwrap().unwrap();
        assert_eq!(loaded.status, ItemStatus::Review);
        let error = loaded.error.unwrap();
        assert!(error.needs_review);
        assert_eq!(error.review_reason.as_deref(), Some("two candidates"));
        assert_eq!(loaded.progress.stage.as_deref(), Some("Needs review"));
    }

    #[test]
    fn test_stop_request_observed_at_checkpoint() {
        let services = services();
        let item = claim(&services);
        let store = Arc::clone(&services.store);
        let item_id = item.id;

        // The stage loops on heartbeats; a stop arrives after the first one
        let stage: Arc<dyn Stage> = Arc::new(StubStage::identify(Box::new(move |ctx, _| {
            for i in 0..100 {
                ctx.force_heartbeat(i as f64, "working")?;
                if i == 1 {
                    store.stop(&[item_id]).unwrap();
                }
                ctx.check_stop()?;
            }
            panic!("stop was never observed");
        })));

        let outcome =
            execute_stage(&services, &stage, item, Arc::new(AtomicBool::new(false))).unwrap();
        assert!(!outcome.succeeded());

        let loaded = services.store.get(item_id).unwrap().unwrap();
        assert_eq!(loaded.status, ItemStatus::Failed);
        let error = loaded.error.unwrap();
        assert!(error.needs_review);
        assert_eq!(
            error.review_reason.as_deref(),
            Some(crate::constants::REVIEW_REASON_USER_STOP)
        );
    }

    #[test]
    fn test_daemon_shutdown_stops_stage() {
        let services = services();
        let item = claim(&services);
        let shutdown = Arc::new(AtomicBool::new(true));
        let stage: Arc<dyn Stage> = Arc::new(StubStage::identify(Box::new(|ctx, _| {
            ctx.check_stop()?;
            Ok(())
        })));

        let outcome = execute_stage(&services, &stage, item, shutdown).unwrap();
        assert!(!outcome.succeeded());
        assert_eq!(outcome.final_status, ItemStatus::Failed);
    }

    #[test]
    fn test_wrong_status_is_internal_error() {
        let services = services();
        let mut item = claim(&services);
        item.status = ItemStatus::Encoding; // lie about the claim
        let stage: Arc<dyn Stage> = Arc::new(StubStage::identify(Box::new(|_, _| Ok(()))));

        let err = execute_stage(&services, &stage, item, Arc::new(AtomicBool::new(false)))
            .unwrap_err();
        assert!(matches!(err, SpindleError::Internal(_)));
    }
}
