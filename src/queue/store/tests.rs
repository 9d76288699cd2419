// Queue store tests over an in-memory database.

use super::*;
use crate::media::MediaMetadata;

fn store() -> QueueStore {
    QueueStore::open_in_memory().unwrap()
}

fn main_lane() -> Vec<ItemStatus> {
    vec![
        ItemStatus::Pending,
        ItemStatus::Identified,
        ItemStatus::EpisodeIdentified,
        ItemStatus::Encoded,
        ItemStatus::Subtitled,
    ]
}

/// Force a raw column value, bypassing the store API.
fn raw_set(store: &QueueStore, id: i64, assignment: &str) {
    store
        .lock()
        .execute(&format!("UPDATE items SET {} WHERE id = {}", assignment, id), [])
        .unwrap();
}

#[test]
fn test_create_then_get_round_trip() {
    let store = store();
    let item = store.create_disc("TOY_STORY", "fp-001", false).unwrap();
    assert_eq!(item.status, ItemStatus::Pending);
    assert!(item.id > 0);

    let loaded = store.get(item.id).unwrap().unwrap();
    assert_eq!(loaded.id, item.id);
    assert_eq!(
        loaded.source,
        ItemSource::Disc {
            label: "TOY_STORY".to_string(),
            fingerprint: "fp-001".to_string(),
        }
    );
    assert!(loaded.error.is_none());
    assert!(loaded.episodes.is_empty());
}

#[test]
fn test_get_missing_returns_none() {
    assert!(store().get(42).unwrap().is_none());
}

#[test]
fn test_create_file_validation() {
    let store = store();
    let item = store.create_file(Path::new("/media/input.mkv")).unwrap();
    assert_eq!(
        item.source,
        ItemSource::File {
            path: PathBuf::from("/media/input.mkv")
        }
    );

    let err = store.create_file(Path::new("relative.mkv")).unwrap_err();
    assert!(matches!(err, SpindleError::Validation(_)));

    let err = store.create_file(Path::new("/media/input.wmv")).unwrap_err();
    assert!(matches!(err, SpindleError::Validation(_)));

    // Extension matching is case-insensitive
    store.create_file(Path::new("/media/INPUT.MKV")).unwrap();
}

#[test]
fn test_duplicate_fingerprint_rejected() {
    let store = store();
    store.create_disc("A", "fp-dup", false).unwrap();

    let err = store.create_disc("A", "fp-dup", false).unwrap_err();
    assert!(matches!(err, SpindleError::DuplicateFingerprint(_)));

    // Explicit opt-in allows the duplicate
    store.create_disc("A", "fp-dup", true).unwrap();
}

#[test]
fn test_terminal_item_frees_fingerprint() {
    let store = store();
    let mut item = store.create_disc("A", "fp-done", false).unwrap();
    item.status = ItemStatus::Completed;
    store.update(&item).unwrap();

    // No longer counts as an active holder
    assert!(store.find_active_fingerprint("fp-done").unwrap().is_none());
    store.create_disc("A", "fp-done", false).unwrap();
}

#[test]
fn test_update_then_get_yields_post_image() {
    let store = store();
    let mut item = store.create_disc("SHOW_S1", "fp-tv", false).unwrap();

    item.status = ItemStatus::Identified;
    item.metadata = Some(MediaMetadata::movie("Toy Story", Some(1995)));
    item.ripped_path = Some(PathBuf::from("/cache/fp-tv/title_00.mkv"));
    item.episodes.push(Episode::new("s01e01", 1, 1));
    item.episodes.push(Episode::new("s01e02", 1, 2));
    store.update(&item).unwrap();

    let loaded = store.get(item.id).unwrap().unwrap();
    assert_eq!(loaded.status, ItemStatus::Identified);
    assert_eq!(loaded.metadata.as_ref().unwrap().title, "Toy Story");
    assert_eq!(loaded.ripped_path, item.ripped_path);
    assert_eq!(loaded.episodes.len(), 2);
    assert_eq!(loaded.episodes[0].key, "s01e01");
}

#[test]
fn test_update_missing_item_not_found() {
    let store = store();
    let mut item = store.create_disc("A", "fp", false).unwrap();
    item.id = 999;
    assert!(matches!(
        store.update(&item).unwrap_err(),
        SpindleError::NotFound(_)
    ));
}

#[test]
fn test_remove_twice() {
    let store = store();
    let item = store.create_disc("A", "fp", false).unwrap();
    assert_eq!(store.remove(&[item.id]).unwrap(), 1);
    assert_eq!(store.remove(&[item.id]).unwrap(), 0);
}

#[test]
fn test_clear_scopes() {
    let store = store();
    let mut a = store.create_disc("A", "fp-a", false).unwrap();
    let mut b = store.create_disc("B", "fp-b", false).unwrap();
    store.create_disc("C", "fp-c", false).unwrap();

    a.status = ItemStatus::Completed;
    store.update(&a).unwrap();
    b.status = ItemStatus::Failed;
    store.update(&b).unwrap();

    assert_eq!(store.clear(ClearScope::Completed).unwrap(), 1);
    assert_eq!(store.clear(ClearScope::Failed).unwrap(), 1);
    assert_eq!(store.clear(ClearScope::All).unwrap(), 1);
    assert!(store.list(&[]).unwrap().is_empty());
}

#[test]
fn test_empty_queue_reads() {
    let store = store();
    assert!(store.list(&[]).unwrap().is_empty());
    assert!(store.stats().unwrap().is_empty());
    let health = store.health().unwrap();
    assert_eq!(health.total, 0);
}

#[test]
fn test_list_filters_and_orders_newest_first() {
    let store = store();
    let a = store.create_disc("A", "fp-a", false).unwrap();
    let b = store.create_disc("B", "fp-b", false).unwrap();
    // Same created_at second; id breaks the tie, newest first
    let listed = store.list(&[]).unwrap();
    assert_eq!(listed[0].id, b.id);
    assert_eq!(listed[1].id, a.id);

    let filtered = store.list(&[ItemStatus::Completed]).unwrap();
    assert!(filtered.is_empty());
}

#[test]
fn test_claim_next_flips_status_and_stamps_lease() {
    let store = store();
    let created = store.create_disc("A", "fp-a", false).unwrap();

    let claimed = store.claim_next(&main_lane(), true).unwrap().unwrap();
    assert_eq!(claimed.id, created.id);
    assert_eq!(claimed.status, ItemStatus::Identifying);
    assert_eq!(claimed.claimed_from, Some(ItemStatus::Pending));
    assert!(claimed.run_token.is_some());
    assert!(claimed.claimed_by.is_some());
    assert!(claimed.progress.last_heartbeat.is_some());

    // The item is leased: nothing else is eligible
    assert!(store.claim_next(&main_lane(), true).unwrap().is_none());
}

#[test]
fn test_claim_next_empty_queue() {
    assert!(store().claim_next(&main_lane(), true).unwrap().is_none());
    assert!(store().claim_next(&[], true).unwrap().is_none());
}

#[test]
fn test_claim_orders_by_age_then_id() {
    let store = store();
    let first = store.create_disc("A", "fp-a", false).unwrap();
    let second = store.create_disc("B", "fp-b", false).unwrap();

    let claimed = store.claim_next(&main_lane(), true).unwrap().unwrap();
    assert_eq!(claimed.id, first.id);

    let claimed = store.claim_next(&main_lane(), true).unwrap().unwrap();
    assert_eq!(claimed.id, second.id);
}

#[test]
fn test_claim_skips_leased_fingerprint() {
    let store = store();
    store.create_disc("A", "fp-same", false).unwrap();
    store.create_disc("A again", "fp-same", true).unwrap();

    let first = store.claim_next(&main_lane(), true).unwrap().unwrap();
    assert_eq!(first.status, ItemStatus::Identifying);

    // The twin shares the leased fingerprint and must wait
    assert!(store.claim_next(&main_lane(), true).unwrap().is_none());
}

#[test]
fn test_claim_encoded_forks_on_subtitles() {
    let store = store();
    let mut item = store.create_disc("A", "fp-a", false).unwrap();
    item.status = ItemStatus::Encoded;
    store.update(&item).unwrap();

    let claimed = store.claim_next(&[ItemStatus::Encoded], false).unwrap().unwrap();
    assert_eq!(claimed.status, ItemStatus::Organizing);

    let mut item = claimed;
    item.status = ItemStatus::Encoded;
    item.run_token = None;
    item.claimed_from = None;
    store.update(&item).unwrap();

    let claimed = store.claim_next(&[ItemStatus::Encoded], true).unwrap().unwrap();
    assert_eq!(claimed.status, ItemStatus::Subtitling);
}

#[test]
fn test_heartbeat_flushes_progress_and_reports_stop() {
    let store = store();
    store.create_disc("A", "fp-a", false).unwrap();
    let claimed = store.claim_next(&main_lane(), true).unwrap().unwrap();
    let token = claimed.run_token.clone().unwrap();

    let progress = Progress {
        stage: Some("Identifying".to_string()),
        percent: 40.0,
        message: Some("querying TMDB".to_string()),
        last_heartbeat: None,
    };
    assert!(!store.heartbeat(claimed.id, &token, &progress).unwrap());

    let loaded = store.get(claimed.id).unwrap().unwrap();
    assert_eq!(loaded.progress.percent, 40.0);
    assert_eq!(loaded.progress.stage.as_deref(), Some("Identifying"));

    // Stop request surfaces on the next heartbeat
    store.stop(&[claimed.id]).unwrap();
    assert!(store.heartbeat(claimed.id, &token, &progress).unwrap());

    // A stale token updates nothing
    assert!(!store.heartbeat(claimed.id, "bogus-token", &progress).unwrap());
}

#[test]
fn test_release_persists_post_image_and_clears_lease() {
    let store = store();
    store.create_disc("A", "fp-a", false).unwrap();
    let mut claimed = store.claim_next(&main_lane(), true).unwrap().unwrap();

    claimed.status = ItemStatus::Identified;
    claimed.metadata = Some(MediaMetadata::movie("Toy Story", Some(1995)));
    store.release(&claimed).unwrap();

    let loaded = store.get(claimed.id).unwrap().unwrap();
    assert_eq!(loaded.status, ItemStatus::Identified);
    assert!(loaded.run_token.is_none());
    assert!(loaded.claimed_by.is_none());
    assert!(loaded.claimed_from.is_none());
    assert!(loaded.progress.last_heartbeat.is_none());

    // Released lease frees the item for the next claim
    let next = store.claim_next(&main_lane(), true).unwrap().unwrap();
    assert_eq!(next.status, ItemStatus::Ripping);
}

#[test]
fn test_release_with_reclaimed_lease_conflicts() {
    let store = store();
    store.create_disc("A", "fp-a", false).unwrap();
    let claimed = store.claim_next(&main_lane(), true).unwrap().unwrap();

    // Simulate the reclaimer stealing the lease
    raw_set(&store, claimed.id, "run_token = 'other-token'");

    let err = store.release(&claimed).unwrap_err();
    assert!(matches!(err, SpindleError::Conflict(_)));
}

#[test]
fn test_reset_stuck_restores_claimed_from() {
    let store = store();
    store.create_disc("A", "fp-a", false).unwrap();
    let mut item = store.create_disc("B", "fp-b", false).unwrap();
    item.status = ItemStatus::EpisodeIdentified;
    store.update(&item).unwrap();

    let first = store.claim_next(&main_lane(), true).unwrap().unwrap();
    assert_eq!(first.status, ItemStatus::Identifying);
    let second = store.claim_next(&main_lane(), true).unwrap().unwrap();
    assert_eq!(second.status, ItemStatus::Encoding);

    // Fresh heartbeats: reset is a no-op
    assert_eq!(store.reset_stuck(150).unwrap(), 0);

    // Stale the encoder only
    raw_set(&store, second.id, "last_heartbeat = '2020-01-01 00:00:00'");
    assert_eq!(store.reset_stuck(150).unwrap(), 1);

    let reset = store.get(second.id).unwrap().unwrap();
    assert_eq!(reset.status, ItemStatus::EpisodeIdentified);
    assert!(reset.run_token.is_none());
    assert!(reset.progress.last_heartbeat.is_none());

    // Idempotent: running it again changes nothing
    assert_eq!(store.reset_stuck(150).unwrap(), 0);
    let untouched = store.get(first.id).unwrap().unwrap();
    assert_eq!(untouched.status, ItemStatus::Identifying);
}

#[test]
fn test_retry_failed_returns_to_pending() {
    let store = store();
    let mut item = store.create_disc("A", "fp-a", false).unwrap();
    item.status = ItemStatus::Failed;
    item.error = Some(ItemError {
        message: "mkv exit 5".to_string(),
        needs_review: false,
        review_reason: None,
    });
    store.update(&item).unwrap();

    assert_eq!(store.retry(None).unwrap(), 1);
    let loaded = store.get(item.id).unwrap().unwrap();
    assert_eq!(loaded.status, ItemStatus::Pending);
    assert!(loaded.error.is_none());

    // Retrying a non-failed item is a no-op
    assert_eq!(store.retry(None).unwrap(), 0);
    assert_eq!(store.retry(Some(&[item.id])).unwrap(), 0);
}

#[test]
fn test_retry_explicit_ids_cover_review() {
    let store = store();
    let mut item = store.create_disc("A", "fp-a", false).unwrap();
    item.status = ItemStatus::Review;
    item.error = Some(ItemError {
        message: "ambiguous identification".to_string(),
        needs_review: true,
        review_reason: Some("two TMDB candidates".to_string()),
    });
    store.update(&item).unwrap();

    // The bulk form only touches failed items
    assert_eq!(store.retry(None).unwrap(), 0);
    // Naming the item retries it
    assert_eq!(store.retry(Some(&[item.id])).unwrap(), 1);
    assert_eq!(store.get(item.id).unwrap().unwrap().status, ItemStatus::Pending);
}

#[test]
fn test_retry_episode_rewinds_missing_asset() {
    let store = store();
    let mut item = store.create_disc("SHOW", "fp-tv", false).unwrap();
    item.status = ItemStatus::Failed;
    item.error = Some(ItemError {
        message: "encode failed on s01e05".to_string(),
        needs_review: false,
        review_reason: None,
    });
    let mut good = Episode::new("s01e04", 1, 4);
    good.stage = EpisodeStage::Final;
    good.ripped_path = Some(PathBuf::from("/cache/fp-tv/e4.mkv"));
    good.encoded_path = Some(PathBuf::from("/staging/e4.mkv"));
    let mut bad = Episode::new("s01e05", 1, 5);
    bad.stage = EpisodeStage::Failed;
    bad.ripped_path = Some(PathBuf::from("/cache/fp-tv/e5.mkv"));
    item.episodes = vec![good, bad];
    store.update(&item).unwrap();

    // Ripped asset exists, so the item re-enters at encode
    let status = store.retry_episode(item.id, "s01e05").unwrap();
    assert_eq!(status, ItemStatus::EpisodeIdentified);

    let loaded = store.get(item.id).unwrap().unwrap();
    assert!(loaded.error.is_none());
    assert_eq!(loaded.episode("s01e05").unwrap().stage, EpisodeStage::Ripped);
    // The healthy episode is untouched
    assert_eq!(loaded.episode("s01e04").unwrap().stage, EpisodeStage::Final);
}

#[test]
fn test_retry_episode_without_rip_reenters_at_rip() {
    let store = store();
    let mut item = store.create_disc("SHOW", "fp-tv", false).unwrap();
    item.status = ItemStatus::Failed;
    let mut bad = Episode::new("s01e01", 1, 1);
    bad.stage = EpisodeStage::Failed;
    item.episodes = vec![bad];
    store.update(&item).unwrap();

    let status = store.retry_episode(item.id, "s01e01").unwrap();
    assert_eq!(status, ItemStatus::Identified);
}

#[test]
fn test_retry_episode_errors() {
    let store = store();
    let mut item = store.create_disc("SHOW", "fp-tv", false).unwrap();

    // Wrong status
    let err = store.retry_episode(item.id, "s01e01").unwrap_err();
    assert!(matches!(err, SpindleError::Validation(_)));

    item.status = ItemStatus::Failed;
    store.update(&item).unwrap();

    // No such episode
    let err = store.retry_episode(item.id, "s01e09").unwrap_err();
    assert!(matches!(err, SpindleError::EpisodeNotFound(_)));

    // No such item
    let err = store.retry_episode(999, "s01e01").unwrap_err();
    assert!(matches!(err, SpindleError::NotFound(_)));
}

#[test]
fn test_stop_outcomes() {
    let store = store();
    let waiting = store.create_disc("A", "fp-a", false).unwrap();
    let mut done = store.create_disc("B", "fp-b", false).unwrap();
    done.status = ItemStatus::Completed;
    store.update(&done).unwrap();

    let outcomes = store.stop(&[waiting.id, done.id, 999]).unwrap();
    assert!(matches!(
        outcomes[0],
        StopOutcome::Updated { prior_status: ItemStatus::Pending, .. }
    ));
    assert!(matches!(
        outcomes[1],
        StopOutcome::AlreadyFinished { prior_status: ItemStatus::Completed, .. }
    ));
    assert!(matches!(outcomes[2], StopOutcome::NotFound { .. }));

    // A waiting item is failed immediately with the reserved reason
    let stopped = store.get(waiting.id).unwrap().unwrap();
    assert_eq!(stopped.status, ItemStatus::Failed);
    let error = stopped.error.unwrap();
    assert!(error.needs_review);
    assert_eq!(error.review_reason.as_deref(), Some(REVIEW_REASON_USER_STOP));
}

#[test]
fn test_stop_processing_sets_interrupt_flag() {
    let store = store();
    store.create_disc("A", "fp-a", false).unwrap();
    let claimed = store.claim_next(&main_lane(), true).unwrap().unwrap();

    let outcomes = store.stop(&[claimed.id]).unwrap();
    assert!(matches!(
        outcomes[0],
        StopOutcome::Updated { prior_status: ItemStatus::Identifying, .. }
    ));

    let flagged = store.get(claimed.id).unwrap().unwrap();
    assert!(flagged.stop_requested);
    // Still processing; the executor halts it at the next checkpoint
    assert_eq!(flagged.status, ItemStatus::Identifying);
}

#[test]
fn test_stats_and_health() {
    let store = store();
    store.create_disc("A", "fp-a", false).unwrap();
    store.create_disc("B", "fp-b", false).unwrap();
    let mut failed = store.create_disc("C", "fp-c", false).unwrap();
    failed.status = ItemStatus::Failed;
    store.update(&failed).unwrap();
    store.claim_next(&main_lane(), true).unwrap().unwrap();

    let stats = store.stats().unwrap();
    assert_eq!(stats.get("pending"), Some(&1));
    assert_eq!(stats.get("identifying"), Some(&1));
    assert_eq!(stats.get("failed"), Some(&1));

    let health = store.health().unwrap();
    assert_eq!(health.total, 3);
    assert_eq!(health.pending, 1);
    assert_eq!(health.processing, 1);
    assert_eq!(health.failed, 1);
}
