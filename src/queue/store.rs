// Queue store: the system of record for work items
//
// The lease discipline: claiming flips a claimable status to its processing
// status and stamps a fresh run token, worker id, and heartbeat. Every write
// that belongs to a lease carries the run token, so a stale executor's late
// write silently misses. `reset_stuck` is the only reclaimer.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{REVIEW_REASON_USER_STOP, SUPPORTED_VIDEO_EXTENSIONS};
use crate::db;
use crate::error::{Result, SpindleError};
use crate::queue::item::*;

const ITEM_COLUMNS: &str = "id, source_kind, source_path, disc_label, disc_fingerprint, status, \
     claimed_from, progress_stage, progress_percent, progress_message, last_heartbeat, \
     metadata, rip_spec, ripped_path, encoded_path, final_path, \
     error_message, needs_review, review_reason, stop_requested, run_token, claimed_by, \
     created_at, updated_at";

const EPISODE_COLUMNS: &str = "id, key, season, episode, title, stage, runtime_seconds, \
     ripped_path, encoded_path, final_path, subtitle_source, subtitle_language, \
     subtitle_match_score, progress_percent, progress_message";

/// Timestamp format matching SQLite's `datetime('now')`.
const SQLITE_TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub struct QueueStore {
    conn: Mutex<Connection>,
    worker_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClearScope {
    All,
    Completed,
    Failed,
}

/// Per-item outcome of a stop request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StopOutcome {
    /// The stop took effect: either the interrupt flag was set on a running
    /// item, or a waiting item was failed immediately.
    Updated {
        id: i64,
        prior_status: ItemStatus,
        message: String,
    },
    AlreadyFinished { id: i64, prior_status: ItemStatus },
    NotFound { id: i64 },
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueueHealth {
    pub total: i64,
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub review: i64,
}

fn worker_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    format!("{}:{}", host, std::process::id())
}

fn status_in_clause(statuses: &[ItemStatus]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn map_episode(row: &Row) -> rusqlite::Result<Episode> {
    let stage: String = row.get(5)?;
    let subtitle_source: Option<String> = row.get(10)?;
    let subtitle = match subtitle_source {
        Some(source) => Some(SubtitleInfo {
            source,
            language: row.get::<_, Option<String>>(11)?.unwrap_or_default(),
            match_score: row.get(12)?,
        }),
        None => None,
    };
    Ok(Episode {
        id: row.get(0)?,
        key: row.get(1)?,
        season: row.get(2)?,
        episode: row.get(3)?,
        title: row.get(4)?,
        stage: EpisodeStage::parse(&stage).unwrap_or(EpisodeStage::Planned),
        runtime_seconds: row.get(6)?,
        ripped_path: row.get::<_, Option<String>>(7)?.map(PathBuf::from),
        encoded_path: row.get::<_, Option<String>>(8)?.map(PathBuf::from),
        final_path: row.get::<_, Option<String>>(9)?.map(PathBuf::from),
        subtitle,
        progress_percent: row.get(13)?,
        progress_message: row.get(14)?,
    })
}

fn map_item(row: &Row) -> rusqlite::Result<WorkItem> {
    let source_kind: String = row.get(1)?;
    let source = if source_kind == "disc" {
        ItemSource::Disc {
            label: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
            fingerprint: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        }
    } else {
        ItemSource::File {
            path: PathBuf::from(row.get::<_, Option<String>>(2)?.unwrap_or_default()),
        }
    };

    let status: String = row.get(5)?;
    let claimed_from: Option<String> = row.get(6)?;
    let metadata: Option<String> = row.get(11)?;
    let rip_spec: Option<String> = row.get(12)?;
    let error_message: Option<String> = row.get(16)?;

    Ok(WorkItem {
        id: row.get(0)?,
        source,
        status: ItemStatus::parse(&status).unwrap_or(ItemStatus::Failed),
        claimed_from: claimed_from.as_deref().and_then(ItemStatus::parse),
        progress: Progress {
            stage: row.get(7)?,
            percent: row.get(8)?,
            message: row.get(9)?,
            last_heartbeat: row.get(10)?,
        },
        metadata: metadata.and_then(|raw| serde_json::from_str(&raw).ok()),
        rip_spec: rip_spec.and_then(|raw| serde_json::from_str(&raw).ok()),
        ripped_path: row.get::<_, Option<String>>(13)?.map(PathBuf::from),
        encoded_path: row.get::<_, Option<String>>(14)?.map(PathBuf::from),
        final_path: row.get::<_, Option<String>>(15)?.map(PathBuf::from),
        error: error_message.map(|message| ItemError {
            message,
            needs_review: false, // overwritten below from the row
            review_reason: None,
        }),
        stop_requested: row.get::<_, i64>(19)? != 0,
        run_token: row.get(20)?,
        claimed_by: row.get(21)?,
        episodes: Vec::new(),
        created_at: row.get(22)?,
        updated_at: row.get(23)?,
    })
}

/// `map_item` cannot fill the error flags inline without reordering the
/// column list, so finish the mapping here.
fn finish_item(row: &Row, mut item: WorkItem) -> rusqlite::Result<WorkItem> {
    if let Some(error) = item.error.as_mut() {
        error.needs_review = row.get::<_, i64>(17)? != 0;
        error.review_reason = row.get(18)?;
    }
    Ok(item)
}

fn row_to_item(row: &Row) -> rusqlite::Result<WorkItem> {
    let item = map_item(row)?;
    finish_item(row, item)
}

impl QueueStore {
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            worker_id: worker_id(),
        }
    }

    pub fn open(db_path: &Path) -> Result<Self> {
        Ok(Self::new(db::open_db(db_path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(db::open_memory_db()?))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned mutex means a panic mid-query; the connection itself
        // is still usable and SQLite rolled back any open transaction.
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ----- Creation -----

    /// Insert a new disc item at `pending`. Rejects a fingerprint already
    /// held by a non-terminal item unless `allow_duplicate` is set. This is
    /// the single duplicate rule; every insertion path routes through it.
    pub fn create_disc(&self, label: &str, fingerprint: &str, allow_duplicate: bool) -> Result<WorkItem> {
        if fingerprint.is_empty() {
            return Err(SpindleError::Validation("disc fingerprint is empty".to_string()));
        }
        let conn = self.lock();
        if !allow_duplicate {
            if let Some(existing) = find_active_fingerprint_in(&conn, fingerprint)? {
                return Err(SpindleError::DuplicateFingerprint(format!(
                    "fingerprint {} already queued as item {} ({})",
                    fingerprint, existing.id, existing.status
                )));
            }
        }
        conn.execute(
            "INSERT INTO items (source_kind, disc_label, disc_fingerprint) VALUES ('disc', ?1, ?2)",
            params![label, fingerprint],
        )?;
        let id = conn.last_insert_rowid();
        get_in(&conn, id)?.ok_or_else(|| SpindleError::Internal(format!("item {} vanished after insert", id)))
    }

    /// Insert a new file item at `pending`. The path must be absolute with a
    /// supported video extension; existence is the caller's concern.
    pub fn create_file(&self, path: &Path) -> Result<WorkItem> {
        if !path.is_absolute() {
            return Err(SpindleError::Validation(format!(
                "path must be absolute: {}",
                path.display()
            )));
        }
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if !SUPPORTED_VIDEO_EXTENSIONS.contains(&ext.as_str()) {
            return Err(SpindleError::Validation(format!(
                "unsupported extension '.{}' (supported: .mkv, .mp4, .avi)",
                ext
            )));
        }
        let conn = self.lock();
        conn.execute(
            "INSERT INTO items (source_kind, source_path) VALUES ('file', ?1)",
            params![path.to_string_lossy()],
        )?;
        let id = conn.last_insert_rowid();
        get_in(&conn, id)?.ok_or_else(|| SpindleError::Internal(format!("item {} vanished after insert", id)))
    }

    // ----- Reads -----

    pub fn get(&self, id: i64) -> Result<Option<WorkItem>> {
        get_in(&self.lock(), id)
    }

    /// List items, optionally filtered by status. Newest first for display.
    pub fn list(&self, statuses: &[ItemStatus]) -> Result<Vec<WorkItem>> {
        let conn = self.lock();
        let sql = if statuses.is_empty() {
            format!(
                "SELECT {} FROM items ORDER BY created_at DESC, id DESC",
                ITEM_COLUMNS
            )
        } else {
            format!(
                "SELECT {} FROM items WHERE status IN ({}) ORDER BY created_at DESC, id DESC",
                ITEM_COLUMNS,
                status_in_clause(statuses)
            )
        };
        let mut stmt = conn.prepare(&sql)?;
        let items: Vec<WorkItem> = stmt
            .query_map([], row_to_item)?
            .collect::<std::result::Result<_, _>>()?;
        items
            .into_iter()
            .map(|mut item| {
                item.episodes = episodes_in(&conn, item.id)?;
                Ok(item)
            })
            .collect()
    }

    /// Non-terminal item holding the given fingerprint, if any.
    pub fn find_active_fingerprint(&self, fingerprint: &str) -> Result<Option<WorkItem>> {
        find_active_fingerprint_in(&self.lock(), fingerprint)
    }

    // ----- Whole-item writes -----

    /// Persist a full post-image: the item row plus its episode list, one
    /// transaction. Last writer wins; the lease discipline keeps writers
    /// from racing in practice.
    pub fn update(&self, item: &WorkItem) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let rows = update_item_row(&tx, item)?;
        if rows == 0 {
            return Err(SpindleError::NotFound(format!("item {}", item.id)));
        }
        replace_episodes(&tx, item.id, &item.episodes)?;
        tx.commit()?;
        Ok(())
    }

    pub fn remove(&self, ids: &[i64]) -> Result<usize> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut removed = 0;
        for id in ids {
            tx.execute("DELETE FROM episodes WHERE item_id = ?1", params![id])?;
            removed += tx.execute("DELETE FROM items WHERE id = ?1", params![id])?;
        }
        tx.commit()?;
        Ok(removed)
    }

    pub fn clear(&self, scope: ClearScope) -> Result<usize> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let filter = match scope {
            ClearScope::All => None,
            ClearScope::Completed => Some(ItemStatus::Completed),
            ClearScope::Failed => Some(ItemStatus::Failed),
        };
        let removed = match filter {
            Some(status) => {
                tx.execute(
                    "DELETE FROM episodes WHERE item_id IN (SELECT id FROM items WHERE status = ?1)",
                    params![status.as_str()],
                )?;
                tx.execute("DELETE FROM items WHERE status = ?1", params![status.as_str()])?
            }
            None => {
                tx.execute("DELETE FROM episodes", [])?;
                tx.execute("DELETE FROM items", [])?
            }
        };
        tx.commit()?;
        Ok(removed)
    }

    // ----- Leasing -----

    /// Atomically claim the oldest eligible item: flip its status to the
    /// matching processing status, stamp the lease, and return it. Returns
    /// `None` when nothing is eligible.
    pub fn claim_next(
        &self,
        eligible: &[ItemStatus],
        subtitles_enabled: bool,
    ) -> Result<Option<WorkItem>> {
        if eligible.is_empty() {
            return Ok(None);
        }
        let encoded_target = if subtitles_enabled {
            ItemStatus::Subtitling
        } else {
            ItemStatus::Organizing
        };
        let token = Uuid::new_v4().to_string();

        let conn = self.lock();
        let sql = format!(
            "UPDATE items SET
                claimed_from = status,
                status = CASE status
                    WHEN 'pending' THEN 'identifying'
                    WHEN 'identified' THEN 'ripping'
                    WHEN 'ripped' THEN 'episode-identifying'
                    WHEN 'episode-identified' THEN 'encoding'
                    WHEN 'encoded' THEN '{}'
                    WHEN 'subtitled' THEN 'organizing'
                END,
                run_token = ?1,
                claimed_by = ?2,
                last_heartbeat = datetime('now'),
                updated_at = datetime('now')
             WHERE id = (
                SELECT i.id FROM items i
                WHERE i.status IN ({})
                  AND (i.disc_fingerprint IS NULL OR NOT EXISTS (
                      SELECT 1 FROM items p
                      WHERE p.disc_fingerprint = i.disc_fingerprint
                        AND p.id != i.id
                        AND p.run_token IS NOT NULL))
                ORDER BY i.created_at ASC, i.id ASC
                LIMIT 1
             )
             RETURNING id",
            encoded_target.as_str(),
            status_in_clause(eligible)
        );

        let id: Option<i64> = conn
            .query_row(&sql, params![token, self.worker_id], |row| row.get(0))
            .optional()?;

        match id {
            Some(id) => get_in(&conn, id),
            None => Ok(None),
        }
    }

    /// Refresh the lease heartbeat and flush progress. Returns whether a
    /// stop has been requested, so the executor learns it for free on the
    /// same round-trip. A stale token updates nothing and reports no stop.
    pub fn heartbeat(&self, id: i64, run_token: &str, progress: &Progress) -> Result<bool> {
        let conn = self.lock();
        let rows = conn.execute(
            "UPDATE items SET
                progress_stage = ?1,
                progress_percent = ?2,
                progress_message = ?3,
                last_heartbeat = datetime('now'),
                updated_at = datetime('now')
             WHERE id = ?4 AND run_token = ?5",
            params![
                progress.stage,
                progress.percent,
                progress.message,
                id,
                run_token
            ],
        )?;
        if rows == 0 {
            return Ok(false);
        }
        let stop: i64 = conn.query_row(
            "SELECT stop_requested FROM items WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(stop != 0)
    }

    /// Clear the lease and persist the post-image. The supplied item must
    /// still carry the lease's run token; a mismatch means the lease was
    /// reclaimed and the write is rejected.
    pub fn release(&self, item: &WorkItem) -> Result<()> {
        let token = item
            .run_token
            .as_deref()
            .ok_or_else(|| SpindleError::Internal(format!("release of item {} without run token", item.id)))?;

        let mut cleared = item.clone();
        cleared.run_token = None;
        cleared.claimed_by = None;
        cleared.claimed_from = None;
        cleared.progress.last_heartbeat = None;
        cleared.stop_requested = false;

        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let rows = {
            let held: Option<String> = tx
                .query_row("SELECT run_token FROM items WHERE id = ?1", params![item.id], |row| {
                    row.get(0)
                })
                .optional()?
                .flatten();
            if held.as_deref() != Some(token) {
                return Err(SpindleError::Conflict(format!(
                    "item {} lease is no longer held by this execution",
                    item.id
                )));
            }
            update_item_row(&tx, &cleared)?
        };
        if rows == 0 {
            return Err(SpindleError::NotFound(format!("item {}", item.id)));
        }
        replace_episodes(&tx, item.id, &cleared.episodes)?;
        tx.commit()?;
        Ok(())
    }

    /// Crash recovery: return stale-heartbeat processing items to the status
    /// they were claimed from. Items with a current heartbeat are untouched.
    pub fn reset_stuck(&self, deadline_seconds: i64) -> Result<usize> {
        let cutoff = (Utc::now() - Duration::seconds(deadline_seconds))
            .format(SQLITE_TS_FORMAT)
            .to_string();
        let conn = self.lock();
        let rows = conn.execute(
            "UPDATE items SET
                status = COALESCE(claimed_from, CASE status
                    WHEN 'identifying' THEN 'pending'
                    WHEN 'ripping' THEN 'identified'
                    WHEN 'episode-identifying' THEN 'ripped'
                    WHEN 'encoding' THEN 'episode-identified'
                    WHEN 'subtitling' THEN 'encoded'
                    WHEN 'organizing' THEN 'encoded'
                END),
                claimed_from = NULL,
                run_token = NULL,
                claimed_by = NULL,
                last_heartbeat = NULL,
                progress_stage = NULL,
                progress_percent = 0,
                progress_message = NULL,
                updated_at = datetime('now')
             WHERE status IN ('identifying', 'ripping', 'episode-identifying',
                              'encoding', 'subtitling', 'organizing')
               AND (last_heartbeat IS NULL OR last_heartbeat < ?1)",
            params![cutoff],
        )?;
        Ok(rows)
    }

    // ----- Retry / stop -----

    /// Whole-item retry: `failed` (and, when named explicitly, `review`)
    /// items return to `pending` with their failure state cleared. Returns
    /// the number of items transitioned; non-failed items are no-ops.
    pub fn retry(&self, ids: Option<&[i64]>) -> Result<usize> {
        let conn = self.lock();
        let count = match ids {
            None => conn.execute(
                &format!("UPDATE items SET {} WHERE status = 'failed'", RETRY_SET),
                [],
            )?,
            Some(ids) => {
                let mut count = 0;
                for id in ids {
                    count += conn.execute(
                        &format!(
                            "UPDATE items SET {} WHERE id = ?1 AND status IN ('failed', 'review')",
                            RETRY_SET
                        ),
                        params![id],
                    )?;
                }
                count
            }
        };
        Ok(count)
    }

    /// Per-episode retry: clear one episode's failure and move the item to
    /// the earliest done status that regenerates the episode's missing
    /// asset. Only valid on `failed` items.
    pub fn retry_episode(&self, id: i64, episode_key: &str) -> Result<ItemStatus> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;

        let mut item = get_tx(&tx, id)?.ok_or_else(|| SpindleError::NotFound(format!("item {}", id)))?;
        if item.status != ItemStatus::Failed {
            return Err(SpindleError::Validation(format!(
                "item {} is {}, only failed items support per-episode retry",
                id, item.status
            )));
        }
        let episode = item
            .episode_mut(episode_key)
            .ok_or_else(|| SpindleError::EpisodeNotFound(format!("{} on item {}", episode_key, id)))?;

        // Rewind the episode to its last good asset.
        episode.stage = if episode.encoded_path.is_some() {
            EpisodeStage::Encoded
        } else if episode.ripped_path.is_some() {
            EpisodeStage::Ripped
        } else {
            EpisodeStage::Planned
        };
        episode.progress_percent = 0.0;
        episode.progress_message = None;

        let new_status = match episode.stage {
            EpisodeStage::Planned => ItemStatus::Identified,
            EpisodeStage::Ripped => ItemStatus::EpisodeIdentified,
            _ => ItemStatus::Encoded,
        };

        item.status = new_status;
        item.error = None;
        item.stop_requested = false;
        item.progress = Progress::default();

        update_item_row(&tx, &item)?;
        replace_episodes(&tx, item.id, &item.episodes)?;
        tx.commit()?;
        Ok(new_status)
    }

    /// Request cancellation. Running items get the interrupt flag and halt
    /// at their next checkpoint; waiting items are failed immediately with
    /// the reserved "user stop" review reason.
    pub fn stop(&self, ids: &[i64]) -> Result<Vec<StopOutcome>> {
        let conn = self.lock();
        let mut outcomes = Vec::with_capacity(ids.len());
        for &id in ids {
            let status: Option<String> = conn
                .query_row("SELECT status FROM items WHERE id = ?1", params![id], |row| {
                    row.get(0)
                })
                .optional()?;
            let Some(status) = status.as_deref().and_then(ItemStatus::parse) else {
                outcomes.push(StopOutcome::NotFound { id });
                continue;
            };

            if status.is_terminal() {
                outcomes.push(StopOutcome::AlreadyFinished { id, prior_status: status });
            } else if status.is_processing() {
                conn.execute(
                    "UPDATE items SET stop_requested = 1, updated_at = datetime('now') WHERE id = ?1",
                    params![id],
                )?;
                outcomes.push(StopOutcome::Updated {
                    id,
                    prior_status: status,
                    message: "will halt after current stage".to_string(),
                });
            } else {
                conn.execute(
                    "UPDATE items SET
                        status = 'failed',
                        error_message = 'Stopped by user',
                        needs_review = 1,
                        review_reason = ?1,
                        stop_requested = 0,
                        progress_stage = 'Failed',
                        progress_percent = 0,
                        updated_at = datetime('now')
                     WHERE id = ?2",
                    params![REVIEW_REASON_USER_STOP, id],
                )?;
                outcomes.push(StopOutcome::Updated {
                    id,
                    prior_status: status,
                    message: "stopped".to_string(),
                });
            }
        }
        Ok(outcomes)
    }

    // ----- Introspection -----

    pub fn stats(&self) -> Result<BTreeMap<String, i64>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM items GROUP BY status")?;
        let rows: Vec<(String, i64)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<_, _>>()?;
        Ok(rows.into_iter().collect())
    }

    /// Schema and integrity report for the `database.health` IPC method.
    pub fn database_health(&self) -> Result<crate::db::migrations::DatabaseHealth> {
        crate::db::migrations::health_report(&self.lock())
    }

    /// Test hook: overwrite a heartbeat to simulate staleness.
    #[cfg(test)]
    pub(crate) fn set_heartbeat_for_tests(&self, id: i64, timestamp: &str) {
        self.lock()
            .execute(
                "UPDATE items SET last_heartbeat = ?1 WHERE id = ?2",
                params![timestamp, id],
            )
            .unwrap();
    }

    pub fn health(&self) -> Result<QueueHealth> {
        let stats = self.stats()?;
        let mut health = QueueHealth::default();
        for (status, count) in &stats {
            let Some(status) = ItemStatus::parse(status) else {
                continue;
            };
            health.total += count;
            match status {
                ItemStatus::Completed => health.completed += count,
                ItemStatus::Failed => health.failed += count,
                ItemStatus::Review => health.review += count,
                s if s.is_processing() => health.processing += count,
                _ => health.pending += count,
            }
        }
        Ok(health)
    }
}

const RETRY_SET: &str = "status = 'pending',
    claimed_from = NULL,
    run_token = NULL,
    claimed_by = NULL,
    last_heartbeat = NULL,
    error_message = NULL,
    needs_review = 0,
    review_reason = NULL,
    stop_requested = 0,
    progress_stage = NULL,
    progress_percent = 0,
    progress_message = NULL,
    updated_at = datetime('now')";

// ----- Connection-level helpers (shared by store methods and transactions) -----

fn get_in(conn: &Connection, id: i64) -> Result<Option<WorkItem>> {
    let item = conn
        .query_row(
            &format!("SELECT {} FROM items WHERE id = ?1", ITEM_COLUMNS),
            params![id],
            row_to_item,
        )
        .optional()?;
    match item {
        Some(mut item) => {
            item.episodes = episodes_in(conn, id)?;
            Ok(Some(item))
        }
        None => Ok(None),
    }
}

fn get_tx(tx: &rusqlite::Transaction, id: i64) -> Result<Option<WorkItem>> {
    get_in(tx, id)
}

fn episodes_in(conn: &Connection, item_id: i64) -> Result<Vec<Episode>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM episodes WHERE item_id = ?1 ORDER BY season, episode, key",
        EPISODE_COLUMNS
    ))?;
    let episodes = stmt
        .query_map(params![item_id], map_episode)?
        .collect::<std::result::Result<_, _>>()?;
    Ok(episodes)
}

fn find_active_fingerprint_in(conn: &Connection, fingerprint: &str) -> Result<Option<WorkItem>> {
    let item = conn
        .query_row(
            &format!(
                "SELECT {} FROM items
                 WHERE disc_fingerprint = ?1
                   AND status NOT IN ('completed', 'failed', 'review')
                 ORDER BY id LIMIT 1",
                ITEM_COLUMNS
            ),
            params![fingerprint],
            row_to_item,
        )
        .optional()?;
    match item {
        Some(mut item) => {
            item.episodes = episodes_in(conn, item.id)?;
            Ok(Some(item))
        }
        None => Ok(None),
    }
}

fn update_item_row(conn: &Connection, item: &WorkItem) -> Result<usize> {
    let (source_path, disc_label, disc_fingerprint) = match &item.source {
        ItemSource::Disc { label, fingerprint } => {
            (None, Some(label.clone()), Some(fingerprint.clone()))
        }
        ItemSource::File { path } => (Some(path.to_string_lossy().to_string()), None, None),
    };
    let metadata = item
        .metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let rip_spec = item
        .rip_spec
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let (error_message, needs_review, review_reason) = match &item.error {
        Some(error) => (
            Some(error.message.clone()),
            error.needs_review,
            error.review_reason.clone(),
        ),
        None => (None, false, None),
    };

    let rows = conn.execute(
        "UPDATE items SET
            source_path = ?1,
            disc_label = ?2,
            disc_fingerprint = ?3,
            status = ?4,
            claimed_from = ?5,
            progress_stage = ?6,
            progress_percent = ?7,
            progress_message = ?8,
            last_heartbeat = ?9,
            metadata = ?10,
            rip_spec = ?11,
            ripped_path = ?12,
            encoded_path = ?13,
            final_path = ?14,
            error_message = ?15,
            needs_review = ?16,
            review_reason = ?17,
            stop_requested = ?18,
            run_token = ?19,
            claimed_by = ?20,
            updated_at = datetime('now')
         WHERE id = ?21",
        params![
            source_path,
            disc_label,
            disc_fingerprint,
            item.status.as_str(),
            item.claimed_from.map(|s| s.as_str()),
            item.progress.stage,
            item.progress.percent,
            item.progress.message,
            item.progress.last_heartbeat,
            metadata,
            rip_spec,
            item.ripped_path.as_ref().map(|p| p.to_string_lossy().to_string()),
            item.encoded_path.as_ref().map(|p| p.to_string_lossy().to_string()),
            item.final_path.as_ref().map(|p| p.to_string_lossy().to_string()),
            error_message,
            needs_review,
            review_reason,
            item.stop_requested,
            item.run_token,
            item.claimed_by,
            item.id,
        ],
    )?;
    Ok(rows)
}

fn replace_episodes(conn: &Connection, item_id: i64, episodes: &[Episode]) -> Result<()> {
    conn.execute("DELETE FROM episodes WHERE item_id = ?1", params![item_id])?;
    for ep in episodes {
        let (sub_source, sub_language, sub_score) = match &ep.subtitle {
            Some(sub) => (
                Some(sub.source.clone()),
                Some(sub.language.clone()),
                sub.match_score,
            ),
            None => (None, None, None),
        };
        conn.execute(
            "INSERT INTO episodes (item_id, key, season, episode, title, stage, runtime_seconds,
                ripped_path, encoded_path, final_path,
                subtitle_source, subtitle_language, subtitle_match_score,
                progress_percent, progress_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                item_id,
                ep.key,
                ep.season,
                ep.episode,
                ep.title,
                ep.stage.as_str(),
                ep.runtime_seconds,
                ep.ripped_path.as_ref().map(|p| p.to_string_lossy().to_string()),
                ep.encoded_path.as_ref().map(|p| p.to_string_lossy().to_string()),
                ep.final_path.as_ref().map(|p| p.to_string_lossy().to_string()),
                sub_source,
                sub_language,
                sub_score,
                ep.progress_percent,
                ep.progress_message,
            ],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests;
