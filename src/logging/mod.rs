// Log hub: one `log` backend, three sinks
//
// Every record fans out to (a) the per-run plain-text log file, (b) the
// per-run structured `.events` archive (JSON lines), and (c) a bounded
// in-memory ring that backs the IPC tail/stream endpoints. The ring hands
// out monotonically increasing sequence numbers; a follower that falls more
// than the ring capacity behind is told how much it missed instead of
// silently skipping.

use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use chrono::Utc;
use log::{Level, LevelFilter, Log, Metadata, Record};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::Result;

/// One structured log event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub seq: u64,
    pub timestamp: String,
    pub level: String,
    pub component: String,
    pub message: String,
    pub item_id: Option<i64>,
    pub lane: Option<String>,
    pub correlation_id: Option<String>,
    pub alert: bool,
}

/// Filters for the stream endpoint. All present fields must match.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogFilters {
    pub component: Option<String>,
    pub lane: Option<String>,
    pub correlation_id: Option<String>,
    pub item_id: Option<i64>,
    pub min_level: Option<String>,
    pub alerts_only: bool,
    pub search: Option<String>,
}

impl LogFilters {
    fn matches(&self, record: &LogRecord) -> bool {
        if let Some(component) = &self.component {
            if !record.component.contains(component.as_str()) {
                return false;
            }
        }
        if let Some(lane) = &self.lane {
            if record.lane.as_deref() != Some(lane.as_str()) {
                return false;
            }
        }
        if let Some(correlation) = &self.correlation_id {
            if record.correlation_id.as_deref() != Some(correlation.as_str()) {
                return false;
            }
        }
        if let Some(item_id) = self.item_id {
            if record.item_id != Some(item_id) {
                return false;
            }
        }
        if let Some(min) = &self.min_level {
            if level_rank(&record.level) < level_rank(min) {
                return false;
            }
        }
        if self.alerts_only && !record.alert {
            return false;
        }
        if let Some(search) = &self.search {
            let needle = search.to_lowercase();
            if !record.message.to_lowercase().contains(&needle) {
                return false;
            }
        }
        true
    }
}

fn level_rank(level: &str) -> u8 {
    match level.to_ascii_uppercase().as_str() {
        "TRACE" => 0,
        "DEBUG" => 1,
        "INFO" => 2,
        "WARN" => 3,
        "ERROR" => 4,
        _ => 2,
    }
}

static ITEM_RE: std::sync::LazyLock<Regex> =
    std::sync::LazyLock::new(|| Regex::new(r"^Item (\d+):").unwrap());

struct HubInner {
    log_file: Option<fs::File>,
    events_file: Option<fs::File>,
    ring: VecDeque<LogRecord>,
    next_seq: u64,
}

pub struct LogHub {
    inner: Mutex<HubInner>,
    arrived: Condvar,
    capacity: usize,
}

impl LogHub {
    fn new(log_file: Option<fs::File>, events_file: Option<fs::File>) -> Self {
        Self {
            inner: Mutex::new(HubInner {
                log_file,
                events_file,
                ring: VecDeque::with_capacity(LOG_RING_CAPACITY),
                next_seq: 0,
            }),
            arrived: Condvar::new(),
            capacity: LOG_RING_CAPACITY,
        }
    }

    /// In-memory hub with no file sinks, for tests.
    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self::new(None, None))
    }

    pub fn publish(
        &self,
        level: Level,
        component: &str,
        message: String,
    ) {
        let lane = std::thread::current()
            .name()
            .filter(|name| name.starts_with("lane-"))
            .map(str::to_string);
        let item_id = ITEM_RE
            .captures(&message)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok());

        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let record = LogRecord {
            seq: inner.next_seq,
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string(),
            component: component.to_string(),
            message,
            item_id,
            lane,
            correlation_id: None,
            alert: level <= Level::Warn,
        };
        inner.next_seq += 1;

        if let Some(file) = inner.log_file.as_mut() {
            let _ = writeln!(
                file,
                "{} {:5} [{}] {}",
                record.timestamp, record.level, record.component, record.message
            );
        }
        if let Some(file) = inner.events_file.as_mut() {
            if let Ok(json) = serde_json::to_string(&record) {
                let _ = writeln!(file, "{}", json);
            }
        }

        if inner.ring.len() == self.capacity {
            inner.ring.pop_front();
        }
        inner.ring.push_back(record);
        drop(inner);
        self.arrived.notify_all();
    }

    /// Plain-text tail. `offset` is a sequence cursor; `None` starts at the
    /// newest `limit` lines. With `follow`, blocks up to `wait` for news.
    pub fn tail(
        &self,
        offset: Option<u64>,
        limit: usize,
        follow: bool,
        wait: Duration,
    ) -> (Vec<String>, u64) {
        let (records, next, _) = self.collect(offset, limit, follow, wait, &LogFilters::default());
        let lines = records
            .iter()
            .map(|r| format!("{} {:5} [{}] {}", r.timestamp, r.level, r.component, r.message))
            .collect();
        (lines, next)
    }

    /// Structured stream with filters. Returns `(events, next_cursor,
    /// dropped)` where `dropped` counts events that aged out of the ring
    /// before the caller's cursor.
    pub fn stream(
        &self,
        since: Option<u64>,
        limit: usize,
        follow: bool,
        wait: Duration,
        filters: &LogFilters,
    ) -> (Vec<LogRecord>, u64, u64) {
        self.collect(since, limit, follow, wait, filters)
    }

    fn collect(
        &self,
        since: Option<u64>,
        limit: usize,
        follow: bool,
        wait: Duration,
        filters: &LogFilters,
    ) -> (Vec<LogRecord>, u64, u64) {
        let limit = limit.clamp(1, self.capacity);
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let cursor = match since {
            Some(seq) => seq,
            // Default to the newest `limit` events
            None => {
                let newest = inner.next_seq;
                newest.saturating_sub(limit as u64)
            }
        };

        loop {
            let head = inner
                .ring
                .front()
                .map(|r| r.seq)
                .unwrap_or(inner.next_seq);
            let dropped = head.saturating_sub(cursor);

            let matched: Vec<LogRecord> = inner
                .ring
                .iter()
                .filter(|r| r.seq >= cursor)
                .filter(|r| filters.matches(r))
                .take(limit)
                .cloned()
                .collect();

            if !matched.is_empty() || !follow {
                let next = matched.last().map(|r| r.seq + 1).unwrap_or_else(|| inner.next_seq.max(cursor));
                return (matched, next, dropped);
            }

            // Follow: wait for new events or the budget to expire
            let (guard, timeout) = self
                .arrived
                .wait_timeout(inner, wait)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            inner = guard;
            if timeout.timed_out() {
                let next = inner.next_seq.max(cursor);
                return (Vec::new(), next, dropped);
            }
        }
    }
}

struct HubLogger {
    hub: Arc<LogHub>,
    min_level: LevelFilter,
}

impl Log for HubLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.min_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        self.hub
            .publish(record.level(), record.target(), record.args().to_string());
    }

    fn flush(&self) {}
}

/// Create the per-run files, point the `spindle.log` symlink at the new
/// run, sweep expired runs, and install the hub as the global logger.
pub fn init(log_dir: &Path, retention_days: u32) -> Result<Arc<LogHub>> {
    fs::create_dir_all(log_dir)?;

    let run_stamp = Utc::now().format("%Y-%m-%dT%H-%M-%SZ").to_string();
    let log_path = log_dir.join(format!("{}{}{}", LOG_FILE_PREFIX, run_stamp, LOG_FILE_SUFFIX));
    let events_path = log_dir.join(format!("{}{}{}", LOG_FILE_PREFIX, run_stamp, EVENTS_FILE_SUFFIX));

    let log_file = fs::File::create(&log_path)?;
    let events_file = fs::File::create(&events_path)?;

    let link = log_dir.join(CURRENT_LOG_LINK);
    let _ = fs::remove_file(&link);
    #[cfg(unix)]
    let _ = std::os::unix::fs::symlink(&log_path, &link);

    sweep_expired_runs(log_dir, retention_days, &log_path, &events_path);

    let hub = Arc::new(LogHub::new(Some(log_file), Some(events_file)));
    let logger = HubLogger {
        hub: Arc::clone(&hub),
        min_level: LevelFilter::Debug,
    };
    if log::set_boxed_logger(Box::new(logger)).is_ok() {
        log::set_max_level(LevelFilter::Debug);
    }
    Ok(hub)
}

/// Remove run files older than the retention window, always keeping the
/// current run.
fn sweep_expired_runs(log_dir: &Path, retention_days: u32, current_log: &Path, current_events: &Path) {
    let cutoff = std::time::SystemTime::now()
        - Duration::from_secs(retention_days as u64 * 24 * 60 * 60);
    let Ok(entries) = fs::read_dir(log_dir) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        let is_run_file = name.starts_with(LOG_FILE_PREFIX)
            && (name.ends_with(LOG_FILE_SUFFIX) || name.ends_with(EVENTS_FILE_SUFFIX));
        if !is_run_file || path == current_log || path == current_events {
            continue;
        }
        let expired = entry
            .metadata()
            .and_then(|m| m.modified())
            .map(|modified| modified < cutoff)
            .unwrap_or(false);
        if expired {
            if let Err(e) = fs::remove_file(&path) {
                log::warn!("Failed to remove expired log {}: {}", path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(hub: &LogHub, count: usize) {
        for i in 0..count {
            hub.publish(Level::Info, "spindle::test", format!("event {}", i));
        }
    }

    #[test]
    fn test_tail_returns_newest_and_cursor_resumes() {
        let hub = LogHub::in_memory();
        fill(&hub, 5);

        let (lines, next) = hub.tail(None, 3, false, Duration::ZERO);
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("event 2"));
        assert_eq!(next, 5);

        // Nothing new: empty page, cursor unchanged
        let (lines, next) = hub.tail(Some(next), 10, false, Duration::ZERO);
        assert!(lines.is_empty());
        assert_eq!(next, 5);

        fill(&hub, 1);
        let (lines, next) = hub.tail(Some(next), 10, false, Duration::ZERO);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("event 0"));
        assert_eq!(next, 6);
    }

    #[test]
    fn test_stream_reports_dropped_events() {
        let hub = LogHub::in_memory();
        fill(&hub, LOG_RING_CAPACITY + 10);

        let (_, _, dropped) = hub.stream(Some(0), 5, false, Duration::ZERO, &LogFilters::default());
        assert_eq!(dropped, 10);
    }

    #[test]
    fn test_stream_filters() {
        let hub = LogHub::in_memory();
        hub.publish(Level::Info, "spindle::workflow", "Item 7: Encoding started".to_string());
        hub.publish(Level::Warn, "spindle::cache", "eviction skipped".to_string());
        hub.publish(Level::Info, "spindle::workflow", "Item 9: Encoding started".to_string());

        let filters = LogFilters {
            item_id: Some(7),
            ..LogFilters::default()
        };
        let (events, _, _) = hub.stream(Some(0), 10, false, Duration::ZERO, &filters);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].item_id, Some(7));

        let filters = LogFilters {
            min_level: Some("warn".to_string()),
            ..LogFilters::default()
        };
        let (events, _, _) = hub.stream(Some(0), 10, false, Duration::ZERO, &filters);
        assert_eq!(events.len(), 1);
        assert!(events[0].alert);

        let filters = LogFilters {
            search: Some("eviction".to_string()),
            ..LogFilters::default()
        };
        let (events, _, _) = hub.stream(Some(0), 10, false, Duration::ZERO, &filters);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].component, "spindle::cache");
    }

    #[test]
    fn test_follow_wakes_on_publish() {
        let hub = LogHub::in_memory();
        let hub_clone = Arc::clone(&hub);
        let handle = std::thread::spawn(move || {
            hub_clone.stream(Some(0), 10, true, Duration::from_secs(5), &LogFilters::default())
        });
        std::thread::sleep(Duration::from_millis(50));
        hub.publish(Level::Info, "spindle::test", "wake up".to_string());

        let (events, next, _) = handle.join().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(next, 1);
    }

    #[test]
    fn test_follow_times_out_empty() {
        let hub = LogHub::in_memory();
        let (events, next, _) =
            hub.stream(Some(0), 10, true, Duration::from_millis(30), &LogFilters::default());
        assert!(events.is_empty());
        assert_eq!(next, 0);
    }
}
