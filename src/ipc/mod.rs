// IPC protocol: framing and message types
//
// Length-prefixed JSON over a local socket: a u32 big-endian byte count,
// then the payload. The protocol is private to the process tree; there is
// no compatibility contract beyond "same build of daemon and CLI".

pub mod client;
pub mod server;

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::cache::CacheStats;
use crate::constants::MAX_FRAME_BYTES;
use crate::db::migrations::DatabaseHealth;
use crate::disc::{InsertOutcome, WatcherStatus};
use crate::error::{Result, SpindleError};
use crate::logging::{LogFilters, LogRecord};
use crate::queue::{ClearScope, ItemStatus, QueueHealth, StopOutcome, WorkItem};
use crate::stages::StageHealth;
use crate::workflow::LaneActivity;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum Request {
    Status,
    Stop,
    QueueList {
        statuses: Option<Vec<ItemStatus>>,
    },
    QueueStatus,
    QueueHealth,
    QueueDescribe {
        id: i64,
    },
    QueueRemove {
        ids: Vec<i64>,
    },
    QueueClear {
        scope: ClearScope,
    },
    QueueResetStuck,
    QueueRetry {
        ids: Option<Vec<i64>>,
    },
    QueueRetryEpisode {
        id: i64,
        episode_key: String,
    },
    QueueStop {
        ids: Vec<i64>,
    },
    QueueAddFile {
        path: PathBuf,
    },
    ProcessCached {
        fingerprint: String,
        #[serde(default)]
        allow_duplicate: bool,
    },
    DiscPause,
    DiscResume,
    DiscDetected {
        device: PathBuf,
        #[serde(default)]
        allow_duplicate: bool,
    },
    CacheStats,
    CacheRemove {
        number: Option<usize>,
        fingerprint: Option<String>,
    },
    CacheClear,
    DatabaseHealth,
    NotificationTest,
    LogTail {
        offset: Option<u64>,
        limit: usize,
        #[serde(default)]
        follow: bool,
        #[serde(default)]
        wait_ms: u64,
    },
    LogStream {
        since: Option<u64>,
        limit: usize,
        #[serde(default)]
        follow: bool,
        #[serde(default)]
        wait_ms: u64,
        #[serde(default)]
        filters: LogFilters,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub pid: u32,
    pub uptime_seconds: u64,
    pub queue: QueueHealth,
    pub lanes: Vec<LaneActivity>,
    pub watcher: WatcherStatus,
    pub stages: Vec<StageHealth>,
    pub cache_entries: usize,
    pub cache_total_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", content = "data", rename_all = "snake_case")]
pub enum Response {
    Ok,
    Error {
        kind: String,
        message: String,
    },
    Status(Box<DaemonStatus>),
    Items(Vec<WorkItem>),
    Item(Box<WorkItem>),
    Stats(BTreeMap<String, i64>),
    Health(QueueHealth),
    Count {
        count: usize,
    },
    StopOutcomes(Vec<StopOutcome>),
    RetryEpisode {
        new_status: ItemStatus,
    },
    Inserted(InsertOutcome),
    Cache(Box<CacheStats>),
    CacheRemoved {
        fingerprint: String,
        bytes_freed: u64,
    },
    CacheCleared {
        count: usize,
        bytes_freed: u64,
    },
    Database(Box<DatabaseHealth>),
    Watcher(WatcherStatus),
    LogLines {
        lines: Vec<String>,
        offset: u64,
    },
    LogEvents {
        events: Vec<LogRecord>,
        next: u64,
        dropped: u64,
    },
}

impl Response {
    pub fn error(error: &SpindleError) -> Self {
        Response::Error {
            kind: error.kind().as_str().to_string(),
            message: error.to_string(),
        }
    }
}

/// Write one length-prefixed JSON frame.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, message: &T) -> Result<()> {
    let payload = serde_json::to_vec(message)?;
    if payload.len() as u32 > MAX_FRAME_BYTES {
        return Err(SpindleError::Validation(format!(
            "frame of {} bytes exceeds the {} byte limit",
            payload.len(),
            MAX_FRAME_BYTES
        )));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer closed cleanly between frames.
pub fn read_frame<R: Read, T: for<'de> Deserialize<'de>>(reader: &mut R) -> Result<Option<T>> {
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_FRAME_BYTES {
        return Err(SpindleError::Validation(format!(
            "frame of {} bytes exceeds the {} byte limit",
            len, MAX_FRAME_BYTES
        )));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    Ok(Some(serde_json::from_slice(&payload)?))
}
