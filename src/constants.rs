// Spindle constants
// Defaults here can be overridden through the config file where a matching
// Config field exists.

// Lease / heartbeat
pub const HEARTBEAT_INTERVAL_SECONDS: i64 = 30;
pub const STALE_HEARTBEAT_MULTIPLIER: i64 = 5;

// Workflow
pub const POLL_INTERVAL_SECONDS: u64 = 1;
pub const PROGRESS_FLUSH_MILLIS: u64 = 500;

// Disc watcher
pub const FINGERPRINT_TIMEOUT_SECONDS: u64 = 120;
pub const LABEL_READ_TIMEOUT_SECONDS: u64 = 10;
pub const INSERT_DEBOUNCE_SECONDS: i64 = 5;

// Rip cache
pub const CACHE_METADATA_FILENAME: &str = "meta.json";
pub const CACHE_TEMP_PREFIX: &str = ".spindle-tmp-";
pub const DEFAULT_CACHE_MAX_BYTES: u64 = 200 * 1024 * 1024 * 1024; // 200 GiB
pub const DEFAULT_MIN_FREE_RATIO: f64 = 0.05;

// Disc-ID cache
pub const DISC_ID_CACHE_FILENAME: &str = "disc-ids.json";

// Fingerprinting
pub const FINGERPRINT_CHUNK_SIZE: usize = 1_048_576; // 1MB
pub const FINGERPRINT_MAX_FILES: usize = 32;

// Logging
pub const LOG_RING_CAPACITY: usize = 4096;
pub const LOG_FILE_PREFIX: &str = "spindle-";
pub const LOG_FILE_SUFFIX: &str = ".log";
pub const EVENTS_FILE_SUFFIX: &str = ".events";
pub const CURRENT_LOG_LINK: &str = "spindle.log";
pub const DEFAULT_RETENTION_DAYS: u32 = 14;

// IPC
pub const PID_FILENAME: &str = "spindle.pid";
pub const SOCKET_FILENAME: &str = "spindle.sock";
pub const MAX_FRAME_BYTES: u32 = 8 * 1024 * 1024;
pub const DEFAULT_FOLLOW_WAIT_MILLIS: u64 = 5_000;

// Manual file intake
pub const SUPPORTED_VIDEO_EXTENSIONS: [&str; 3] = ["mkv", "mp4", "avi"];

// Review reason reserved for operator-initiated stops
pub const REVIEW_REASON_USER_STOP: &str = "user stop";
