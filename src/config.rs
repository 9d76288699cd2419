// Daemon configuration
//
// A single JSON file with serde defaults for every field, so an empty file
// (or no file at all) yields a working local setup. Only values the engine
// actually reads live here.

use std::fs;
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::{Result, SpindleError};
use crate::queue::item::ItemStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct Config {
    /// Holds per-run logs, the PID file, and the IPC socket.
    pub log_dir: PathBuf,
    pub db_path: PathBuf,
    pub staging_dir: PathBuf,
    pub library_dir: PathBuf,
    pub cache: CacheConfig,
    pub transcript_cache_dir: PathBuf,

    pub heartbeat_interval_seconds: i64,
    pub stale_heartbeat_multiplier: i64,
    pub poll_interval_seconds: u64,
    pub retention_days: u32,

    pub subtitles_enabled: bool,
    pub optical_drive: PathBuf,
    pub fingerprint_timeout_seconds: u64,
    pub label_read_timeout_seconds: u64,
    pub insert_debounce_seconds: i64,

    /// Claimable statuses per lane. The main lane carries everything except
    /// episode identification, which gets its own lane so a slow identify
    /// cannot starve ripping.
    pub main_lane: Vec<ItemStatus>,
    pub background_lane: Vec<ItemStatus>,

    pub tools: ToolsConfig,
    pub tmdb_api_key: Option<String>,
    pub ntfy: Option<NtfyConfig>,
    pub plex: Option<PlexConfig>,
    pub jellyfin: Option<JellyfinConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct CacheConfig {
    pub root: PathBuf,
    pub max_bytes: u64,
    pub min_free_ratio: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ToolsConfig {
    pub makemkvcon: Option<PathBuf>,
    pub drapto: Option<PathBuf>,
    pub ffprobe: Option<PathBuf>,
    pub mkvmerge: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct NtfyConfig {
    pub url: String,
    pub topic: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PlexConfig {
    pub url: String,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct JellyfinConfig {
    pub url: String,
    pub api_key: String,
}

fn data_dir() -> PathBuf {
    ProjectDirs::from("", "", "spindle")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".spindle"))
}

impl Default for Config {
    fn default() -> Self {
        let data = data_dir();
        Self {
            log_dir: data.join("logs"),
            db_path: data.join("spindle.db"),
            staging_dir: data.join("staging"),
            library_dir: data.join("library"),
            cache: CacheConfig::default(),
            transcript_cache_dir: data.join("transcripts"),
            heartbeat_interval_seconds: HEARTBEAT_INTERVAL_SECONDS,
            stale_heartbeat_multiplier: STALE_HEARTBEAT_MULTIPLIER,
            poll_interval_seconds: POLL_INTERVAL_SECONDS,
            retention_days: DEFAULT_RETENTION_DAYS,
            subtitles_enabled: true,
            optical_drive: PathBuf::from("/dev/sr0"),
            fingerprint_timeout_seconds: FINGERPRINT_TIMEOUT_SECONDS,
            label_read_timeout_seconds: LABEL_READ_TIMEOUT_SECONDS,
            insert_debounce_seconds: INSERT_DEBOUNCE_SECONDS,
            main_lane: vec![
                ItemStatus::Pending,
                ItemStatus::Identified,
                ItemStatus::EpisodeIdentified,
                ItemStatus::Encoded,
                ItemStatus::Subtitled,
            ],
            background_lane: vec![ItemStatus::Ripped],
            tools: ToolsConfig::default(),
            tmdb_api_key: None,
            ntfy: None,
            plex: None,
            jellyfin: None,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: data_dir().join("rip-cache"),
            max_bytes: DEFAULT_CACHE_MAX_BYTES,
            min_free_ratio: DEFAULT_MIN_FREE_RATIO,
        }
    }
}

impl Config {
    /// Default config file location (`~/.config/spindle/config.json`).
    pub fn default_path() -> PathBuf {
        ProjectDirs::from("", "", "spindle")
            .map(|dirs| dirs.config_dir().join("config.json"))
            .unwrap_or_else(|| PathBuf::from(".spindle/config.json"))
    }

    /// Load from an explicit path, or the default location. A missing file
    /// yields the defaults; a malformed file is a configuration error.
    pub fn load(path: Option<&Path>) -> Result<Config> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);
        if !path.exists() {
            return Ok(Config::default());
        }
        let raw = fs::read_to_string(&path)?;
        let config: Config = serde_json::from_str(&raw).map_err(|e| {
            SpindleError::Configuration(format!("failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.cache.min_free_ratio) {
            return Err(SpindleError::Configuration(format!(
                "cache.min_free_ratio must be in [0,1), got {}",
                self.cache.min_free_ratio
            )));
        }
        if self.heartbeat_interval_seconds <= 0 || self.stale_heartbeat_multiplier <= 0 {
            return Err(SpindleError::Configuration(
                "heartbeat interval and stale multiplier must be positive".to_string(),
            ));
        }
        for status in self.main_lane.iter().chain(&self.background_lane) {
            if status.as_processing_target().is_none() {
                return Err(SpindleError::Configuration(format!(
                    "status '{}' is not claimable and cannot appear in a lane",
                    status
                )));
            }
        }
        Ok(())
    }

    /// Create every directory the daemon writes into.
    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.log_dir)?;
        fs::create_dir_all(&self.staging_dir)?;
        fs::create_dir_all(&self.library_dir)?;
        fs::create_dir_all(&self.cache.root)?;
        fs::create_dir_all(&self.transcript_cache_dir)?;
        if let Some(parent) = self.db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    pub fn pid_path(&self) -> PathBuf {
        self.log_dir.join(PID_FILENAME)
    }

    pub fn socket_path(&self) -> PathBuf {
        self.log_dir.join(SOCKET_FILENAME)
    }

    /// Seconds without a heartbeat before a processing item counts as stuck.
    pub fn stale_deadline_seconds(&self) -> i64 {
        self.heartbeat_interval_seconds * self.stale_heartbeat_multiplier
    }
}
