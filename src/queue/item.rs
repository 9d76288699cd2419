// Work item model: statuses, episodes, progress

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::media::{MediaMetadata, RipSpec};

/// Every status a work item can hold. Processing statuses double as the
/// lease marker; terminal statuses are never left automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemStatus {
    Pending,
    Identifying,
    Identified,
    Ripping,
    Ripped,
    EpisodeIdentifying,
    EpisodeIdentified,
    Encoding,
    Encoded,
    Subtitling,
    Subtitled,
    Organizing,
    Completed,
    Review,
    Failed,
}

impl ItemStatus {
    pub const ALL: [ItemStatus; 15] = [
        ItemStatus::Pending,
        ItemStatus::Identifying,
        ItemStatus::Identified,
        ItemStatus::Ripping,
        ItemStatus::Ripped,
        ItemStatus::EpisodeIdentifying,
        ItemStatus::EpisodeIdentified,
        ItemStatus::Encoding,
        ItemStatus::Encoded,
        ItemStatus::Subtitling,
        ItemStatus::Subtitled,
        ItemStatus::Organizing,
        ItemStatus::Completed,
        ItemStatus::Review,
        ItemStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Identifying => "identifying",
            ItemStatus::Identified => "identified",
            ItemStatus::Ripping => "ripping",
            ItemStatus::Ripped => "ripped",
            ItemStatus::EpisodeIdentifying => "episode-identifying",
            ItemStatus::EpisodeIdentified => "episode-identified",
            ItemStatus::Encoding => "encoding",
            ItemStatus::Encoded => "encoded",
            ItemStatus::Subtitling => "subtitling",
            ItemStatus::Subtitled => "subtitled",
            ItemStatus::Organizing => "organizing",
            ItemStatus::Completed => "completed",
            ItemStatus::Review => "review",
            ItemStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<ItemStatus> {
        ItemStatus::ALL.iter().copied().find(|v| v.as_str() == s)
    }

    /// `completed`, `failed`, and `review` are never left automatically.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemStatus::Completed | ItemStatus::Failed | ItemStatus::Review
        )
    }

    /// A processing status marks an item as leased by a stage execution.
    pub fn is_processing(&self) -> bool {
        matches!(
            self,
            ItemStatus::Identifying
                | ItemStatus::Ripping
                | ItemStatus::EpisodeIdentifying
                | ItemStatus::Encoding
                | ItemStatus::Subtitling
                | ItemStatus::Organizing
        )
    }

    /// The processing status `claim_next` flips a claimable status into.
    /// `encoded` forks on configuration: subtitling when subtitles are
    /// enabled, straight to organizing otherwise.
    pub fn processing_for(&self, subtitles_enabled: bool) -> Option<ItemStatus> {
        match self {
            ItemStatus::Pending => Some(ItemStatus::Identifying),
            ItemStatus::Identified => Some(ItemStatus::Ripping),
            ItemStatus::Ripped => Some(ItemStatus::EpisodeIdentifying),
            ItemStatus::EpisodeIdentified => Some(ItemStatus::Encoding),
            ItemStatus::Encoded if subtitles_enabled => Some(ItemStatus::Subtitling),
            ItemStatus::Encoded => Some(ItemStatus::Organizing),
            ItemStatus::Subtitled => Some(ItemStatus::Organizing),
            _ => None,
        }
    }

    /// Whether this status may appear in a lane's claimable set.
    pub fn as_processing_target(&self) -> Option<ItemStatus> {
        self.processing_for(true)
    }

    /// The done status a successful stage leaves behind.
    pub fn done_status(&self) -> Option<ItemStatus> {
        match self {
            ItemStatus::Identifying => Some(ItemStatus::Identified),
            ItemStatus::Ripping => Some(ItemStatus::Ripped),
            ItemStatus::EpisodeIdentifying => Some(ItemStatus::EpisodeIdentified),
            ItemStatus::Encoding => Some(ItemStatus::Encoded),
            ItemStatus::Subtitling => Some(ItemStatus::Subtitled),
            ItemStatus::Organizing => Some(ItemStatus::Completed),
            _ => None,
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the media came from. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemSource {
    Disc { label: String, fingerprint: String },
    File { path: PathBuf },
}

impl ItemSource {
    pub fn fingerprint(&self) -> Option<&str> {
        match self {
            ItemSource::Disc { fingerprint, .. } => Some(fingerprint),
            ItemSource::File { .. } => None,
        }
    }

    /// Human-readable name before identification has run.
    pub fn display_name(&self) -> String {
        match self {
            ItemSource::Disc { label, .. } if !label.is_empty() => label.clone(),
            ItemSource::Disc { fingerprint, .. } => format!("disc {}", &fingerprint[..fingerprint.len().min(12)]),
            ItemSource::File { path } => path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.display().to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub stage: Option<String>,
    pub percent: f64,
    pub message: Option<String>,
    pub last_heartbeat: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemError {
    pub message: String,
    pub needs_review: bool,
    pub review_reason: Option<String>,
}

/// Per-episode pipeline position, coarser than the item status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EpisodeStage {
    Planned,
    Ripped,
    Encoded,
    Final,
    Failed,
}

impl EpisodeStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            EpisodeStage::Planned => "planned",
            EpisodeStage::Ripped => "ripped",
            EpisodeStage::Encoded => "encoded",
            EpisodeStage::Final => "final",
            EpisodeStage::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<EpisodeStage> {
        [
            EpisodeStage::Planned,
            EpisodeStage::Ripped,
            EpisodeStage::Encoded,
            EpisodeStage::Final,
            EpisodeStage::Failed,
        ]
        .into_iter()
        .find(|v| v.as_str() == s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleInfo {
    pub source: String,
    pub language: String,
    pub match_score: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub id: i64,
    /// e.g. `s01e05`; unique within the item.
    pub key: String,
    pub season: i32,
    pub episode: i32,
    pub title: Option<String>,
    pub stage: EpisodeStage,
    pub runtime_seconds: Option<i64>,
    pub ripped_path: Option<PathBuf>,
    pub encoded_path: Option<PathBuf>,
    pub final_path: Option<PathBuf>,
    pub subtitle: Option<SubtitleInfo>,
    pub progress_percent: f64,
    pub progress_message: Option<String>,
}

impl Episode {
    pub fn new(key: impl Into<String>, season: i32, episode: i32) -> Self {
        Self {
            id: 0,
            key: key.into(),
            season,
            episode,
            title: None,
            stage: EpisodeStage::Planned,
            runtime_seconds: None,
            ripped_path: None,
            encoded_path: None,
            final_path: None,
            subtitle: None,
            progress_percent: 0.0,
            progress_message: None,
        }
    }
}

/// Counts folded from the episode list; never stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpisodeTotals {
    pub planned: usize,
    pub ripped: usize,
    pub encoded: usize,
    pub final_count: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: i64,
    pub source: ItemSource,
    pub status: ItemStatus,
    /// Status the current lease was claimed from; restored by `reset_stuck`.
    pub claimed_from: Option<ItemStatus>,
    pub progress: Progress,
    pub metadata: Option<MediaMetadata>,
    pub rip_spec: Option<RipSpec>,
    pub ripped_path: Option<PathBuf>,
    pub encoded_path: Option<PathBuf>,
    pub final_path: Option<PathBuf>,
    pub error: Option<ItemError>,
    pub stop_requested: bool,
    pub run_token: Option<String>,
    pub claimed_by: Option<String>,
    pub episodes: Vec<Episode>,
    pub created_at: String,
    pub updated_at: String,
}

impl WorkItem {
    /// Title for logs and notifications: identified title when available,
    /// else the source name.
    pub fn display_title(&self) -> String {
        self.metadata
            .as_ref()
            .map(|m| m.display_title())
            .unwrap_or_else(|| self.source.display_name())
    }

    pub fn episode_totals(&self) -> EpisodeTotals {
        let mut totals = EpisodeTotals::default();
        for ep in &self.episodes {
            match ep.stage {
                EpisodeStage::Planned => totals.planned += 1,
                EpisodeStage::Ripped => totals.ripped += 1,
                EpisodeStage::Encoded => totals.encoded += 1,
                EpisodeStage::Final => totals.final_count += 1,
                EpisodeStage::Failed => totals.failed += 1,
            }
        }
        totals
    }

    pub fn episode(&self, key: &str) -> Option<&Episode> {
        self.episodes.iter().find(|e| e.key == key)
    }

    pub fn episode_mut(&mut self, key: &str) -> Option<&mut Episode> {
        self.episodes.iter_mut().find(|e| e.key == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip() {
        for status in ItemStatus::ALL {
            assert_eq!(ItemStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ItemStatus::parse("episode-identifying"), Some(ItemStatus::EpisodeIdentifying));
        assert_eq!(ItemStatus::parse("bogus"), None);
    }

    #[test]
    fn test_processing_done_pairs() {
        assert_eq!(ItemStatus::Identifying.done_status(), Some(ItemStatus::Identified));
        assert_eq!(ItemStatus::Organizing.done_status(), Some(ItemStatus::Completed));
        assert_eq!(ItemStatus::Completed.done_status(), None);
    }

    #[test]
    fn test_encoded_forks_on_subtitles() {
        assert_eq!(
            ItemStatus::Encoded.processing_for(true),
            Some(ItemStatus::Subtitling)
        );
        assert_eq!(
            ItemStatus::Encoded.processing_for(false),
            Some(ItemStatus::Organizing)
        );
    }

    #[test]
    fn test_terminal_statuses_not_claimable() {
        for status in [ItemStatus::Completed, ItemStatus::Failed, ItemStatus::Review] {
            assert!(status.is_terminal());
            assert_eq!(status.as_processing_target(), None);
        }
    }

    #[test]
    fn test_episode_totals_fold() {
        let mut item = WorkItem {
            id: 1,
            source: ItemSource::Disc {
                label: "TEST".to_string(),
                fingerprint: "fp".to_string(),
            },
            status: ItemStatus::Pending,
            claimed_from: None,
            progress: Progress::default(),
            metadata: None,
            rip_spec: None,
            ripped_path: None,
            encoded_path: None,
            final_path: None,
            error: None,
            stop_requested: false,
            run_token: None,
            claimed_by: None,
            episodes: Vec::new(),
            created_at: String::new(),
            updated_at: String::new(),
        };
        assert_eq!(item.episode_totals(), EpisodeTotals::default());

        item.episodes.push(Episode::new("s01e01", 1, 1));
        let mut done = Episode::new("s01e02", 1, 2);
        done.stage = EpisodeStage::Final;
        item.episodes.push(done);

        let totals = item.episode_totals();
        assert_eq!(totals.planned, 1);
        assert_eq!(totals.final_count, 1);
    }
}
