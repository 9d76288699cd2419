// Encoding stage
//
// Drives drapto over the ripped assets: the primary file for movies, one
// pass per ripped episode for series. Audio-track classification (commentary
// detection) is a pluggable service; the default keeps every track.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::transcripts::TranscriptCache;
use crate::error::{Result, SpindleError};
use crate::queue::{EpisodeStage, ItemStatus, WorkItem};
use crate::services::Services;
use crate::stages::{Stage, StageContext, StageHealth};
use crate::tools::{self, drapto, ffprobe};

/// Verdict for one audio track of an input file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackDecision {
    Keep,
    Commentary,
    Drop,
}

/// Classification seam. The production implementation transcribes a sample
/// of each track (caching transcripts) and asks a language model; the
/// default keeps everything.
pub trait TrackClassifier: Send + Sync {
    fn classify(
        &self,
        file: &Path,
        tracks: &[ffprobe::AudioTrack],
        transcripts: &TranscriptCache,
    ) -> Result<Vec<TrackDecision>>;
}

/// Keeps every track; classification disabled.
pub struct KeepAllClassifier;

impl TrackClassifier for KeepAllClassifier {
    fn classify(
        &self,
        _file: &Path,
        tracks: &[ffprobe::AudioTrack],
        _transcripts: &TranscriptCache,
    ) -> Result<Vec<TrackDecision>> {
        Ok(vec![TrackDecision::Keep; tracks.len()])
    }
}

pub struct EncodeStage {
    services: Arc<Services>,
    classifier: Box<dyn TrackClassifier>,
}

impl EncodeStage {
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            services,
            classifier: Box::new(KeepAllClassifier),
        }
    }

    pub fn with_classifier(services: Arc<Services>, classifier: Box<dyn TrackClassifier>) -> Self {
        Self { services, classifier }
    }

    fn staging_dir(&self, item: &WorkItem) -> PathBuf {
        self.services
            .config
            .staging_dir
            .join(format!("item-{}", item.id))
    }

    fn staging_file(&self, item: &WorkItem, name: &str) -> PathBuf {
        self.staging_dir(item).join(name)
    }

    fn classify_tracks(&self, input: &Path) {
        let info = match ffprobe::probe(&self.services.config.tools, input) {
            Ok(info) => info,
            Err(e) => {
                log::debug!("Track probe failed for {}: {}", input.display(), e);
                return;
            }
        };
        match self
            .classifier
            .classify(input, &info.audio_tracks, &self.services.transcripts)
        {
            Ok(decisions) => {
                let commentary = decisions.iter().filter(|d| **d == TrackDecision::Commentary).count();
                if commentary > 0 {
                    log::info!(
                        "{} commentary track(s) detected in {}",
                        commentary,
                        input.display()
                    );
                }
            }
            Err(e) => log::warn!("Track classification failed for {}: {}", input.display(), e),
        }
    }

    fn encode_one(
        &self,
        ctx: &StageContext,
        input: &Path,
        output: &Path,
        base_percent: f64,
        span: f64,
        label: &str,
    ) -> Result<()> {
        if !input.exists() {
            return Err(SpindleError::Validation(format!(
                "ripped asset missing: {} (retry the rip)",
                input.display()
            )));
        }
        self.classify_tracks(input);
        drapto::encode(
            &self.services.config.tools,
            input,
            output,
            |percent, stage| {
                let scaled = base_percent + (percent / 100.0) * span;
                let _ = ctx.heartbeat(scaled, &format!("{}: {}", label, stage));
            },
            || ctx.should_stop(),
        )
    }
}

impl Stage for EncodeStage {
    fn name(&self) -> &'static str {
        "Encoding"
    }

    fn processing_status(&self) -> ItemStatus {
        ItemStatus::Encoding
    }

    fn done_status(&self) -> ItemStatus {
        ItemStatus::Encoded
    }

    fn prepare(&self, _ctx: &StageContext, item: &mut WorkItem) -> Result<()> {
        if item.ripped_path.is_none() && item.episodes.iter().all(|e| e.ripped_path.is_none()) {
            return Err(SpindleError::Validation(
                "cannot encode before ripping".to_string(),
            ));
        }
        std::fs::create_dir_all(self.staging_dir(item))?;
        Ok(())
    }

    fn execute(&self, ctx: &StageContext, item: &mut WorkItem) -> Result<()> {
        // Pin the cache entry for the duration; eviction must not pull the
        // ripped inputs out from under the encoder.
        let _cache_lease = item
            .source
            .fingerprint()
            .map(|fp| self.services.cache.reserve(fp));
        let is_tv = item.metadata.as_ref().map(|m| m.is_tv()).unwrap_or(false);

        if !is_tv {
            let input = item
                .ripped_path
                .clone()
                .ok_or_else(|| SpindleError::Validation("no ripped file to encode".to_string()))?;
            let name = input
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "encoded.mkv".to_string());
            let output = self.staging_file(item, &name);

            ctx.force_heartbeat(0.0, "encoding feature")?;
            self.encode_one(ctx, &input, &output, 0.0, 100.0, "feature")?;
            item.encoded_path = Some(output);
            ctx.force_heartbeat(100.0, "encode complete")?;
            return Ok(());
        }

        // Series: one pass per episode still carrying only a ripped asset
        let pending: Vec<String> = item
            .episodes
            .iter()
            .filter(|e| e.stage == EpisodeStage::Ripped && e.ripped_path.is_some())
            .map(|e| e.key.clone())
            .collect();
        if pending.is_empty() {
            return Err(SpindleError::Validation(
                "no episodes with ripped assets to encode".to_string(),
            ));
        }

        let span = 100.0 / pending.len() as f64;
        for (i, key) in pending.iter().enumerate() {
            ctx.check_stop()?;
            let (input, output) = {
                let episode = item
                    .episode(key)
                    .ok_or_else(|| SpindleError::EpisodeNotFound(key.clone()))?;
                let input = episode
                    .ripped_path
                    .clone()
                    .ok_or_else(|| SpindleError::Internal(format!("episode {} lost its rip", key)))?;
                let output = self.staging_file(item, &format!("{}.mkv", key));
                (input, output)
            };

            let base = i as f64 * span;
            match self.encode_one(ctx, &input, &output, base, span, key) {
                Ok(()) => {
                    if let Some(episode) = item.episode_mut(key) {
                        episode.encoded_path = Some(output);
                        episode.stage = EpisodeStage::Encoded;
                        episode.progress_percent = 100.0;
                    }
                }
                Err(e) => {
                    if let Some(episode) = item.episode_mut(key) {
                        episode.stage = EpisodeStage::Failed;
                        episode.progress_message = Some(e.to_string());
                    }
                    return Err(e);
                }
            }
        }

        // Item-level artifact points at the first encoded episode
        item.encoded_path = item
            .episodes
            .iter()
            .find_map(|e| e.encoded_path.clone());
        ctx.force_heartbeat(100.0, "all episodes encoded")?;
        Ok(())
    }

    fn health_check(&self) -> StageHealth {
        let ready = tools::is_tool_available(&self.services.config.tools, "drapto");
        StageHealth {
            stage: self.name().to_string(),
            ready,
            detail: if ready {
                "drapto available".to_string()
            } else {
                "drapto not found".to_string()
            },
        }
    }
}
