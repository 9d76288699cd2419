// Subtitling stage
//
// Fetches subtitles through a pluggable provider and muxes them into the
// encoded container with mkvmerge. A provider returning nothing is a clean
// pass: the item moves on without subtitles.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Result, SpindleError};
use crate::queue::{EpisodeStage, ItemStatus, SubtitleInfo, WorkItem};
use crate::services::Services;
use crate::stages::{Stage, StageContext, StageHealth};
use crate::tools::{self, mkvmerge};

/// What the provider is asked for.
#[derive(Debug, Clone)]
pub struct SubtitleRequest {
    pub title: String,
    pub year: Option<i32>,
    pub tmdb_id: Option<i64>,
    pub season: Option<i32>,
    pub episode: Option<i32>,
    pub media_file: PathBuf,
}

/// A fetched subtitle ready to mux.
#[derive(Debug, Clone)]
pub struct FetchedSubtitle {
    pub path: PathBuf,
    pub language: String,
    pub source: String,
    pub match_score: Option<f64>,
}

/// Subtitle lookup seam. Production implementations talk to OpenSubtitles
/// or run transcription; the default fetches nothing.
pub trait SubtitleProvider: Send + Sync {
    fn fetch(&self, request: &SubtitleRequest) -> Result<Option<FetchedSubtitle>>;
}

pub struct NoSubtitleProvider;

impl SubtitleProvider for NoSubtitleProvider {
    fn fetch(&self, _request: &SubtitleRequest) -> Result<Option<FetchedSubtitle>> {
        Ok(None)
    }
}

pub struct SubtitleStage {
    services: Arc<Services>,
    provider: Box<dyn SubtitleProvider>,
}

impl SubtitleStage {
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            services,
            provider: Box::new(NoSubtitleProvider),
        }
    }

    pub fn with_provider(services: Arc<Services>, provider: Box<dyn SubtitleProvider>) -> Self {
        Self { services, provider }
    }

    /// Mux `subtitle` into `encoded` in place (via a sibling temp file).
    fn mux_into(&self, encoded: &Path, subtitle: &FetchedSubtitle) -> Result<()> {
        let muxed = encoded.with_extension("subbed.mkv");
        mkvmerge::mux_subtitle(
            &self.services.config.tools,
            encoded,
            &subtitle.path,
            &subtitle.language,
            &muxed,
        )?;
        std::fs::rename(&muxed, encoded)?;
        Ok(())
    }

    fn request_for(&self, item: &WorkItem, media_file: &Path, episode: Option<(i32, i32)>) -> SubtitleRequest {
        let metadata = item.metadata.as_ref();
        SubtitleRequest {
            title: metadata.map(|m| m.title.clone()).unwrap_or_else(|| item.display_title()),
            year: metadata.and_then(|m| m.year),
            tmdb_id: metadata.and_then(|m| m.tmdb_id),
            season: episode.map(|(s, _)| s),
            episode: episode.map(|(_, e)| e),
            media_file: media_file.to_path_buf(),
        }
    }
}

impl Stage for SubtitleStage {
    fn name(&self) -> &'static str {
        "Subtitling"
    }

    fn processing_status(&self) -> ItemStatus {
        ItemStatus::Subtitling
    }

    fn done_status(&self) -> ItemStatus {
        ItemStatus::Subtitled
    }

    fn prepare(&self, _ctx: &StageContext, item: &mut WorkItem) -> Result<()> {
        let has_encoded = item.encoded_path.is_some()
            || item.episodes.iter().any(|e| e.encoded_path.is_some());
        if !has_encoded {
            return Err(SpindleError::Validation(
                "cannot subtitle before encoding".to_string(),
            ));
        }
        Ok(())
    }

    fn execute(&self, ctx: &StageContext, item: &mut WorkItem) -> Result<()> {
        let is_tv = item.metadata.as_ref().map(|m| m.is_tv()).unwrap_or(false);

        if !is_tv {
            let encoded = item
                .encoded_path
                .clone()
                .ok_or_else(|| SpindleError::Validation("no encoded file".to_string()))?;
            ctx.force_heartbeat(10.0, "searching subtitles")?;
            let request = self.request_for(item, &encoded, None);
            if let Some(subtitle) = self.provider.fetch(&request)? {
                ctx.heartbeat(60.0, "muxing subtitles")?;
                self.mux_into(&encoded, &subtitle)?;
                log::info!(
                    "Muxed {} subtitles from {} into {}",
                    subtitle.language,
                    subtitle.source,
                    encoded.display()
                );
            }
            ctx.force_heartbeat(100.0, "subtitles done")?;
            return Ok(());
        }

        let keys: Vec<String> = item
            .episodes
            .iter()
            .filter(|e| e.stage == EpisodeStage::Encoded && e.encoded_path.is_some())
            .map(|e| e.key.clone())
            .collect();
        let total = keys.len().max(1);

        for (i, key) in keys.iter().enumerate() {
            ctx.check_stop()?;
            ctx.heartbeat(
                (i as f64 / total as f64) * 100.0,
                &format!("subtitles for {}", key),
            )?;
            let (encoded, season, episode_number) = {
                let episode = item
                    .episode(key)
                    .ok_or_else(|| SpindleError::EpisodeNotFound(key.clone()))?;
                (
                    episode.encoded_path.clone().unwrap_or_default(),
                    episode.season,
                    episode.episode,
                )
            };
            let request = self.request_for(item, &encoded, Some((season, episode_number)));
            if let Some(subtitle) = self.provider.fetch(&request)? {
                self.mux_into(&encoded, &subtitle)?;
                if let Some(episode) = item.episode_mut(key) {
                    episode.subtitle = Some(SubtitleInfo {
                        source: subtitle.source,
                        language: subtitle.language,
                        match_score: subtitle.match_score,
                    });
                }
            }
        }

        ctx.force_heartbeat(100.0, "subtitles done")?;
        Ok(())
    }

    fn health_check(&self) -> StageHealth {
        let ready = tools::is_tool_available(&self.services.config.tools, "mkvmerge");
        StageHealth {
            stage: self.name().to_string(),
            ready,
            detail: if ready {
                "mkvmerge available".to_string()
            } else {
                "mkvmerge not found".to_string()
            },
        }
    }
}
