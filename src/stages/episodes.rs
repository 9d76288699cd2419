// Episode identification stage
//
// Confirms (or repairs) the mapping from ripped titles to episode records.
// Movies pass through untouched. The rip stage already made a tentative
// runtime match; this stage re-probes actual file durations, fills in the
// keys it can, and raises a review outcome when nothing lines up.

use std::sync::Arc;

use crate::error::{Result, SpindleError};
use crate::queue::{Episode, EpisodeStage, ItemStatus, WorkItem};
use crate::services::Services;
use crate::stages::{Stage, StageContext, StageHealth};
use crate::tools::{self, ffprobe};

const RUNTIME_TOLERANCE: f64 = 0.25;

pub struct EpisodeIdentifyStage {
    services: Arc<Services>,
}

impl EpisodeIdentifyStage {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }
}

impl Stage for EpisodeIdentifyStage {
    fn name(&self) -> &'static str {
        "Episode identification"
    }

    fn processing_status(&self) -> ItemStatus {
        ItemStatus::EpisodeIdentifying
    }

    fn done_status(&self) -> ItemStatus {
        ItemStatus::EpisodeIdentified
    }

    fn prepare(&self, _ctx: &StageContext, item: &mut WorkItem) -> Result<()> {
        if item.rip_spec.is_none() {
            return Err(SpindleError::Validation(
                "cannot identify episodes before ripping".to_string(),
            ));
        }
        Ok(())
    }

    fn execute(&self, ctx: &StageContext, item: &mut WorkItem) -> Result<()> {
        let metadata = item
            .metadata
            .clone()
            .ok_or_else(|| SpindleError::Validation("item has no identification metadata".to_string()))?;

        if !metadata.is_tv() {
            ctx.force_heartbeat(100.0, "movie, no episodes")?;
            return Ok(());
        }

        let mut spec = item
            .rip_spec
            .clone()
            .ok_or_else(|| SpindleError::Validation("item has no rip spec".to_string()))?;

        let total = spec.titles.len().max(1);
        let mut unmatched: Vec<&crate::media::EpisodePlan> = metadata
            .episodes
            .iter()
            .filter(|plan| spec.title_for_episode(&plan.key).is_none())
            .collect();

        for (i, title) in spec.titles.iter_mut().enumerate() {
            ctx.check_stop()?;
            ctx.heartbeat(
                (i as f64 / total as f64) * 100.0,
                &format!("matching title {}", title.title_id),
            )?;
            if title.episode_key.is_some() {
                continue;
            }

            // Prefer the file's true duration over the disc table's
            let duration = title
                .output_file
                .as_deref()
                .and_then(|path| ffprobe::probe(&self.services.config.tools, path).ok())
                .and_then(|info| info.duration_seconds)
                .map(|secs| secs as i64)
                .or(title.duration_seconds);

            let matched = duration.and_then(|d| {
                unmatched
                    .iter()
                    .enumerate()
                    .filter(|(_, plan)| {
                        plan.runtime_seconds.map_or(true, |runtime| {
                            let tolerance = (runtime as f64 * RUNTIME_TOLERANCE).max(120.0);
                            (d - runtime).abs() as f64 <= tolerance
                        })
                    })
                    .min_by_key(|(_, plan)| {
                        plan.runtime_seconds.map_or(i64::MAX, |runtime| (d - runtime).abs())
                    })
                    .map(|(idx, _)| idx)
            });
            if let Some(idx) = matched {
                title.episode_key = Some(unmatched.remove(idx).key.clone());
            }
        }

        if metadata.episodes.is_empty() {
            return Err(SpindleError::ReviewRequired(
                "series has no planned episodes to match against".to_string(),
            ));
        }
        if spec.episode_keys().is_empty() {
            return Err(SpindleError::ReviewRequired(
                "no ripped title matches any planned episode".to_string(),
            ));
        }

        // One episode record per matched key, advanced to ripped
        for title in &spec.titles {
            let Some(key) = title.episode_key.clone() else {
                continue;
            };
            if item.episode(&key).is_none() {
                let plan = metadata.episodes.iter().find(|p| p.key == key);
                let mut episode = Episode::new(
                    key.clone(),
                    plan.map(|p| p.season).unwrap_or(metadata.season.unwrap_or(1)),
                    plan.map(|p| p.episode).unwrap_or(0),
                );
                episode.title = plan.and_then(|p| p.title.clone());
                episode.runtime_seconds = plan.and_then(|p| p.runtime_seconds);
                item.episodes.push(episode);
            }
            if let Some(episode) = item.episode_mut(&key) {
                if episode.stage == EpisodeStage::Planned {
                    episode.stage = EpisodeStage::Ripped;
                }
                if episode.ripped_path.is_none() {
                    episode.ripped_path = title.output_file.clone();
                }
            }
        }
        item.episodes.sort_by(|a, b| {
            (a.season, a.episode, a.key.clone()).cmp(&(b.season, b.episode, b.key.clone()))
        });

        item.rip_spec = Some(spec);
        let totals = item.episode_totals();
        ctx.force_heartbeat(
            100.0,
            &format!("{} episodes matched", totals.ripped + totals.encoded + totals.final_count),
        )?;
        Ok(())
    }

    fn health_check(&self) -> StageHealth {
        let ready = tools::is_tool_available(&self.services.config.tools, "ffprobe");
        StageHealth {
            stage: self.name().to_string(),
            ready,
            detail: if ready {
                "ffprobe available".to_string()
            } else {
                "ffprobe not found".to_string()
            },
        }
    }
}
