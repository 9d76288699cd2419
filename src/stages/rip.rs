// Ripping stage
//
// Disc items rip into the cache entry keyed by their fingerprint; the entry
// is leased for the duration so eviction cannot pull it out from under the
// rip. File items have nothing to rip: their source becomes the "ripped"
// asset directly.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;

use crate::cache::CacheEntryMeta;
use crate::error::{Result, SpindleError};
use crate::media::{MediaMetadata, RipSpec, RipTitle};
use crate::queue::{Episode, EpisodeStage, ItemSource, ItemStatus, WorkItem};
use crate::services::Services;
use crate::stages::{Stage, StageContext, StageHealth};
use crate::tools::{self, ffprobe, makemkv};

/// Titles shorter than this are menus and trailers, never content.
const MIN_TITLE_SECONDS: i64 = 10 * 60;
/// Tolerated deviation between a title runtime and an episode runtime.
const EPISODE_RUNTIME_TOLERANCE: f64 = 0.25;

pub struct RipStage {
    services: Arc<Services>,
}

impl RipStage {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    /// Choose which disc titles to rip. Movies take the longest title;
    /// series take every title that plausibly matches an episode runtime.
    fn select_titles(metadata: &MediaMetadata, info: &makemkv::DiscInfo) -> Vec<u32> {
        let candidates: Vec<&makemkv::TitleDetails> = info
            .titles
            .iter()
            .filter(|t| t.duration_seconds.unwrap_or(0) >= MIN_TITLE_SECONDS)
            .collect();

        if !metadata.is_tv() {
            return candidates
                .iter()
                .max_by_key(|t| t.duration_seconds.unwrap_or(0))
                .map(|t| vec![t.title_id])
                .unwrap_or_default();
        }

        let expected: Vec<i64> = metadata
            .episodes
            .iter()
            .filter_map(|e| e.runtime_seconds)
            .collect();
        candidates
            .iter()
            .filter(|t| {
                let Some(duration) = t.duration_seconds else {
                    return false;
                };
                if expected.is_empty() {
                    return true;
                }
                expected.iter().any(|&runtime| {
                    let tolerance = (runtime as f64 * EPISODE_RUNTIME_TOLERANCE).max(120.0);
                    (duration - runtime).abs() as f64 <= tolerance
                })
            })
            .map(|t| t.title_id)
            .collect()
    }

    fn rip_disc(&self, ctx: &StageContext, item: &mut WorkItem, fingerprint: &str, label: &str) -> Result<()> {
        let metadata = item
            .metadata
            .clone()
            .ok_or_else(|| SpindleError::Validation("item has no identification metadata".to_string()))?;

        let entry_dir = self.services.cache.entry_path(fingerprint);
        let _lease = self.services.cache.reserve(fingerprint);

        ctx.force_heartbeat(1.0, "scanning disc")?;
        let device = self.services.config.optical_drive.clone();
        let timeout = std::time::Duration::from_secs(self.services.config.fingerprint_timeout_seconds);
        let info = makemkv::scan_disc(&self.services.config.tools, &device, timeout)?;

        let selected = Self::select_titles(&metadata, &info);
        if selected.is_empty() {
            return Err(SpindleError::ReviewRequired(format!(
                "no rippable titles found on disc (saw {})",
                info.titles.len()
            )));
        }
        ctx.check_stop()?;

        let produced = makemkv::rip_titles(
            &self.services.config.tools,
            &device,
            &selected,
            &entry_dir,
            |fraction, operation| {
                let percent = 5.0 + fraction * 90.0;
                let message = if operation.is_empty() {
                    "ripping".to_string()
                } else {
                    operation.to_string()
                };
                let _ = ctx.heartbeat(percent, &message);
            },
            || ctx.should_stop(),
        )?;

        if produced.is_empty() {
            return Err(SpindleError::ExternalTool(
                "makemkvcon finished but produced no mkv files".to_string(),
            ));
        }

        let spec = build_rip_spec(&metadata, &info, &selected, &produced);
        sync_episode_records(item, &spec, &metadata);

        // Sidecar marks the entry complete; written last so a crash leaves a
        // partial (eviction-preferred) entry.
        let primary = self.services.cache.primary_video_file(&entry_dir)?;
        let meta = CacheEntryMeta {
            label: label.to_string(),
            primary_file: primary
                .as_ref()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().to_string()),
            size_bytes: produced
                .iter()
                .filter_map(|p| std::fs::metadata(p).ok())
                .map(|m| m.len())
                .sum(),
            modified_at: Utc::now().to_rfc3339(),
            video_file_count: produced.len() as u32,
        };
        self.services.cache.write_metadata(&entry_dir, &meta)?;

        item.rip_spec = Some(spec);
        item.ripped_path = primary;
        ctx.force_heartbeat(100.0, "rip complete")?;

        // Budget pass on write completion; eviction never touches the leased entry
        if let Err(e) = self.services.cache.enforce_budget() {
            log::warn!("Cache budget pass failed after rip: {}", e);
        }
        Ok(())
    }

    fn adopt_file(&self, ctx: &StageContext, item: &mut WorkItem, path: &Path) -> Result<()> {
        ctx.force_heartbeat(10.0, "inspecting file")?;
        let duration = ffprobe::probe(&self.services.config.tools, path)
            .ok()
            .and_then(|info| info.duration_seconds)
            .map(|secs| secs as i64);
        let size = std::fs::metadata(path)?.len();

        item.rip_spec = Some(RipSpec {
            titles: vec![RipTitle {
                title_id: 0,
                name: path
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_default(),
                duration_seconds: duration,
                size_bytes: Some(size),
                chapter_count: None,
                episode_key: None,
                output_file: Some(path.to_path_buf()),
            }],
            extra: serde_json::Map::new(),
        });
        item.ripped_path = Some(path.to_path_buf());
        ctx.force_heartbeat(100.0, "file adopted")?;
        Ok(())
    }
}

impl Stage for RipStage {
    fn name(&self) -> &'static str {
        "Ripping"
    }

    fn processing_status(&self) -> ItemStatus {
        ItemStatus::Ripping
    }

    fn done_status(&self) -> ItemStatus {
        ItemStatus::Ripped
    }

    fn needs_drive(&self) -> bool {
        true
    }

    fn prepare(&self, _ctx: &StageContext, item: &mut WorkItem) -> Result<()> {
        if item.metadata.is_none() {
            return Err(SpindleError::Validation(
                "cannot rip before identification".to_string(),
            ));
        }
        if let ItemSource::Disc { fingerprint, .. } = &item.source {
            std::fs::create_dir_all(self.services.cache.entry_path(fingerprint))?;
        }
        Ok(())
    }

    fn execute(&self, ctx: &StageContext, item: &mut WorkItem) -> Result<()> {
        match item.source.clone() {
            ItemSource::Disc { fingerprint, label } => {
                self.rip_disc(ctx, item, &fingerprint, &label)
            }
            ItemSource::File { path } => self.adopt_file(ctx, item, &path),
        }
    }

    fn health_check(&self) -> StageHealth {
        let ready = tools::is_tool_available(&self.services.config.tools, "makemkvcon");
        StageHealth {
            stage: self.name().to_string(),
            ready,
            detail: if ready {
                "makemkvcon available".to_string()
            } else {
                "makemkvcon not found".to_string()
            },
        }
    }
}

/// Pair ripped outputs with the selected titles and, for series, tentatively
/// match titles to planned episodes by runtime.
fn build_rip_spec(
    metadata: &MediaMetadata,
    info: &makemkv::DiscInfo,
    selected: &[u32],
    produced: &[std::path::PathBuf],
) -> RipSpec {
    let mut titles = Vec::new();
    let mut available: Vec<&crate::media::EpisodePlan> = metadata.episodes.iter().collect();

    for (i, &title_id) in selected.iter().enumerate() {
        let details = info.titles.iter().find(|t| t.title_id == title_id);
        let duration = details.and_then(|d| d.duration_seconds);

        let episode_key = if metadata.is_tv() {
            // Best unclaimed runtime match within tolerance, else in order
            let matched = duration
                .and_then(|d| {
                    available
                        .iter()
                        .enumerate()
                        .filter(|(_, plan)| {
                            plan.runtime_seconds.map_or(false, |runtime| {
                                let tolerance =
                                    (runtime as f64 * EPISODE_RUNTIME_TOLERANCE).max(120.0);
                                (d - runtime).abs() as f64 <= tolerance
                            })
                        })
                        .min_by_key(|(_, plan)| {
                            (d - plan.runtime_seconds.unwrap_or(0)).abs()
                        })
                        .map(|(idx, _)| idx)
                })
                .or_else(|| if available.is_empty() { None } else { Some(0) });
            matched.map(|idx| available.remove(idx).key.clone())
        } else {
            None
        };

        titles.push(RipTitle {
            title_id,
            name: details.map(|d| d.name.clone()).unwrap_or_default(),
            duration_seconds: duration,
            size_bytes: details.and_then(|d| d.size_bytes),
            chapter_count: details.and_then(|d| d.chapter_count),
            episode_key,
            output_file: produced.get(i).cloned(),
        });
    }

    RipSpec {
        titles,
        extra: serde_json::Map::new(),
    }
}

/// Guarantee exactly one episode record per key the rip spec references,
/// advancing matched records to `ripped`.
fn sync_episode_records(item: &mut WorkItem, spec: &RipSpec, metadata: &MediaMetadata) {
    for title in &spec.titles {
        let Some(key) = &title.episode_key else {
            continue;
        };
        if item.episode(key).is_none() {
            let plan = metadata.episodes.iter().find(|p| &p.key == key);
            let mut episode = Episode::new(
                key.clone(),
                plan.map(|p| p.season).unwrap_or(metadata.season.unwrap_or(1)),
                plan.map(|p| p.episode).unwrap_or(0),
            );
            episode.title = plan.and_then(|p| p.title.clone());
            episode.runtime_seconds = plan.and_then(|p| p.runtime_seconds);
            item.episodes.push(episode);
        }
        if let Some(episode) = item.episode_mut(key) {
            episode.stage = EpisodeStage::Ripped;
            episode.ripped_path = title.output_file.clone();
        }
    }
    item.episodes.sort_by(|a, b| {
        (a.season, a.episode, a.key.clone()).cmp(&(b.season, b.episode, b.key.clone()))
    });
}
