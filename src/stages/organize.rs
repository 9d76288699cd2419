// Organization stage
//
// Moves encoded artifacts into the library layout, stamps final paths, and
// nudges media servers. Library layout:
//   Movies/Title (Year)/Title (Year).mkv
//   TV/Title/Season 01/Title - s01e05 - Episode Title.mkv

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Result, SpindleError};
use crate::queue::{EpisodeStage, ItemStatus, WorkItem};
use crate::services::Services;
use crate::stages::{Stage, StageContext, StageHealth};

pub struct OrganizeStage {
    services: Arc<Services>,
}

impl OrganizeStage {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    fn movie_dest(&self, item: &WorkItem) -> Result<PathBuf> {
        let metadata = item
            .metadata
            .as_ref()
            .ok_or_else(|| SpindleError::Validation("item has no identification metadata".to_string()))?;
        let folder = sanitize_component(&metadata.display_title());
        Ok(self
            .services
            .config
            .library_dir
            .join("Movies")
            .join(&folder)
            .join(format!("{}.mkv", folder)))
    }

    fn episode_dest(&self, item: &WorkItem, key: &str) -> Result<PathBuf> {
        let metadata = item
            .metadata
            .as_ref()
            .ok_or_else(|| SpindleError::Validation("item has no identification metadata".to_string()))?;
        let episode = item
            .episode(key)
            .ok_or_else(|| SpindleError::EpisodeNotFound(key.to_string()))?;

        let show = sanitize_component(&metadata.title);
        let mut name = format!("{} - {}", show, key);
        if let Some(title) = &episode.title {
            name.push_str(&format!(" - {}", sanitize_component(title)));
        }
        Ok(self
            .services
            .config
            .library_dir
            .join("TV")
            .join(&show)
            .join(format!("Season {:02}", episode.season))
            .join(format!("{}.mkv", name)))
    }
}

impl Stage for OrganizeStage {
    fn name(&self) -> &'static str {
        "Organizing"
    }

    fn processing_status(&self) -> ItemStatus {
        ItemStatus::Organizing
    }

    fn done_status(&self) -> ItemStatus {
        ItemStatus::Completed
    }

    fn prepare(&self, _ctx: &StageContext, item: &mut WorkItem) -> Result<()> {
        let has_encoded = item.encoded_path.is_some()
            || item.episodes.iter().any(|e| e.encoded_path.is_some());
        if !has_encoded {
            return Err(SpindleError::Validation(
                "cannot organize before encoding".to_string(),
            ));
        }
        std::fs::create_dir_all(&self.services.config.library_dir)?;
        Ok(())
    }

    fn execute(&self, ctx: &StageContext, item: &mut WorkItem) -> Result<()> {
        let is_tv = item.metadata.as_ref().map(|m| m.is_tv()).unwrap_or(false);

        if !is_tv {
            let encoded = item
                .encoded_path
                .clone()
                .ok_or_else(|| SpindleError::Validation("no encoded file".to_string()))?;
            let dest = self.movie_dest(item)?;
            ctx.force_heartbeat(20.0, "moving into library")?;
            move_into_library(&encoded, &dest)?;
            item.final_path = Some(dest);
        } else {
            let keys: Vec<String> = item
                .episodes
                .iter()
                .filter(|e| e.encoded_path.is_some() && e.stage != EpisodeStage::Final)
                .map(|e| e.key.clone())
                .collect();
            if keys.is_empty() {
                return Err(SpindleError::Validation(
                    "no encoded episodes to organize".to_string(),
                ));
            }
            let total = keys.len().max(1);
            for (i, key) in keys.iter().enumerate() {
                ctx.check_stop()?;
                ctx.heartbeat((i as f64 / total as f64) * 100.0, &format!("placing {}", key))?;
                let dest = self.episode_dest(item, key)?;
                let encoded = item
                    .episode(key)
                    .and_then(|e| e.encoded_path.clone())
                    .ok_or_else(|| SpindleError::Internal(format!("episode {} lost its encode", key)))?;
                move_into_library(&encoded, &dest)?;
                if let Some(episode) = item.episode_mut(key) {
                    episode.final_path = Some(dest.clone());
                    episode.stage = EpisodeStage::Final;
                }
                // The item-level final path points at the season folder
                item.final_path = dest.parent().map(Path::to_path_buf);
            }
        }

        ctx.force_heartbeat(95.0, "refreshing media servers")?;
        self.services.notifier.refresh_media_servers();
        ctx.force_heartbeat(100.0, "organized")?;
        Ok(())
    }

    fn health_check(&self) -> StageHealth {
        let dir = &self.services.config.library_dir;
        let ready = dir.exists() || std::fs::create_dir_all(dir).is_ok();
        StageHealth {
            stage: self.name().to_string(),
            ready,
            detail: format!("library at {}", dir.display()),
        }
    }
}

/// Strip characters that break paths or media-server scanners.
fn sanitize_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => ' ',
            c => c,
        })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Rename into place, falling back to copy-and-remove across filesystems.
fn move_into_library(source: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::rename(source, dest) {
        Ok(()) => Ok(()),
        Err(_) => {
            std::fs::copy(source, dest)?;
            std::fs::remove_file(source)?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_component() {
        assert_eq!(sanitize_component("Face/Off (1997)"), "Face Off (1997)");
        assert_eq!(sanitize_component("What If...?"), "What If...");
        assert_eq!(sanitize_component("  spaced   out  "), "spaced out");
    }

    #[test]
    fn test_move_into_library_creates_parents() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = tmp.path().join("enc.mkv");
        std::fs::write(&source, b"data").unwrap();
        let dest = tmp.path().join("Movies/Heat (1995)/Heat (1995).mkv");

        move_into_library(&source, &dest).unwrap();
        assert!(dest.exists());
        assert!(!source.exists());
    }
}
