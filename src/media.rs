// Identification and rip-spec documents
//
// These are the two structured blobs that flow between stages: the
// identifier writes `MediaMetadata`, the ripper writes `RipSpec`, and the
// downstream stages read both. Unknown fields round-trip through `extra` so
// a newer producer never breaks an older reader.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Movie,
    Tv,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaMetadata {
    pub title: String,
    pub year: Option<i32>,
    pub edition: Option<String>,
    pub tmdb_id: Option<i64>,
    pub media_type: MediaType,
    pub season: Option<i32>,
    /// Episodes the identifier planned; confirmed or corrected later by the
    /// episode identifier.
    #[serde(default)]
    pub episodes: Vec<EpisodePlan>,
    /// Set by `queue.add_file` for manually supplied files.
    pub source_size_bytes: Option<u64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl MediaMetadata {
    pub fn movie(title: impl Into<String>, year: Option<i32>) -> Self {
        Self {
            title: title.into(),
            year,
            edition: None,
            tmdb_id: None,
            media_type: MediaType::Movie,
            season: None,
            episodes: Vec::new(),
            source_size_bytes: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn display_title(&self) -> String {
        match self.year {
            Some(year) => format!("{} ({})", self.title, year),
            None => self.title.clone(),
        }
    }

    pub fn is_tv(&self) -> bool {
        self.media_type == MediaType::Tv
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodePlan {
    pub key: String,
    pub season: i32,
    pub episode: i32,
    pub title: Option<String>,
    pub runtime_seconds: Option<i64>,
}

/// Description of what ripping produced: one entry per disc title kept.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RipSpec {
    #[serde(default)]
    pub titles: Vec<RipTitle>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RipTitle {
    /// makemkvcon title index on the source disc.
    pub title_id: u32,
    pub name: String,
    pub duration_seconds: Option<i64>,
    pub size_bytes: Option<u64>,
    pub chapter_count: Option<u32>,
    /// Episode this title was matched to, if any.
    pub episode_key: Option<String>,
    /// Ripped output inside the cache entry; set once the rip finishes.
    pub output_file: Option<PathBuf>,
}

impl RipSpec {
    pub fn episode_keys(&self) -> Vec<&str> {
        self.titles
            .iter()
            .filter_map(|t| t.episode_key.as_deref())
            .collect()
    }

    pub fn title_for_episode(&self, key: &str) -> Option<&RipTitle> {
        self.titles
            .iter()
            .find(|t| t.episode_key.as_deref() == Some(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_unknown_fields_round_trip() {
        let raw = r#"{
            "title": "Toy Story",
            "year": 1995,
            "edition": null,
            "tmdb_id": 862,
            "media_type": "movie",
            "season": null,
            "episodes": [],
            "source_size_bytes": null,
            "future_field": {"nested": true}
        }"#;
        let meta: MediaMetadata = serde_json::from_str(raw).unwrap();
        assert_eq!(meta.display_title(), "Toy Story (1995)");
        assert!(meta.extra.contains_key("future_field"));

        let back = serde_json::to_value(&meta).unwrap();
        assert_eq!(back["future_field"]["nested"], true);
    }

    #[test]
    fn test_rip_spec_episode_lookup() {
        let spec = RipSpec {
            titles: vec![
                RipTitle {
                    title_id: 0,
                    name: "t00".to_string(),
                    duration_seconds: Some(1500),
                    size_bytes: None,
                    chapter_count: None,
                    episode_key: Some("s01e01".to_string()),
                    output_file: None,
                },
                RipTitle {
                    title_id: 1,
                    name: "t01".to_string(),
                    duration_seconds: Some(1480),
                    size_bytes: None,
                    chapter_count: None,
                    episode_key: None,
                    output_file: None,
                },
            ],
            extra: serde_json::Map::new(),
        };
        assert_eq!(spec.episode_keys(), vec!["s01e01"]);
        assert!(spec.title_for_episode("s01e01").is_some());
        assert!(spec.title_for_episode("s01e02").is_none());
    }
}
