// Identification stage
//
// Resolves a disc label or file name into title metadata. Disc items check
// the disc-ID cache first; a hit skips the provider entirely. Provider
// lookups that return nothing raise a review outcome rather than guessing.

use std::sync::Arc;

use regex::Regex;
use serde::Deserialize;

use crate::cache::discid::DiscIdRecord;
use crate::error::{Result, SpindleError};
use crate::media::{EpisodePlan, MediaMetadata, MediaType};
use crate::queue::{ItemSource, ItemStatus, WorkItem};
use crate::services::Services;
use crate::stages::{Stage, StageContext, StageHealth};
use crate::tools::ffprobe;

/// What the identifier is asked to resolve.
#[derive(Debug, Clone)]
pub struct IdentifyRequest {
    pub query: String,
    pub year_hint: Option<i32>,
    pub season_hint: Option<i32>,
    pub runtime_seconds: Option<i64>,
}

/// Metadata lookup seam. Production uses TMDB; tests stub it.
pub trait MetadataProvider: Send + Sync {
    fn identify(&self, request: &IdentifyRequest) -> Result<MediaMetadata>;
    fn season_episodes(&self, tmdb_id: i64, season: i32) -> Result<Vec<EpisodePlan>>;
    fn ready(&self) -> std::result::Result<(), String>;
}

pub struct IdentifyStage {
    services: Arc<Services>,
    provider: Option<Box<dyn MetadataProvider>>,
}

impl IdentifyStage {
    pub fn new(services: Arc<Services>) -> Self {
        let provider: Option<Box<dyn MetadataProvider>> = services
            .config
            .tmdb_api_key
            .clone()
            .map(|key| Box::new(TmdbProvider::new(key)) as Box<dyn MetadataProvider>);
        Self { services, provider }
    }

    pub fn with_provider(services: Arc<Services>, provider: Box<dyn MetadataProvider>) -> Self {
        Self {
            services,
            provider: Some(provider),
        }
    }

    fn request_for(&self, item: &WorkItem) -> IdentifyRequest {
        match &item.source {
            ItemSource::Disc { label, .. } => {
                let (query, year_hint, season_hint) = clean_disc_label(label);
                IdentifyRequest {
                    query,
                    year_hint,
                    season_hint,
                    runtime_seconds: None,
                }
            }
            ItemSource::File { path } => {
                let stem = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_default();
                let (query, year_hint, season_hint) = clean_disc_label(&stem);
                let runtime = ffprobe::probe(&self.services.config.tools, path)
                    .ok()
                    .and_then(|info| info.duration_seconds)
                    .map(|secs| secs as i64);
                IdentifyRequest {
                    query,
                    year_hint,
                    season_hint,
                    runtime_seconds: runtime,
                }
            }
        }
    }

    fn cached_metadata(&self, item: &WorkItem) -> Option<MediaMetadata> {
        let fingerprint = item.source.fingerprint()?;
        let record = self.services.disc_ids.lookup(fingerprint)?;
        log::info!(
            "Disc-ID cache hit for item {}: {} ({:?})",
            item.id,
            record.title,
            record.media_type
        );
        Some(MediaMetadata {
            title: record.title,
            year: record.year,
            edition: record.edition,
            tmdb_id: Some(record.tmdb_id),
            media_type: record.media_type,
            season: record.season,
            episodes: Vec::new(),
            source_size_bytes: None,
            extra: serde_json::Map::new(),
        })
    }
}

impl Stage for IdentifyStage {
    fn name(&self) -> &'static str {
        "Identification"
    }

    fn processing_status(&self) -> ItemStatus {
        ItemStatus::Identifying
    }

    fn done_status(&self) -> ItemStatus {
        ItemStatus::Identified
    }

    fn prepare(&self, _ctx: &StageContext, item: &mut WorkItem) -> Result<()> {
        if let ItemSource::File { path } = &item.source {
            if !path.exists() {
                return Err(SpindleError::Validation(format!(
                    "source file no longer exists: {}",
                    path.display()
                )));
            }
        }
        Ok(())
    }

    fn execute(&self, ctx: &StageContext, item: &mut WorkItem) -> Result<()> {
        ctx.heartbeat(5.0, "resolving title")?;

        let mut metadata = match self.cached_metadata(item) {
            Some(cached) => cached,
            None => {
                let provider = self.provider.as_ref().ok_or_else(|| {
                    SpindleError::Configuration("TMDB API key is not configured".to_string())
                })?;
                let request = self.request_for(item);
                if request.query.is_empty() {
                    return Err(SpindleError::ReviewRequired(
                        "disc label is empty; cannot identify".to_string(),
                    ));
                }
                ctx.check_stop()?;
                let metadata = provider.identify(&request)?;

                if let ItemSource::Disc { fingerprint, .. } = &item.source {
                    let record = DiscIdRecord {
                        disc_fingerprint: fingerprint.clone(),
                        tmdb_id: metadata.tmdb_id.unwrap_or_default(),
                        media_type: metadata.media_type,
                        title: metadata.title.clone(),
                        year: metadata.year,
                        edition: metadata.edition.clone(),
                        season: metadata.season,
                        cached_at: String::new(),
                    };
                    if let Err(e) = self.services.disc_ids.store(record) {
                        log::warn!("Failed to update disc-ID cache: {}", e);
                    }
                }
                metadata
            }
        };

        // TV items need the season's episode plan for later matching
        if metadata.is_tv() && metadata.episodes.is_empty() {
            if let (Some(provider), Some(tmdb_id)) = (self.provider.as_ref(), metadata.tmdb_id) {
                ctx.heartbeat(60.0, "fetching episode list")?;
                metadata.episodes =
                    provider.season_episodes(tmdb_id, metadata.season.unwrap_or(1))?;
            }
        }

        log::info!("Identified item {} as {}", item.id, metadata.display_title());
        item.metadata = Some(metadata);
        ctx.heartbeat(100.0, "identified")?;
        Ok(())
    }

    fn health_check(&self) -> StageHealth {
        let (ready, detail) = match &self.provider {
            Some(provider) => match provider.ready() {
                Ok(()) => (true, "metadata provider configured".to_string()),
                Err(e) => (false, e),
            },
            None => (false, "TMDB API key missing".to_string()),
        };
        StageHealth {
            stage: self.name().to_string(),
            ready,
            detail,
        }
    }
}

static SEASON_RE: std::sync::LazyLock<Regex> =
    std::sync::LazyLock::new(|| Regex::new(r"(?i)\b(?:S|SEASON\s*)(\d{1,2})\b").unwrap());
static YEAR_RE: std::sync::LazyLock<Regex> =
    std::sync::LazyLock::new(|| Regex::new(r"\b(19\d{2}|20\d{2})\b").unwrap());
static NOISE_RE: std::sync::LazyLock<Regex> = std::sync::LazyLock::new(|| {
    Regex::new(
        r"(?i)\b((DISC|DISK)\s*\d*|D\d+|S\d{1,2}(E\d{1,2})?|SEASON\s*\d+|BLURAY|BLU RAY|DVD|1080P|2160P|4K|UHD|REMUX|X264|X265|19\d{2}|20\d{2})\b",
    )
    .unwrap()
});

/// Turn a disc label like `TOY_STORY_DISC_1` or a file stem into a search
/// query plus year/season hints.
pub fn clean_disc_label(label: &str) -> (String, Option<i32>, Option<i32>) {
    let spaced = label.replace(['_', '.'], " ");

    let season_hint = SEASON_RE
        .captures(&spaced)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok());

    let year_hint = YEAR_RE
        .captures(&spaced)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok());

    let cleaned = NOISE_RE.replace_all(&spaced, " ");

    let words: Vec<String> = cleaned
        .split_whitespace()
        .map(|w| {
            let lower = w.to_lowercase();
            let mut chars = lower.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect();

    (words.join(" "), year_hint, season_hint)
}

// ----- TMDB provider -----

const TMDB_BASE_URL: &str = "https://api.themoviedb.org/3";

pub struct TmdbProvider {
    api_key: String,
    base_url: String,
    client: reqwest::blocking::Client,
}

#[derive(Debug, Deserialize)]
struct TmdbSearchResponse<T> {
    #[serde(default)]
    results: Vec<T>,
}

#[derive(Debug, Default, Deserialize)]
struct TmdbMovie {
    id: i64,
    title: String,
    release_date: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct TmdbShow {
    id: i64,
    name: String,
    first_air_date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TmdbSeason {
    #[serde(default)]
    episodes: Vec<TmdbEpisode>,
}

#[derive(Debug, Deserialize)]
struct TmdbEpisode {
    episode_number: i32,
    name: Option<String>,
    runtime: Option<i64>,
}

impl TmdbProvider {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, TMDB_BASE_URL.to_string())
    }

    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .unwrap_or_default();
        Self {
            api_key,
            base_url,
            client,
        }
    }

    fn get<T: serde::de::DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.get(&url).query(&[("api_key", self.api_key.as_str())]);
        for (key, value) in query {
            request = request.query(&[(key, value.as_str())]);
        }
        let response = request
            .send()
            .map_err(|e| SpindleError::ExternalTool(format!("TMDB request failed: {}", e)))?;
        if !response.status().is_success() {
            return Err(SpindleError::ExternalTool(format!(
                "TMDB returned {} for {}",
                response.status(),
                path
            )));
        }
        response
            .json()
            .map_err(|e| SpindleError::ExternalTool(format!("TMDB response unreadable: {}", e)))
    }

    fn parse_year(date: Option<&str>) -> Option<i32> {
        date?.split('-').next()?.parse().ok()
    }
}

impl MetadataProvider for TmdbProvider {
    fn identify(&self, request: &IdentifyRequest) -> Result<MediaMetadata> {
        if request.season_hint.is_some() {
            let mut query = vec![("query", request.query.clone())];
            if let Some(year) = request.year_hint {
                query.push(("first_air_date_year", year.to_string()));
            }
            let response: TmdbSearchResponse<TmdbShow> = self.get("/search/tv", &query)?;
            let show = response.results.into_iter().next().ok_or_else(|| {
                SpindleError::ReviewRequired(format!("no TMDB series match for '{}'", request.query))
            })?;
            let mut metadata = MediaMetadata::movie(show.name, Self::parse_year(show.first_air_date.as_deref()));
            metadata.media_type = MediaType::Tv;
            metadata.tmdb_id = Some(show.id);
            metadata.season = request.season_hint;
            return Ok(metadata);
        }

        let mut query = vec![("query", request.query.clone())];
        if let Some(year) = request.year_hint {
            query.push(("year", year.to_string()));
        }
        let response: TmdbSearchResponse<TmdbMovie> = self.get("/search/movie", &query)?;
        let movie = response.results.into_iter().next().ok_or_else(|| {
            SpindleError::ReviewRequired(format!("no TMDB match for '{}'", request.query))
        })?;
        let mut metadata =
            MediaMetadata::movie(movie.title, Self::parse_year(movie.release_date.as_deref()));
        metadata.tmdb_id = Some(movie.id);
        Ok(metadata)
    }

    fn season_episodes(&self, tmdb_id: i64, season: i32) -> Result<Vec<EpisodePlan>> {
        let response: TmdbSeason = self.get(&format!("/tv/{}/season/{}", tmdb_id, season), &[])?;
        Ok(response
            .episodes
            .into_iter()
            .map(|ep| EpisodePlan {
                key: format!("s{:02}e{:02}", season, ep.episode_number),
                season,
                episode: ep.episode_number,
                title: ep.name,
                runtime_seconds: ep.runtime.map(|m| m * 60),
            })
            .collect())
    }

    fn ready(&self) -> std::result::Result<(), String> {
        if self.api_key.is_empty() {
            Err("TMDB API key is empty".to_string())
        } else {
            Ok(())
        }
    }
}
