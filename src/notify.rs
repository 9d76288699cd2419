// Outbound notifications and media-server refresh
//
// Everything here is fire-and-forget: a failed push or refresh is logged at
// warn and never fails the calling stage.

use std::time::Duration;

use crate::config::Config;

pub struct Notifier {
    client: reqwest::blocking::Client,
    ntfy: Option<crate::config::NtfyConfig>,
    plex: Option<crate::config::PlexConfig>,
    jellyfin: Option<crate::config::JellyfinConfig>,
}

impl Notifier {
    pub fn new(config: &Config) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            ntfy: config.ntfy.clone(),
            plex: config.plex.clone(),
            jellyfin: config.jellyfin.clone(),
        }
    }

    /// Push one event. No-op when ntfy is not configured.
    pub fn notify(&self, title: &str, message: &str) {
        let Some(ntfy) = &self.ntfy else {
            return;
        };
        let url = format!("{}/{}", ntfy.url.trim_end_matches('/'), ntfy.topic);
        let result = self
            .client
            .post(&url)
            .header("Title", title)
            .body(message.to_string())
            .send();
        match result {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => log::warn!("ntfy push returned {}", response.status()),
            Err(e) => log::warn!("ntfy push failed: {}", e),
        }
    }

    /// Verify the push path end to end.
    pub fn send_test(&self) -> bool {
        if self.ntfy.is_none() {
            return false;
        }
        self.notify("Spindle", "Test notification");
        true
    }

    /// Ask configured media servers to rescan their libraries.
    pub fn refresh_media_servers(&self) {
        if let Some(plex) = &self.plex {
            let url = format!(
                "{}/library/sections/all/refresh?X-Plex-Token={}",
                plex.url.trim_end_matches('/'),
                plex.token
            );
            if let Err(e) = self.client.post(&url).send() {
                log::warn!("Plex refresh failed: {}", e);
            }
        }
        if let Some(jellyfin) = &self.jellyfin {
            let url = format!("{}/Library/Refresh", jellyfin.url.trim_end_matches('/'));
            let result = self
                .client
                .post(&url)
                .header("Authorization", format!("MediaBrowser Token=\"{}\"", jellyfin.api_key))
                .send();
            if let Err(e) = result {
                log::warn!("Jellyfin refresh failed: {}", e);
            }
        }
    }
}
