//! Client for the break directory server.
//!
//! The server is an nginx with `autoindex_format json`:
//!
//! ```text
//!   GET <base>/<breaks_path>/         -> [{"name":"1400","type":"directory"}, ...]
//!   GET <base>/<breaks_path>/1400/    -> [{"name":"001 - Alkujingle.mp3","type":"file"}, ...]
//! ```
//!
//! Only `name` is required; `type` is used to skip stray entries when present.

use crate::config::ListingConfig;
use crate::protocol::TrackDescriptor;
use crate::slot::SlotLabel;
use rand::Rng;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ListingError {
    #[error("invalid listing base url {url:?}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },
    #[error("could not build http client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to {url} failed: {source}")]
    Request {
        url: Url,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned HTTP {status}")]
    Status { url: Url, status: StatusCode },
    #[error("could not decode listing from {url}: {source}")]
    Decode {
        url: Url,
        #[source]
        source: reqwest::Error,
    },
}

impl ListingError {
    /// Transport failures and server errors may clear up; a 404 or a
    /// malformed body will not.
    fn is_retryable(&self) -> bool {
        match self {
            ListingError::Request { .. } => true,
            ListingError::Status { status, .. } => status.is_server_error(),
            ListingError::InvalidBaseUrl { .. }
            | ListingError::Client(_)
            | ListingError::Decode { .. } => false,
        }
    }
}

/// One row of a JSON autoindex page.
#[derive(Debug, Clone, Deserialize)]
pub struct ListingEntry {
    pub name: String,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

impl ListingEntry {
    fn is_directory(&self) -> bool {
        self.kind.as_deref() == Some("directory")
    }
}

/// Bounded exponential backoff with jitter.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): base * 2^(retry-1) plus up
    /// to half a base of jitter.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = self
            .base_delay
            .checked_mul(2u32.saturating_pow(retry.saturating_sub(1).min(16)))
            .unwrap_or(Duration::MAX);
        let jitter_ms = (self.base_delay.as_millis() / 2) as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        exp.saturating_add(jitter)
    }
}

impl From<&ListingConfig> for RetryPolicy {
    fn from(config: &ListingConfig) -> Self {
        Self {
            attempts: config.retry_attempts.max(1),
            base_delay: config.retry_base_delay(),
        }
    }
}

pub struct ListingClient {
    client: reqwest::Client,
    base: Url,
    breaks_path: Vec<String>,
    retry: RetryPolicy,
    sort_tracks: bool,
}

impl ListingClient {
    pub fn new(config: &ListingConfig, sort_tracks: bool) -> Result<Self, ListingError> {
        let invalid = |reason: String| ListingError::InvalidBaseUrl {
            url: config.base_url.clone(),
            reason,
        };
        let base = Url::parse(&config.base_url).map_err(|e| invalid(e.to_string()))?;
        if base.cannot_be_a_base() {
            return Err(invalid("not a hierarchical url".to_string()));
        }
        let client = reqwest::Client::builder()
            .user_agent(concat!("katko/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout())
            .build()
            .map_err(ListingError::Client)?;

        Ok(Self {
            client,
            base,
            breaks_path: config
                .breaks_path
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            retry: RetryPolicy::from(config),
            sort_tracks,
        })
    }

    /// `<base>/<breaks_path>/<extra...>`, with a trailing slash for directories.
    fn url_for(&self, extra: &[&str], directory: bool) -> Url {
        let mut url = self.base.clone();
        // `new` rejected cannot-be-a-base urls, so this always succeeds
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty();
            segments.extend(self.breaks_path.iter().map(String::as_str));
            segments.extend(extra.iter().copied());
            if directory {
                segments.push("");
            }
        }
        url
    }

    pub fn breaks_url(&self) -> Url {
        self.url_for(&[], true)
    }

    pub fn slot_url(&self, slot: &SlotLabel) -> Url {
        self.url_for(&[slot.as_str()], true)
    }

    pub fn track_url(&self, slot: &SlotLabel, name: &str) -> Url {
        self.url_for(&[slot.as_str(), name], false)
    }

    /// List the candidate slots.
    pub async fn fetch_slots(&self) -> Result<Vec<SlotLabel>, ListingError> {
        let entries = self.fetch_entries(&self.breaks_url()).await?;
        Ok(slots_from_entries(entries))
    }

    /// List the tracks of one slot in play order.
    pub async fn fetch_tracks(&self, slot: &SlotLabel) -> Result<Vec<TrackDescriptor>, ListingError> {
        let entries = self.fetch_entries(&self.slot_url(slot)).await?;
        let mut tracks: Vec<TrackDescriptor> = entries
            .into_iter()
            .filter(|e| !e.is_directory())
            .map(|e| TrackDescriptor {
                url: self.track_url(slot, &e.name).to_string(),
                name: e.name,
            })
            .collect();
        if self.sort_tracks {
            tracks.sort_by(|a, b| a.name.cmp(&b.name));
        }
        Ok(tracks)
    }

    async fn fetch_entries(&self, url: &Url) -> Result<Vec<ListingEntry>, ListingError> {
        let mut attempt = 1;
        loop {
            match self.fetch_once(url).await {
                Ok(entries) => return Ok(entries),
                Err(e) if e.is_retryable() && attempt < self.retry.attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        "listing: attempt {}/{} failed: {} (retrying in {:?})",
                        attempt, self.retry.attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn fetch_once(&self, url: &Url) -> Result<Vec<ListingEntry>, ListingError> {
        debug!("listing: GET {}", url);
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|source| ListingError::Request {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ListingError::Status {
                url: url.clone(),
                status,
            });
        }

        response
            .json::<Vec<ListingEntry>>()
            .await
            .map_err(|source| ListingError::Decode {
                url: url.clone(),
                source,
            })
    }
}

/// Keep entries that name a valid slot, in listing order.
pub fn slots_from_entries(entries: Vec<ListingEntry>) -> Vec<SlotLabel> {
    entries
        .into_iter()
        .filter(|e| e.kind.is_none() || e.is_directory())
        .filter_map(|e| match SlotLabel::parse(&e.name) {
            Ok(slot) => Some(slot),
            Err(err) => {
                warn!("listing: skipping entry: {}", err);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, kind: Option<&str>) -> ListingEntry {
        ListingEntry {
            name: name.to_string(),
            kind: kind.map(str::to_string),
        }
    }

    fn client(base_url: &str, breaks_path: &str) -> ListingClient {
        let config = ListingConfig {
            base_url: base_url.to_string(),
            breaks_path: breaks_path.to_string(),
            ..ListingConfig::default()
        };
        ListingClient::new(&config, true).unwrap()
    }

    #[test]
    fn slots_skip_files_and_bad_labels() {
        let slots = slots_from_entries(vec![
            entry("1500", Some("directory")),
            entry("README.txt", Some("file")),
            entry("1400", None),
            entry("lunch", Some("directory")),
            entry("0930", Some("file")),
        ]);
        let labels: Vec<&str> = slots.iter().map(SlotLabel::as_str).collect();
        assert_eq!(labels, ["1500", "1400"]);
    }

    #[test]
    fn urls_follow_directory_layout() {
        let c = client("http://localhost:8080", "katkot");
        let slot = SlotLabel::parse("1400").unwrap();
        assert_eq!(c.breaks_url().as_str(), "http://localhost:8080/katkot/");
        assert_eq!(c.slot_url(&slot).as_str(), "http://localhost:8080/katkot/1400/");
        assert_eq!(
            c.track_url(&slot, "001 - Alkujingle.mp3").as_str(),
            "http://localhost:8080/katkot/1400/001%20-%20Alkujingle.mp3"
        );
    }

    #[test]
    fn base_path_and_nested_breaks_path_are_kept() {
        let c = client("http://radio.local/media/", "/ads/katkot/");
        assert_eq!(c.breaks_url().as_str(), "http://radio.local/media/ads/katkot/");
    }

    #[test]
    fn bad_base_url_is_rejected() {
        let config = ListingConfig {
            base_url: "not a url".to_string(),
            ..ListingConfig::default()
        };
        assert!(matches!(
            ListingClient::new(&config, true),
            Err(ListingError::InvalidBaseUrl { .. })
        ));
    }

    #[test]
    fn backoff_grows_and_stays_bounded() {
        let policy = RetryPolicy {
            attempts: 5,
            base_delay: Duration::from_millis(100),
        };
        let first = policy.delay_for(1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));
        let third = policy.delay_for(3);
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(450));
    }

    #[test]
    fn zero_base_delay_has_no_jitter() {
        let policy = RetryPolicy {
            attempts: 3,
            base_delay: Duration::ZERO,
        };
        assert_eq!(policy.delay_for(2), Duration::ZERO);
    }

    #[test]
    fn huge_base_delay_saturates() {
        let policy = RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_millis(u64::MAX),
        };
        assert_eq!(policy.delay_for(3), Duration::MAX);
    }
}
