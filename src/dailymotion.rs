use crate::credential::Credential;
use crate::error::{Error, Result};
use serde::Deserialize;
use std::fmt::Write;

const FAVORITE_FIELDS: &str = "id,tags,title,url";

/// A page of videos as returned by the Dailymotion list endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[allow(missing_docs)]
pub struct VideoFeed {
    #[serde(default)]
    pub list: Vec<Video>,
    #[serde(default)]
    pub has_more: bool,
}

/// The fields requested for each favorite.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[allow(missing_docs)]
pub struct Video {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub url: String,
}

/// Authenticated calls against the Dailymotion data API.
#[derive(Debug, Clone)]
pub struct DailymotionClient {
    http: reqwest::blocking::Client,
    base_url: String,
}

impl DailymotionClient {
    /// Production data API.
    pub const DEFAULT_BASE_URL: &'static str = "https://api.dailymotion.com";

    /// A trailing slash on `base_url` is ignored.
    pub fn new(http: reqwest::blocking::Client, base_url: impl Into<String>) -> Self {
        DailymotionClient {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Lists the favorited videos of the user the credential belongs to.
    pub fn favorite_videos(&self, credential: &Credential) -> Result<VideoFeed> {
        let url = format!("{}/videos/favorites", self.base_url);
        tracing::debug!(%url, "fetching favorite videos");

        let response = self
            .http
            .get(&url)
            .query(&[("fields", FAVORITE_FIELDS)])
            .bearer_auth(&credential.access_token)
            .send()?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Api {
                status: status.as_u16(),
                body: response.text()?,
            });
        }

        Ok(response.json()?)
    }
}

/// Formats the feed the way the command line prints it.
pub fn render_feed(feed: &VideoFeed) -> String {
    let mut out = String::new();
    if feed.list.is_empty() {
        out.push_str("No favorite videos found.\n");
        return out;
    }

    if feed.has_more {
        out.push_str("First ");
    }
    let _ = writeln!(out, "{} favorite videos found:", feed.list.len());
    for video in &feed.list {
        out.push('\n');
        out.push_str("-----------------------------------------------\n");
        let _ = writeln!(out, "ID: {}", video.id);
        let _ = writeln!(out, "Title: {}", video.title);
        let _ = writeln!(out, "Tags: [{}]", video.tags.join(", "));
        let _ = writeln!(out, "URL: {}", video.url);
    }
    out
}
