//! Provider search and URL resolution.
//!
//! Two-step flow against a third-party JSON API: a keyword query returns a
//! result list whose first entry carries id/title/artist, and a follow-up
//! query by id returns a direct playable URL. Field names and endpoint
//! templates come from [`ProviderConfig`], not from this module.

use anyhow::{Context, Result, anyhow};
use serde_json::Value;

use crate::config::ProviderConfig;
use crate::fetch::HttpFetcher;

/// A resolved, immutable play request.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct Track {
    pub id: i64,
    pub title: String,
    pub artist: String,
    pub source_url: String,
}

pub struct SearchClient<'a> {
    fetcher: &'a HttpFetcher,
    config: &'a ProviderConfig,
}

impl<'a> SearchClient<'a> {
    pub fn new(fetcher: &'a HttpFetcher, config: &'a ProviderConfig) -> Self {
        Self { fetcher, config }
    }

    /// Run the keyword query and pick the first result.
    pub fn query(&self, keyword: &str) -> Result<(i64, String, String)> {
        let url = self
            .config
            .search_url
            .replace("{keyword}", &urlencoding::encode(keyword));
        let body = self.fetcher.fetch_buffered(&url).context("search request")?;
        let root: Value = serde_json::from_slice(&body).context("search response parse")?;

        let first = root
            .as_array()
            .and_then(|a| a.first())
            .ok_or_else(|| anyhow!("search returned no results"))?;

        let fields = &self.config.fields;
        let id = value_as_i64(first.get(&fields.id))
            .ok_or_else(|| anyhow!("search result missing id"))?;
        if id <= 0 {
            return Err(anyhow!("search result has invalid id {id}"));
        }
        let title = first
            .get(&fields.title)
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("search result missing title"))?
            .to_string();
        let artist = artist_from_value(first.get(&fields.artist));

        Ok((id, title, artist))
    }

    /// Resolve a track id to a direct playable URL.
    pub fn resolve(&self, id: i64) -> Result<String> {
        let url = self.config.resolve_url.replace("{id}", &id.to_string());
        let body = self.fetcher.fetch_buffered(&url).context("resolve request")?;
        let root: Value = serde_json::from_slice(&body).context("resolve response parse")?;

        root.get(&self.config.fields.url)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow!("resolve response missing url"))
    }

    /// Fetch raw LRC text for a track. Failures here are non-fatal to
    /// playback; the caller degrades lyrics to a no-op.
    pub fn fetch_lyrics(&self, id: i64) -> Result<String> {
        let url = self.config.lyrics_url.replace("{id}", &id.to_string());
        let body = self.fetcher.fetch_buffered(&url).context("lyrics request")?;
        let root: Value = serde_json::from_slice(&body).context("lyrics response parse")?;

        let fields = &self.config.fields;
        let text = root
            .get(&fields.lyric)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .or_else(|| {
                root.get(&fields.lyric_fallback)
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
            })
            .ok_or_else(|| anyhow!("lyrics response has no lyric text"))?;
        Ok(text.to_string())
    }
}

/// Provider ids arrive either as JSON numbers or numeric strings.
fn value_as_i64(v: Option<&Value>) -> Option<i64> {
    let v = v?;
    v.as_i64().or_else(|| v.as_str()?.trim().parse().ok())
}

/// Artist fields arrive as a plain string or an array of names.
fn artist_from_value(v: Option<&Value>) -> String {
    match v {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .find_map(Value::as_str)
            .unwrap_or("Unknown artist")
            .to_string(),
        _ => "Unknown artist".to_string(),
    }
}
