//! Upstream server builds, as published in the revision index.

use std::collections::HashMap;
use std::future::Future;

use percent_encoding::percent_decode_str;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionInfo {
    /// Content hash identifying the build; filled from the index key.
    #[serde(default)]
    pub hash: String,
    pub url: String,
    #[serde(default)]
    pub size: u64,
}

#[derive(Debug, Default, Deserialize)]
struct RevisionIndex {
    #[serde(default)]
    latest: Option<String>,
    #[serde(default)]
    hashes: HashMap<String, RevisionInfo>,
}

impl RevisionIndex {
    fn into_latest(mut self) -> Option<RevisionInfo> {
        let latest = self.latest.filter(|hash| !hash.is_empty())?;
        let mut info = self.hashes.remove(&latest)?;
        info.url = percent_decode_str(&info.url).decode_utf8_lossy().into_owned();
        info.hash = latest;
        Some(info)
    }
}

/// Parse a revision index document and pick its latest entry.
pub fn parse_latest(document: &[u8]) -> Result<Option<RevisionInfo>> {
    let index: RevisionIndex = serde_json::from_slice(document)?;
    Ok(index.into_latest())
}

/// Whether an installation at `installed` lags behind `latest`.
pub fn has_update(installed: Option<&str>, latest: &RevisionInfo) -> bool {
    installed != Some(latest.hash.as_str())
}

/// Where the registry learns about the newest server build.
pub trait ReleaseSource: Send + Sync + 'static {
    fn latest_revision(&self) -> impl Future<Output = Result<Option<RevisionInfo>>> + Send;
}

pub struct HttpReleaseSource {
    client: Client,
    url: String,
}

impl HttpReleaseSource {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

impl ReleaseSource for HttpReleaseSource {
    async fn latest_revision(&self) -> Result<Option<RevisionInfo>> {
        let resp = self
            .client
            .get(&self.url)
            .header("User-Agent", "hmp-launcher")
            .send()
            .await
            .map_err(|e| AppError::network_with_url(&self.url, e.to_string()))?;

        if !resp.status().is_success() {
            return Err(AppError::network_with_url(
                &self.url,
                format!("status {}", resp.status()),
            ));
        }

        let body = resp
            .bytes()
            .await
            .map_err(|e| AppError::network_with_url(&self.url, e.to_string()))?;
        parse_latest(&body)
    }
}
