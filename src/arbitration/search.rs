use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::guard::is_blacklisted;

const GOOGLE_SEARCH_URL: &str = "https://www.googleapis.com/customsearch/v1";
const USER_AGENT: &str = "Prophet-Betting-AI-Arbitrator/1.0";
/// Results requested per query before filtering.
const RESULTS_REQUESTED: u32 = 10;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub title: String,
    pub link: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default)]
    pub display_link: String,
}

#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>>;
}

/// Drop blacklisted or unparseable links, then keep at most `cap`.
pub fn filter_results(results: Vec<SearchResult>, cap: usize) -> Vec<SearchResult> {
    results
        .into_iter()
        .filter(|r| !is_blacklisted(&r.link))
        .take(cap)
        .collect()
}

/// Google Programmable Search (Custom Search JSON API).
#[derive(Clone)]
pub struct GoogleSearchClient {
    http: reqwest::Client,
    api_key: String,
    engine_id: String,
    timeout: Duration,
}

impl GoogleSearchClient {
    pub fn new(http: reqwest::Client, api_key: String, engine_id: String, timeout: Duration) -> Self {
        Self {
            http,
            api_key,
            engine_id,
            timeout,
        }
    }

    pub fn from_env(http: reqwest::Client, timeout: Duration) -> Result<Self> {
        let api_key = std::env::var("GOOGLE_SEARCH_API_KEY")
            .context("GOOGLE_SEARCH_API_KEY missing (set env var)")?;
        let engine_id = std::env::var("GOOGLE_SEARCH_ENGINE_ID")
            .context("GOOGLE_SEARCH_ENGINE_ID missing (set env var)")?;
        if api_key.trim().is_empty() || engine_id.trim().is_empty() {
            return Err(anyhow!("Google Search credentials empty"));
        }
        Ok(Self::new(http, api_key, engine_id, timeout))
    }
}

#[derive(Debug, Deserialize)]
struct GoogleSearchResponse {
    #[serde(default)]
    items: Vec<SearchResult>,
}

#[async_trait]
impl WebSearch for GoogleSearchClient {
    async fn search(&self, query: &str) -> Result<Vec<SearchResult>> {
        let num = RESULTS_REQUESTED.to_string();
        let resp = self
            .http
            .get(GOOGLE_SEARCH_URL)
            .timeout(self.timeout)
            .header(reqwest::header::USER_AGENT, USER_AGENT)
            .query(&[
                ("key", self.api_key.as_str()),
                ("cx", self.engine_id.as_str()),
                ("q", query),
                ("num", num.as_str()),
            ])
            .send()
            .await
            .context("google search request")?;

        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("Google Search API error: {}", status.as_u16()));
        }

        let parsed: GoogleSearchResponse = resp.json().await.context("google search json parse")?;
        debug!(query = %query, results = parsed.items.len(), "web search returned");
        Ok(parsed.items)
    }
}
