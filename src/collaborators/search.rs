use std::time::Duration;

use reqwest::Client as ReqwestClient;
use serde::{Deserialize, Serialize};

use crate::collaborators::backend::error_from_response;
use crate::{Error, Result};

const GOOGLE_SEARCH_ENDPOINT: &str = "https://www.googleapis.com/customsearch/v1";

/// One web search hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Title of the result page.
    pub title: String,

    /// Short excerpt from the page.
    pub snippet: String,

    /// Domain the result came from, e.g. `en.wikipedia.org`.
    pub source_domain: String,
}

/// Credentials for a search collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchCredentials {
    /// API key.
    pub key: String,

    /// Search engine id.
    pub engine_id: String,
}

/// A web search collaborator.
#[async_trait::async_trait]
pub trait SearchService: Send + Sync {
    /// Search for `query`, returning at most `limit` results in rank order.
    async fn search(
        &self,
        query: &str,
        credentials: &SearchCredentials,
        limit: usize,
    ) -> Result<Vec<SearchResult>>;
}

/// The Google custom-search JSON API.
#[derive(Debug, Clone)]
pub struct GoogleSearch {
    endpoint: String,
    client: ReqwestClient,
}

impl GoogleSearch {
    /// Create a client for the public endpoint.
    pub fn new() -> Result<Self> {
        Self::with_endpoint(GOOGLE_SEARCH_ENDPOINT)
    }

    /// Create a client for a custom endpoint.
    pub fn with_endpoint(endpoint: impl Into<String>) -> Result<Self> {
        let endpoint = endpoint.into();
        url::Url::parse(&endpoint)?;
        let client = ReqwestClient::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { endpoint, client })
    }

    fn request_url(
        &self,
        query: &str,
        credentials: &SearchCredentials,
        limit: usize,
    ) -> Result<url::Url> {
        let num = limit.clamp(1, 10).to_string();
        let url = url::Url::parse_with_params(
            &self.endpoint,
            &[
                ("key", credentials.key.as_str()),
                ("cx", credentials.engine_id.as_str()),
                ("q", query),
                ("num", num.as_str()),
            ],
        )?;
        Ok(url)
    }
}

#[derive(Deserialize)]
struct GoogleResponse {
    #[serde(default)]
    items: Vec<GoogleItem>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GoogleItem {
    #[serde(default)]
    title: String,
    #[serde(default)]
    snippet: String,
    display_link: Option<String>,
    link: Option<String>,
}

impl From<GoogleItem> for SearchResult {
    fn from(item: GoogleItem) -> Self {
        let source_domain = item
            .display_link
            .or_else(|| {
                item.link
                    .as_deref()
                    .and_then(|link| url::Url::parse(link).ok())
                    .and_then(|url| url.host_str().map(String::from))
            })
            .unwrap_or_default();
        SearchResult {
            title: item.title,
            snippet: item.snippet.replace('\n', " "),
            source_domain,
        }
    }
}

#[async_trait::async_trait]
impl SearchService for GoogleSearch {
    async fn search(
        &self,
        query: &str,
        credentials: &SearchCredentials,
        limit: usize,
    ) -> Result<Vec<SearchResult>> {
        let url = self.request_url(query, credentials, limit)?;
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        let parsed = response.json::<GoogleResponse>().await.map_err(|e| {
            Error::serialization(
                format!("Failed to parse search response: {e}"),
                Some(Box::new(e)),
            )
        })?;
        Ok(parsed
            .items
            .into_iter()
            .take(limit)
            .map(SearchResult::from)
            .collect())
    }
}
