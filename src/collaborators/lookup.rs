use std::time::Duration;

use reqwest::Client as ReqwestClient;
use serde::{Deserialize, Serialize};

use crate::collaborators::backend::error_from_response;
use crate::{Error, Result};

/// A structured lookup request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LookupRequest {
    /// What to look up, e.g. `schedule` or `catalog`.
    pub action: String,

    /// The date the lookup applies to, as given by the model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,

    /// Optional free-text filter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

/// One row of a lookup response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupEntry {
    /// Row label, e.g. a time slot or item name.
    pub label: String,

    /// Row detail.
    #[serde(default)]
    pub detail: String,
}

/// A structured lookup response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupResponse {
    /// Rows in the order the service returned them.
    #[serde(default)]
    pub entries: Vec<LookupEntry>,
}

/// A schedule/catalog lookup collaborator.
#[async_trait::async_trait]
pub trait LookupService: Send + Sync {
    /// Perform `request` with the caller-supplied `token`.
    async fn lookup(&self, request: &LookupRequest, token: &str) -> Result<LookupResponse>;
}

/// A lookup service reached with `GET <base>/<action>?date=..&q=..`.
#[derive(Debug, Clone)]
pub struct HttpLookupService {
    base_url: url::Url,
    client: ReqwestClient,
}

impl HttpLookupService {
    /// Create a client rooted at `base_url`.
    pub fn new(base_url: &str) -> Result<Self> {
        let mut base_url = url::Url::parse(base_url)?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = ReqwestClient::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self { base_url, client })
    }

    fn request_url(&self, request: &LookupRequest) -> Result<url::Url> {
        let action = request.action.trim().to_lowercase();
        if action.is_empty() || !action.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::validation(
                format!("unsupported lookup action: {}", request.action),
                Some("ACTION".to_string()),
            ));
        }
        let mut url = self.base_url.join(&action)?;
        {
            let mut pairs = url.query_pairs_mut();
            if let Some(date) = &request.date {
                pairs.append_pair("date", date);
            }
            if let Some(query) = &request.query {
                pairs.append_pair("q", query);
            }
        }
        Ok(url)
    }
}

#[async_trait::async_trait]
impl LookupService for HttpLookupService {
    async fn lookup(&self, request: &LookupRequest, token: &str) -> Result<LookupResponse> {
        let url = self.request_url(request)?;
        let response = self.client.get(url).bearer_auth(token).send().await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        response.json::<LookupResponse>().await.map_err(|e| {
            Error::serialization(
                format!("Failed to parse lookup response: {e}"),
                Some(Box::new(e)),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_url_shape() {
        let service = HttpLookupService::new("https://lookup.example.com/api").unwrap();
        let url = service
            .request_url(&LookupRequest {
                action: "Schedule".to_string(),
                date: Some("2024-05-01".to_string()),
                query: Some("room 4".to_string()),
            })
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://lookup.example.com/api/schedule?date=2024-05-01&q=room+4"
        );
    }

    #[test]
    fn rejects_path_like_actions() {
        let service = HttpLookupService::new("https://lookup.example.com/").unwrap();
        let err = service
            .request_url(&LookupRequest {
                action: "../admin".to_string(),
                date: None,
                query: None,
            })
            .unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn response_defaults() {
        let response: LookupResponse =
            serde_json::from_str(r#"{"entries": [{"label": "09:00"}]}"#).unwrap();
        assert_eq!(response.entries[0].label, "09:00");
        assert!(response.entries[0].detail.is_empty());
    }
}
