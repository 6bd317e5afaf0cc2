use std::time::Duration;

use bytes::Bytes;
use reqwest::Client as ReqwestClient;
use reqwest::header::{self, HeaderValue};
use serde::Serialize;

use crate::collaborators::backend::error_from_response;
use crate::{Error, Result};

/// Parameters for one image synthesis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageRequest {
    /// Text prompt.
    pub prompt: String,

    /// Output width in pixels.
    pub width: u32,

    /// Output height in pixels.
    pub height: u32,

    /// Number of inference steps.
    pub steps: u32,
}

/// A synthesized image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedImage {
    /// MIME type reported by the service.
    pub mime: String,

    /// Raw image bytes.
    pub data: Bytes,
}

/// An image-synthesis collaborator.
#[async_trait::async_trait]
pub trait ImageService: Send + Sync {
    /// Produce an image for `request`.
    async fn synthesize(&self, request: &ImageRequest) -> Result<GeneratedImage>;
}

/// An image service that POSTs a JSON prompt and receives the binary image as the body.
#[derive(Debug, Clone)]
pub struct HttpImageService {
    endpoint: String,
    token: Option<String>,
    client: ReqwestClient,
}

impl HttpImageService {
    /// Create a new image service client.
    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Result<Self> {
        let endpoint = endpoint.into();
        url::Url::parse(&endpoint)?;
        let client = ReqwestClient::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            endpoint,
            token,
            client,
        })
    }
}

#[derive(Serialize)]
struct ImagePayload<'a> {
    inputs: &'a str,
    parameters: ImageParameters,
}

#[derive(Serialize)]
struct ImageParameters {
    width: u32,
    height: u32,
    num_inference_steps: u32,
}

impl<'a> From<&'a ImageRequest> for ImagePayload<'a> {
    fn from(request: &'a ImageRequest) -> Self {
        Self {
            inputs: &request.prompt,
            parameters: ImageParameters {
                width: request.width,
                height: request.height,
                num_inference_steps: request.steps,
            },
        }
    }
}

#[async_trait::async_trait]
impl ImageService for HttpImageService {
    async fn synthesize(&self, request: &ImageRequest) -> Result<GeneratedImage> {
        let mut builder = self
            .client
            .post(&self.endpoint)
            .json(&ImagePayload::from(request));
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        let response = builder.send().await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        let mime = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v: &HeaderValue| v.to_str().ok())
            .unwrap_or("image/png")
            .to_string();
        if !mime.starts_with("image/") {
            return Err(Error::serialization(
                format!("image service returned {mime} instead of an image"),
                None,
            ));
        }
        let data = response.bytes().await?;
        if data.is_empty() {
            return Err(Error::serialization("image service returned no data", None));
        }
        Ok(GeneratedImage { mime, data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_shape() {
        let request = ImageRequest {
            prompt: "a red fox".to_string(),
            width: 1024,
            height: 768,
            steps: 4,
        };
        let json = serde_json::to_value(ImagePayload::from(&request)).unwrap();
        assert_eq!(json["inputs"], "a red fox");
        assert_eq!(json["parameters"]["width"], 1024);
        assert_eq!(json["parameters"]["height"], 768);
        assert_eq!(json["parameters"]["num_inference_steps"], 4);
    }

    #[test]
    fn rejects_bad_endpoint() {
        assert!(HttpImageService::new("::", None).is_err());
    }
}
