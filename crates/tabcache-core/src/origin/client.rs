//! REST client for the origin content service.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, Url};
use tracing::debug;

use super::{ContentFetcher, OriginError, OriginItem};

/// Transport-level ceiling. The engine applies its own, shorter deadline on
/// top of this, so it only matters for callers using the client directly.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Path segment under which the origin serves content items
const CONTENT_PATH: &str = "content";

/// HTTP origin client.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpOrigin {
    client: Client,
    base_url: Url,
    token: Option<Arc<String>>,
}

impl HttpOrigin {
    pub fn new(base_url: &str) -> Result<Self, OriginError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        let base_url = Url::parse(base_url)
            .map_err(|e| OriginError::InvalidResponse(format!("bad origin url {}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(OriginError::InvalidResponse(format!(
                "origin url {} cannot carry a path",
                base_url
            )));
        }

        Ok(Self {
            client,
            base_url,
            token: None,
        })
    }

    /// Create a client that sends `token` as a bearer credential, sharing the
    /// connection pool.
    pub fn with_token(&self, token: Arc<String>) -> Self {
        Self {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            token: Some(token),
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// `{base}/content/{key}`, with the key escaped as a single segment.
    fn endpoint(&self, key: &str) -> Result<Url, OriginError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| OriginError::InvalidResponse(format!("origin url {} cannot carry a path", self.base_url)))?
            .pop_if_empty()
            .push(CONTENT_PATH)
            .push(key);
        Ok(url)
    }

    fn auth_headers(&self) -> Result<header::HeaderMap, OriginError> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));
        if let Some(ref token) = self.token {
            let value = header::HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| OriginError::InvalidResponse(format!("invalid token: {}", e)))?;
            headers.insert(header::AUTHORIZATION, value);
        }
        Ok(headers)
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, OriginError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(OriginError::from_status(status, &body))
        }
    }
}

#[async_trait]
impl ContentFetcher for HttpOrigin {
    async fn fetch(&self, key: &str) -> Result<OriginItem, OriginError> {
        let url = self.endpoint(key)?;
        debug!(url = %url, "Fetching content from origin");

        let response = self
            .client
            .get(url)
            .headers(self.auth_headers()?)
            .send()
            .await?;

        let response = Self::check_response(response).await?;
        let text = response.text().await?;
        serde_json::from_str(&text)
            .map_err(|e| OriginError::InvalidResponse(format!("Failed to parse content item {}: {}", key, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_escapes_key() {
        let origin = HttpOrigin::new("https://api.example.com/v1/").unwrap();
        assert_eq!(
            origin.endpoint("home banner/top").unwrap().as_str(),
            "https://api.example.com/v1/content/home%20banner%2Ftop"
        );

        let origin = HttpOrigin::new("https://api.example.com").unwrap();
        assert_eq!(
            origin.endpoint("test-content-123").unwrap().as_str(),
            "https://api.example.com/content/test-content-123"
        );
    }

    #[test]
    fn test_rejects_non_base_url() {
        assert!(HttpOrigin::new("mailto:someone@example.com").is_err());
        assert!(HttpOrigin::new("not a url").is_err());
    }

    #[test]
    fn test_token_header() {
        let origin = HttpOrigin::new("https://api.example.com").unwrap();
        assert!(origin.auth_headers().unwrap().get(header::AUTHORIZATION).is_none());

        let authed = origin.with_token(Arc::new("abc".to_string()));
        assert_eq!(
            authed.auth_headers().unwrap()[header::AUTHORIZATION],
            "Bearer abc"
        );
    }
}
