//! Thin JSON client for the backend API.

use reqwest::StatusCode;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::trace;

/// Error types for backend calls.
#[derive(Debug, thiserror::Error)]
pub enum ApiClientError {
    /// The server answered 404 for a resource the client believed existed.
    #[error("not found: {url}")]
    NotFound { url: String },
    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },
    #[error(transparent)]
    Request(#[from] reqwest::Error),
}

impl ApiClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiClientError::NotFound { .. })
    }
}

/// Backend client. Every request carries the client-wide timeout, so a fetch
/// handed to the coalescer always resolves.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiClientError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("opsdesk/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiClientError> {
        let url = self.url(path);
        trace!(url = %url, "GET");
        let response = self.http.get(&url).send().await?;
        Ok(check_status(response, url)?.json().await?)
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, ApiClientError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.url(path);
        trace!(url = %url, "POST");
        let response = self.http.post(&url).json(body).send().await?;
        Ok(check_status(response, url)?.json().await?)
    }

    /// POST without a body, ignoring any response content.
    pub async fn post_empty(&self, path: &str) -> Result<(), ApiClientError> {
        let url = self.url(path);
        trace!(url = %url, "POST");
        let response = self.http.post(&url).send().await?;
        check_status(response, url)?;
        Ok(())
    }
}

fn check_status(
    response: reqwest::Response,
    url: String,
) -> Result<reqwest::Response, ApiClientError> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::NOT_FOUND => Err(ApiClientError::NotFound { url }),
        status => Err(ApiClientError::Status {
            status: status.as_u16(),
            url,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_paths_without_double_slashes() {
        let client = ApiClient::new("http://backend:8080/", Duration::from_secs(1)).unwrap();
        assert_eq!(client.base_url(), "http://backend:8080");
        assert_eq!(client.url("/api/clients"), "http://backend:8080/api/clients");
        assert_eq!(client.url("api/staff"), "http://backend:8080/api/staff");
    }
}
