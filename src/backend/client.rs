//! Chinachu API Client
//!
//! Provides access to the recording server for preview images and the
//! recorded program listing.

use anyhow::{Context, Result};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, info};

use super::errors::BackendError;
use super::types::{PreviewImage, PreviewRequest, RecordedProgram};
use crate::config::{Settings, DEFAULT_URL};

/// HTTP client timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for one recording server
#[derive(Clone)]
pub struct BackendClient {
    /// HTTP client for making requests
    http_client: Client,
    /// Base URL as configured (may lack a scheme)
    url: String,
    /// Basic auth credentials
    user: String,
    password: String,
}

impl BackendClient {
    /// Create a client from the connection settings
    pub fn new(settings: &Settings) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http_client,
            url: settings.url.clone(),
            user: settings.user.clone(),
            password: settings.password.clone(),
        })
    }

    /// Full URL for an API path, with credentials embedded.
    ///
    /// Suitable for handing to external players that cannot send an
    /// Authorization header themselves.
    pub fn get_url(&self, path: &str) -> String {
        self.build_url(path, true)
    }

    fn build_url(&self, path: &str, with_auth: bool) -> String {
        let mut base = if self.url.is_empty() {
            DEFAULT_URL.to_string()
        } else {
            self.url.clone()
        };

        if !(base.starts_with("http://") || base.starts_with("https://")) {
            base = format!("http://{}", base);
        }

        if with_auth && !self.user.is_empty() {
            let auth = if self.password.is_empty() {
                self.user.clone()
            } else {
                format!("{}:{}", self.user, self.password)
            };
            // Scheme is guaranteed above, split right after "://"
            if let Some(idx) = base.find("://") {
                base.insert_str(idx + 3, &format!("{}@", auth));
            }
        }

        if base.ends_with('/') {
            base.pop();
        }

        format!("{}{}", base, path)
    }

    /// GET request builder with basic auth applied
    fn get(&self, path: &str) -> RequestBuilder {
        let request = self.http_client.get(self.build_url(path, false));
        if self.user.is_empty() {
            request
        } else {
            let password = (!self.password.is_empty()).then_some(&self.password);
            request.basic_auth(&self.user, password)
        }
    }

    /// Download the preview image of a recording.
    ///
    /// A successful response without a body is an `EmptyResponse` error.
    /// No retries are attempted.
    pub async fn fetch_preview(&self, request: &PreviewRequest) -> Result<PreviewImage, BackendError> {
        let path = request.path();
        let query = request.query_pairs();

        debug!(id = %request.id, path = %path, query = ?query, "Fetching preview from backend");

        let response = self.get(&path).query(&query).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status.as_u16(), &body));
        }

        let mime = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(';').next())
            .map(|value| value.trim().to_ascii_lowercase())
            .filter(|value| value.starts_with("image/"))
            .unwrap_or_else(|| request.image_format().mime().to_string());

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Err(BackendError::EmptyResponse {
                status: status.as_u16(),
            });
        }

        debug!(id = %request.id, size = bytes.len(), mime = %mime, "Downloaded preview");
        Ok(PreviewImage {
            mime,
            bytes: bytes.to_vec(),
        })
    }

    /// GET an API path and decode its JSON body
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, BackendError> {
        debug!(path = %path, "Requesting from backend");
        let response = self.get(path).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::from_status(status.as_u16(), &body));
        }

        Ok(response.json().await?)
    }

    /// GET several API paths concurrently.
    ///
    /// Results are in the order of `paths`. The first failure is returned
    /// and the remaining requests are aborted.
    pub async fn request_all<T>(&self, paths: &[String]) -> Result<Vec<T>, BackendError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let mut tasks = JoinSet::new();
        for (index, path) in paths.iter().enumerate() {
            let client = self.clone();
            let path = path.clone();
            tasks.spawn(async move { (index, client.get_json::<T>(&path).await) });
        }

        let mut results: Vec<Option<T>> = paths.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            let (index, result) = joined.map_err(|e| BackendError::Request(e.to_string()))?;
            results[index] = Some(result?);
        }

        debug!(count = paths.len(), "Completed batch request");
        Ok(results.into_iter().flatten().collect())
    }

    /// List recorded programs
    pub async fn list_recorded(&self) -> Result<Vec<RecordedProgram>, BackendError> {
        let programs: Vec<RecordedProgram> = self.get_json("/api/recorded.json").await?;
        info!(count = programs.len(), "Listed recorded programs");
        Ok(programs)
    }
}
