//! HTTP artifact service client.

use crate::error::{ClientError, ClientResult};
use crate::source::ArtifactSource;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Url;
use std::time::Duration;
use tracing::instrument;

/// Fetches artifacts from `<base_url>/<instrument_name>/<filename>`.
#[derive(Clone)]
pub struct HttpArtifactClient {
    http: reqwest::Client,
    base_url: Url,
}

impl HttpArtifactClient {
    /// Create a client whose requests fail after `timeout`.
    pub fn new(base_url: &str, timeout: Duration) -> ClientResult<Self> {
        let base_url =
            Url::parse(base_url).map_err(|e| ClientError::InvalidUrl(format!("{base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(ClientError::InvalidUrl(format!(
                "{base_url} cannot be used as a base URL"
            )));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(ClientError::Transport)?;
        Ok(Self { http, base_url })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Artifact URL with each path segment percent-encoded.
    pub fn artifact_url(&self, instrument_name: &str, filename: &str) -> ClientResult<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .push(instrument_name)
            .push(filename);
        Ok(url)
    }
}

#[async_trait]
impl ArtifactSource for HttpArtifactClient {
    #[instrument(skip(self), fields(base_url = %self.base_url))]
    async fn fetch_artifact(&self, instrument_name: &str, filename: &str) -> ClientResult<Bytes> {
        let url = self.artifact_url(instrument_name, filename)?;
        let response = self.http.get(url.clone()).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ClientError::NotFound(format!("{instrument_name}/{filename}")));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Status {
                status: status.as_u16(),
                url: url.to_string(),
                body,
            });
        }
        let data = response.bytes().await?;
        tracing::debug!(size = data.len(), "fetched artifact");
        Ok(data)
    }
}
