//! HTTP delivery of upload requests.

use super::{ChunkSink, SinkResponse, UploadRequest};
use crate::{NetworkError, Result, SnapError};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use std::time::Duration;
use tracing::debug;

pub const HEADER_FILE_NAME: &str = "x-file-name";
pub const HEADER_ARCHIVE_SIZE: &str = "x-archive-size";
pub const HEADER_ARCHIVE_SHA256: &str = "x-archive-sha256";
pub const HEADER_SESSION: &str = "x-upload-session";
pub const HEADER_CHUNK_INDEX: &str = "x-chunk-index";
pub const HEADER_CHUNK_TOTAL: &str = "x-chunk-total";
pub const HEADER_CHUNK_SHA256: &str = "x-chunk-sha256";
pub const HEADER_CHUNK_OFFSET: &str = "x-chunk-offset";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// POSTs every request to one endpoint, with a bearer token when one is given
#[derive(Debug, Clone)]
pub struct HttpSink {
    client: reqwest::Client,
    endpoint: String,
    auth_token: Option<String>,
    request_timeout: Duration,
}

impl HttpSink {
    /// Every request, including reading its response body, must finish within `request_timeout`
    pub fn new(endpoint: &str, auth_token: Option<&str>, request_timeout: Duration) -> Result<Self> {
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(SnapError::configuration(format!(
                "endpoint must be an http(s) URL, got '{endpoint}'"
            )));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT.min(request_timeout))
            .timeout(request_timeout)
            .build()
            .map_err(|e| SnapError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            auth_token: auth_token.filter(|t| !t.is_empty()).map(str::to_string),
            request_timeout,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn request_error(&self, stage: &str, err: reqwest::Error) -> NetworkError {
        if err.is_timeout() {
            NetworkError::RequestTimeout(self.request_timeout)
        } else {
            NetworkError::Connect(format!("{stage}: {err}"))
        }
    }
}

#[async_trait]
impl ChunkSink for HttpSink {
    async fn deliver(&self, request: &UploadRequest) -> std::result::Result<SinkResponse, NetworkError> {
        let mut builder = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(HEADER_FILE_NAME, request.archive.file_name.as_str())
            .header(HEADER_ARCHIVE_SIZE, request.archive.size.to_string())
            .header(HEADER_ARCHIVE_SHA256, request.archive.sha256.as_str());

        if let Some(token) = &self.auth_token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        if let Some(chunk) = &request.chunk {
            builder = builder
                .header(HEADER_SESSION, chunk.session_id.to_string())
                .header(HEADER_CHUNK_INDEX, chunk.index.to_string())
                .header(HEADER_CHUNK_TOTAL, chunk.total.to_string())
                .header(HEADER_CHUNK_SHA256, chunk.sha256.as_str())
                .header(HEADER_CHUNK_OFFSET, chunk.offset.to_string());
        }

        let response = builder
            .body(request.body.clone())
            .send()
            .await
            .map_err(|e| self.request_error("sending request", e))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| self.request_error("reading response body", e))?;
        debug!(
            endpoint = %self.endpoint,
            status,
            chunk = request.chunk.as_ref().map(|c| c.index),
            "upload request answered"
        );
        Ok(SinkResponse { status, body })
    }
}
