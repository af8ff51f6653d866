//! Upload transport.
//!
//! [`Uploader`] moves one local artifact to remote storage and reports an
//! [`UploadReceipt`]; `errno == 0` is success, anything else is a failure
//! the upload service may retry. Remote keys are scoped by item id, so
//! artifacts sharing a file name never overwrite each other.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stowage_core::types::DbId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub errno: i64,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub remote_path: Option<String>,
}

impl UploadReceipt {
    pub fn ok(remote_path: impl Into<String>) -> Self {
        Self {
            errno: 0,
            message: None,
            remote_path: Some(remote_path.into()),
        }
    }

    pub fn failed(errno: i64, message: impl Into<String>) -> Self {
        Self {
            errno,
            message: Some(message.into()),
            remote_path: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.errno == 0
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Upload request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, item_id: DbId, path: &Path) -> Result<UploadReceipt, TransportError>;
}

/// `<item_id>/<file name>`, the remote key for an item's artifact.
pub fn remote_key(item_id: DbId, path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{item_id}/{name}")
}

// ---------------------------------------------------------------------------
// HttpUploader
// ---------------------------------------------------------------------------

/// Streams the artifact as the body of an HTTP `PUT`.
///
/// A 2xx response is success unless its body is a JSON receipt with a
/// non-zero `errno`. Any other status becomes a receipt whose `errno` is the
/// status code.
pub struct HttpUploader {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(3600);

impl HttpUploader {
    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token,
        })
    }

    fn target_url(&self, item_id: DbId, path: &Path) -> String {
        format!("{}/{}", self.endpoint, remote_key(item_id, path))
    }
}

fn receipt_from_body(status: reqwest::StatusCode, body: &str, url: &str) -> UploadReceipt {
    if !status.is_success() {
        return UploadReceipt::failed(i64::from(status.as_u16()), body.trim().to_string());
    }
    match serde_json::from_str::<UploadReceipt>(body) {
        Ok(receipt) => receipt,
        Err(_) => UploadReceipt::ok(url),
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn upload(&self, item_id: DbId, path: &Path) -> Result<UploadReceipt, TransportError> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|source| TransportError::Io {
                path: path.display().to_string(),
                source,
            })?;
        let len = file
            .metadata()
            .await
            .map_err(|source| TransportError::Io {
                path: path.display().to_string(),
                source,
            })?
            .len();
        let body = reqwest::Body::wrap_stream(tokio_util::io::ReaderStream::new(file));

        let url = self.target_url(item_id, path);
        let mut request = self
            .client
            .put(&url)
            .header(reqwest::header::CONTENT_LENGTH, len)
            .body(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let receipt = receipt_from_body(status, &text, &url);

        tracing::debug!(
            item_id,
            path = %path.display(),
            url = %url,
            status = status.as_u16(),
            errno = receipt.errno,
            "Upload request finished"
        );
        Ok(receipt)
    }
}
