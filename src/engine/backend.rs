use crate::error::ClientError;
use crate::model::{ProcessingSummary, Receipt, RunConfig};
use anyhow::{Context, Result};
use bytes::Bytes;
use reqwest::Url;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client for the receipt-processing backend.
#[derive(Clone)]
pub struct BackendClient {
    pub http: reqwest::Client,
    base: Url,
    process_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct SelectFolderResponse {
    success: bool,
}

impl BackendClient {
    pub fn new(cfg: &RunConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("build HTTP client")?;

        // Url::join drops the last path segment without a trailing slash.
        let mut base = cfg.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base = Url::parse(&base).with_context(|| format!("invalid base URL: {}", cfg.base_url))?;

        Ok(Self {
            http,
            base,
            process_timeout: cfg.process_timeout,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        self.base
            .join(path)
            .map_err(|e| ClientError::OperationFailed(format!("bad endpoint {path}: {e}")))
    }

    pub fn progress_url(&self) -> Result<Url, ClientError> {
        self.base
            .join("progress")
            .map_err(|e| ClientError::StreamError(format!("bad progress endpoint: {e}")))
    }

    /// Ask the backend to open its folder-selection dialog. The call is
    /// synchronous on the server side; a `success: false` reply means the user
    /// dismissed the dialog.
    pub async fn select_folder(&self) -> Result<(), ClientError> {
        let url = self
            .base
            .join("select-folder")
            .map_err(|e| ClientError::SelectionFailed(format!("bad endpoint: {e}")))?;
        let resp = self
            .http
            .post(url)
            .send()
            .await
            .map_err(|e| ClientError::SelectionFailed(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ClientError::SelectionFailed(format!("HTTP {}", resp.status())));
        }
        let body: SelectFolderResponse = resp
            .json()
            .await
            .map_err(|e| ClientError::SelectionFailed(e.to_string()))?;
        if !body.success {
            return Err(ClientError::SelectionFailed("no folder selected".into()));
        }
        Ok(())
    }

    /// Start server-side processing. Exactly one outbound request per run;
    /// progress arrives out-of-band via the stream, the response carries the
    /// terminal summary.
    pub async fn start_processing(&self) -> Result<ProcessingSummary, ClientError> {
        let url = self
            .base
            .join("process")
            .map_err(|e| ClientError::OperationFailed(format!("bad endpoint: {e}")))?;
        let resp = self
            .http
            .post(url)
            .timeout(self.process_timeout)
            .send()
            .await
            .map_err(|e| ClientError::OperationFailed(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ClientError::OperationFailed(format!("HTTP {}", resp.status())));
        }
        resp.json::<ProcessingSummary>()
            .await
            .map_err(|e| ClientError::OperationFailed(e.to_string()))
    }

    pub async fn fetch_receipts(&self) -> Result<Vec<Receipt>, ClientError> {
        let url = self
            .base
            .join("api/receipts")
            .map_err(|e| ClientError::FetchListFailed(format!("bad endpoint: {e}")))?;
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ClientError::FetchListFailed(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ClientError::FetchListFailed(format!("HTTP {}", resp.status())));
        }
        resp.json::<Vec<Receipt>>()
            .await
            .map_err(|e| ClientError::FetchListFailed(e.to_string()))
    }

    /// Push one local file to the backend ahead of processing.
    pub async fn upload_file(&self, path: &Path) -> Result<(), ClientError> {
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("receipt")
            .to_string();
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ClientError::OperationFailed(format!("read {}: {e}", path.display())))?;
        let part = reqwest::multipart::Part::bytes(bytes).file_name(filename);
        let form = reqwest::multipart::Form::new().part("file", part);

        let resp = self
            .http
            .post(self.endpoint("upload")?)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ClientError::OperationFailed(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ClientError::OperationFailed(format!(
                "upload rejected: HTTP {}",
                resp.status()
            )));
        }
        Ok(())
    }

    /// Fetch the processed spreadsheet as raw bytes.
    pub async fn download_spreadsheet(&self) -> Result<Bytes, ClientError> {
        let url = self
            .base
            .join("download")
            .map_err(|e| ClientError::DownloadFailed(format!("bad endpoint: {e}")))?;
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| ClientError::DownloadFailed(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ClientError::DownloadFailed(format!("HTTP {}", resp.status())));
        }
        resp.bytes()
            .await
            .map_err(|e| ClientError::DownloadFailed(e.to_string()))
    }
}
