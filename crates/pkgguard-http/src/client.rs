//! High-level client for the analysis service.
//!
//! Features:
//! - Batched purl lookups streamed back as they arrive
//! - Manifest uploads streamed from disk as `multipart/form-data`

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use pkgguard_core::batch::{BatchConfig, BatchScheduler, BatchStream};
use pkgguard_core::error::ApiError;
use pkgguard_core::purl::PurlFetcher;
use pkgguard_core::transport::RequestExecutor;

use crate::config::ClientConfig;
use crate::executor::HttpExecutor;
use crate::upload::{UploadPart, UploadStreamer};

/// Security API client.
pub struct SecurityClient {
    executor: Arc<dyn RequestExecutor>,
    config: ClientConfig,
}

impl SecurityClient {
    /// Create a client talking HTTP to `config.base_url`.
    pub fn new(config: ClientConfig) -> Result<Self, ApiError> {
        let executor = HttpExecutor::new(&config)?;
        Ok(Self::with_executor(Arc::new(executor), config))
    }

    /// Create from `PKGGUARD_API_TOKEN` / `PKGGUARD_API_URL`.
    pub fn from_env() -> Result<Self, ApiError> {
        let config = ClientConfig::from_env();
        if config.api_token.is_none() {
            return Err(ApiError::Config(format!(
                "{} is not set",
                crate::config::ENV_API_TOKEN
            )));
        }
        Self::new(config)
    }

    /// Use a custom executor (tests, proxies, alternative transports).
    pub fn with_executor(executor: Arc<dyn RequestExecutor>, config: ClientConfig) -> Self {
        Self { executor, config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Look up `purls` in chunks, with the configured chunk size and
    /// concurrency.
    pub fn batch_packages(&self, purls: Vec<String>, query: Vec<(String, String)>) -> BatchStream {
        self.batch_packages_with(purls, self.config.batch_config(), query)
    }

    /// Look up `purls` with explicit batch options.
    pub fn batch_packages_with(
        &self,
        purls: Vec<String>,
        options: BatchConfig,
        query: Vec<(String, String)>,
    ) -> BatchStream {
        info!(
            purls = purls.len(),
            chunk_size = options.chunk_size,
            concurrency = options.concurrency,
            "starting batch lookup"
        );
        let fetcher = PurlFetcher::new(self.executor.clone(), self.config.retry_policy()).with_query(query);
        BatchScheduler::new(options).stream(purls, Arc::new(fetcher))
    }

    /// Upload manifest parts as a full scan for `org` and return the created
    /// scan record.
    pub async fn upload_manifests(&self, org: &str, parts: Vec<UploadPart>) -> Result<Value, ApiError> {
        if org.is_empty() || org.contains(['/', '?', '#']) {
            return Err(ApiError::Config(format!("invalid organization slug '{org}'")));
        }
        let path = format!("/orgs/{org}/full-scans");
        let streamer = UploadStreamer::new(self.config.upload_chunk_bytes, self.config.upload_queue);
        let response = streamer.send(self.executor.clone(), &path, parts).await?;
        let scan: Value = response.json().await?;
        let id = scan.get("id").and_then(Value::as_str).unwrap_or("-");
        info!(org, id, "full scan created");
        Ok(scan)
    }

    /// Upload files from disk; each is named by its path relative to `root`
    /// when possible.
    pub async fn upload_manifest_files(
        &self,
        org: &str,
        root: &Path,
        files: &[PathBuf],
    ) -> Result<Value, ApiError> {
        let parts = files
            .iter()
            .map(|path| {
                let name = path.strip_prefix(root).unwrap_or(path.as_path()).to_string_lossy().replace('\\', "/");
                UploadPart::file(path.clone(), name)
            })
            .collect();
        self.upload_manifests(org, parts).await
    }
}
