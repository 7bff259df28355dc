//! Client configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use pkgguard_core::batch::BatchConfig;
use pkgguard_core::error::ApiError;
use pkgguard_core::policy::{RetryConfig, RetryPolicy};

pub const ENV_API_TOKEN: &str = "PKGGUARD_API_TOKEN";
pub const ENV_API_URL: &str = "PKGGUARD_API_URL";

/// Top-level client configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Service root, e.g. "https://api.pkgguard.dev/v0"
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// API token, sent as the basic-auth user name
    #[serde(default, skip_serializing)]
    pub api_token: Option<String>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// TCP connect timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Whole-request timeout in seconds (unset = none; batch bodies can be long)
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Purls per batch request
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Batch requests in flight
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Read size for upload sources, and capacity of the upload body channel
    #[serde(default = "default_upload_chunk_bytes")]
    pub upload_chunk_bytes: usize,
    #[serde(default = "default_upload_queue")]
    pub upload_queue: usize,
}

fn default_base_url() -> String { "https://api.pkgguard.dev/v0".into() }
fn default_user_agent() -> String { format!("pkgguard/{}", env!("CARGO_PKG_VERSION")) }
fn default_connect_timeout_secs() -> u64 { 10 }
fn default_max_retries() -> u32 { 3 }
fn default_retry_base_delay_ms() -> u64 { 1_000 }
fn default_chunk_size() -> usize { 100 }
fn default_concurrency() -> usize { 10 }
fn default_upload_chunk_bytes() -> usize { 64 * 1024 }
fn default_upload_queue() -> usize { 16 }

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_token: None,
            user_agent: default_user_agent(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: None,
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            chunk_size: default_chunk_size(),
            concurrency: default_concurrency(),
            upload_chunk_bytes: default_upload_chunk_bytes(),
            upload_queue: default_upload_queue(),
        }
    }
}

impl ClientConfig {
    /// Defaults overlaid with `PKGGUARD_API_TOKEN` / `PKGGUARD_API_URL`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(token) = lookup(ENV_API_TOKEN).filter(|t| !t.trim().is_empty()) {
            config.api_token = Some(token);
        }
        if let Some(url) = lookup(ENV_API_URL).filter(|u| !u.trim().is_empty()) {
            config.base_url = url;
        }
        config
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.api_token = Some(token.into());
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn validate(&self) -> Result<(), ApiError> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ApiError::Config(format!(
                "base_url must be an http(s) URL, got '{}'",
                self.base_url
            )));
        }
        if self.chunk_size == 0 || self.concurrency == 0 {
            return Err(ApiError::Config("chunk_size and concurrency must be at least 1".into()));
        }
        if self.upload_chunk_bytes == 0 || self.upload_queue == 0 {
            return Err(ApiError::Config(
                "upload_chunk_bytes and upload_queue must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: None,
        })
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            chunk_size: self.chunk_size,
            concurrency: self.concurrency,
            ..BatchConfig::default()
        }
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("base_url", &self.base_url)
            .field("api_token", &self.api_token.as_ref().map(|_| "<redacted>"))
            .field("user_agent", &self.user_agent)
            .field("max_retries", &self.max_retries)
            .field("chunk_size", &self.chunk_size)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}
