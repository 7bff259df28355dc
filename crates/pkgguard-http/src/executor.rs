//! `RequestExecutor` backed by `reqwest`.
//!
//! Resolves request paths against the configured base URL, authenticates
//! with the API token, and maps non-2xx responses to
//! [`ApiError::Protocol`] (including any `Retry-After` hint). Bodies are
//! handed back unread as byte streams.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};

use pkgguard_core::error::ApiError;
use pkgguard_core::policy::retry_after_from_header;
use pkgguard_core::request::{ApiRequest, Method};
use pkgguard_core::transport::{ByteStream, RequestExecutor, StreamingResponse};

use crate::config::ClientConfig;

/// HTTP executor for the analysis service.
pub struct HttpExecutor {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl HttpExecutor {
    pub fn new(config: &ClientConfig) -> Result<Self, ApiError> {
        config.validate()?;

        let mut builder = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs));
        if let Some(secs) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let http = builder
            .build()
            .map_err(|e| ApiError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.api_token.clone(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.basic_auth(token, Some("")),
            None => builder,
        }
    }

    async fn dispatch(
        &self,
        builder: reqwest::RequestBuilder,
        method: &str,
        path: &str,
    ) -> Result<StreamingResponse, ApiError> {
        let resp = self
            .authorize(builder)
            .send()
            .await
            .map_err(|e| ApiError::Http(e.to_string()))?;

        let status = resp.status();
        tracing::debug!(method, path, status = status.as_u16(), "response headers received");

        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(retry_after_from_header);
            let reason = status.canonical_reason().unwrap_or("unknown status");
            let body = resp.text().await.unwrap_or_default();
            let message = match body.trim() {
                "" => reason.to_string(),
                text => format!("{reason}: {text}"),
            };
            return Err(ApiError::Protocol {
                status: status.as_u16(),
                message,
                retry_after,
            });
        }

        let body = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| ApiError::StreamTransport(e.to_string())));
        Ok(StreamingResponse {
            status: status.as_u16(),
            body: Box::pin(body),
        })
    }
}

#[async_trait]
impl RequestExecutor for HttpExecutor {
    async fn request(&self, req: ApiRequest) -> Result<StreamingResponse, ApiError> {
        let url = self.url(&req.path);
        let mut builder = match req.method {
            Method::Get => self.http.get(&url),
            Method::Post => self.http.post(&url),
            Method::Put => self.http.put(&url),
            Method::Delete => self.http.delete(&url),
        };
        if !req.query.is_empty() {
            builder = builder.query(&req.query);
        }
        if let Some(body) = &req.body {
            builder = builder.json(body);
        }
        self.dispatch(builder, &req.method.to_string(), &req.path).await
    }

    async fn upload(
        &self,
        path: &str,
        content_type: &str,
        body: ByteStream,
    ) -> Result<StreamingResponse, ApiError> {
        let builder = self
            .http
            .post(self.url(path))
            .header(CONTENT_TYPE, content_type)
            .body(reqwest::Body::wrap_stream(body));
        self.dispatch(builder, "POST", path).await
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }
}
