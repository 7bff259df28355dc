//! Chunk fetcher for the `POST /purl` batch lookup endpoint.

use std::sync::Arc;

use async_trait::async_trait;

use crate::batch::{Chunk, ChunkFetcher, ChunkResponse};
use crate::error::ApiError;
use crate::ndjson::decode_stream;
use crate::policy::{execute_with_retry, RetryPolicy};
use crate::request::{ApiRequest, PurlBatchRequest};
use crate::transport::RequestExecutor;

pub const PURL_PATH: &str = "/purl";

/// Looks up one chunk of purls; the response body is NDJSON, one artifact per
/// line.
pub struct PurlFetcher {
    executor: Arc<dyn RequestExecutor>,
    retry: RetryPolicy,
    query: Vec<(String, String)>,
}

impl PurlFetcher {
    pub fn new(executor: Arc<dyn RequestExecutor>, retry: RetryPolicy) -> Self {
        Self {
            executor,
            retry,
            query: Vec::new(),
        }
    }

    /// Extra query parameters sent with every chunk (e.g. `alerts=true`).
    pub fn with_query<K, V>(mut self, params: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.query
            .extend(params.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }
}

#[async_trait]
impl ChunkFetcher for PurlFetcher {
    async fn fetch(&self, chunk: &Chunk) -> Result<ChunkResponse, ApiError> {
        let body = serde_json::to_value(PurlBatchRequest::from_purls(chunk.components.iter().cloned()))?;

        let response = execute_with_retry(&self.retry, |attempt| {
            tracing::debug!(
                chunk = chunk.index,
                attempt = attempt + 1,
                url = self.executor.base_url(),
                "fetching purl chunk"
            );
            let req = ApiRequest::post(PURL_PATH, body.clone()).with_query(self.query.clone());
            self.executor.request(req)
        })
        .await?;

        Ok(ChunkResponse {
            status: response.status,
            records: decode_stream(response.body),
        })
    }
}
