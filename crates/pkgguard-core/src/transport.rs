//! The `RequestExecutor` trait: the seam between the pipeline and HTTP.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::ApiError;
use crate::request::ApiRequest;

/// A response body delivered incrementally.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ApiError>> + Send>>;

/// Decoded JSON records of one response body.
pub type RecordStream = Pin<Box<dyn Stream<Item = Result<Value, ApiError>> + Send>>;

/// A successful (2xx) response whose body has not been read yet.
pub struct StreamingResponse {
    pub status: u16,
    pub body: ByteStream,
}

impl StreamingResponse {
    /// Wrap an in-memory body, mostly useful for tests and mocks.
    pub fn from_bytes(status: u16, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        Self {
            status,
            body: Box::pin(futures::stream::once(async move { Ok(body) })),
        }
    }

    /// Read the entire body into memory.
    pub async fn bytes(mut self) -> Result<Bytes, ApiError> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.body.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    /// Read the entire body and deserialize it.
    pub async fn json<T: DeserializeOwned>(self) -> Result<T, ApiError> {
        let bytes = self.bytes().await?;
        serde_json::from_slice(&bytes).map_err(ApiError::Deserialization)
    }
}

impl std::fmt::Debug for StreamingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Issues requests against the service.
///
/// Implementations own URL construction, authentication and base-URL
/// handling. Non-2xx responses must be reported as [`ApiError::Protocol`],
/// carrying the parsed `Retry-After` hint when the server sent one.
///
/// The trait is object-safe and is usually held as `Arc<dyn RequestExecutor>`.
#[async_trait]
pub trait RequestExecutor: Send + Sync + 'static {
    /// Send one request and return the (unread) response.
    async fn request(&self, req: ApiRequest) -> Result<StreamingResponse, ApiError>;

    /// POST a streamed body with an explicit content type.
    async fn upload(
        &self,
        path: &str,
        content_type: &str,
        body: ByteStream,
    ) -> Result<StreamingResponse, ApiError> {
        let _ = (content_type, body);
        Err(ApiError::Config(format!(
            "executor for {} does not support uploads (path: {path})",
            self.base_url()
        )))
    }

    /// Base URL every request path is resolved against.
    fn base_url(&self) -> &str;

    /// Convenience: send a request and deserialize the whole body.
    async fn call<T: DeserializeOwned>(&self, req: ApiRequest) -> Result<T, ApiError>
    where
        Self: Sized,
    {
        self.request(req).await?.json().await
    }
}
