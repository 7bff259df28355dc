//! Error taxonomy shared by every pkgguard crate.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while talking to the analysis service.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The server answered with a non-2xx status.
    #[error("HTTP {status}: {message}")]
    Protocol {
        status: u16,
        message: String,
        /// Parsed `Retry-After` hint, if the server sent one.
        retry_after: Option<Duration>,
    },

    /// Connection refused, DNS failure, timeout before a response arrived.
    #[error("HTTP error: {0}")]
    Http(String),

    /// The response body broke off mid-stream.
    #[error("stream interrupted: {0}")]
    StreamTransport(String),

    /// A local upload source could not be read.
    #[error("failed to read upload source '{source_name}': {source}")]
    UploadIo {
        source_name: String,
        #[source]
        source: std::io::Error,
    },

    /// An upload part cannot be framed as multipart content.
    #[error("invalid upload part: {0}")]
    InvalidPart(String),

    /// Every attempt failed; wraps the error from the final attempt.
    #[error("request failed after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<ApiError>,
    },

    /// The operation was cancelled through its cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    /// Response could not be deserialized.
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),

    /// Missing or invalid client configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ApiError {
    /// Shorthand for a [`ApiError::Protocol`] without a retry hint.
    pub fn protocol(status: u16, message: impl Into<String>) -> Self {
        Self::Protocol {
            status,
            message: message.into(),
            retry_after: None,
        }
    }

    /// HTTP status behind this error, looking through retry annotations.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Protocol { status, .. } => Some(*status),
            Self::RetriesExhausted { source, .. } => source.status(),
            _ => None,
        }
    }

    /// Server-supplied retry delay, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Protocol { retry_after, .. } => *retry_after,
            Self::RetriesExhausted { source, .. } => source.retry_after(),
            _ => None,
        }
    }

    /// 401 or 403. These never heal on their own.
    pub fn is_auth_error(&self) -> bool {
        matches!(self.status(), Some(401 | 403))
    }

    /// 429 Too Many Requests.
    pub fn is_rate_limited(&self) -> bool {
        self.status() == Some(429)
    }

    /// Any 5xx status.
    pub fn is_server_error(&self) -> bool {
        matches!(self.status(), Some(s) if s >= 500)
    }

    /// Returns `true` if another attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        !self.is_auth_error()
            && !matches!(
                self,
                Self::Cancelled
                    | Self::InvalidPart(_)
                    | Self::Config(_)
                    | Self::UploadIo { .. }
                    | Self::RetriesExhausted { .. }
            )
    }

    /// Server errors that survived every retry. A batch run stops on these
    /// instead of degrading them into per-chunk failure records.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RetriesExhausted { source, .. } if source.is_server_error())
    }

    /// The error from the last attempt, with retry annotations peeled off.
    pub fn root(&self) -> &ApiError {
        match self {
            Self::RetriesExhausted { source, .. } => source.root(),
            other => other,
        }
    }
}
