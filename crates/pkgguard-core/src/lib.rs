//! pkgguard-core: pipeline engines for the pkgguard security client.
//!
//! # Overview
//!
//! pkgguard fetches security data for large lists of package URLs (purls)
//! from a remote analysis service. The core crate defines:
//!
//! - [`RequestExecutor`]: the async trait every HTTP backend implements
//! - [`ApiError`]: structured error taxonomy
//! - [`policy`] module: status-aware retry with `Retry-After` support
//! - [`ndjson`] module: line-delimited JSON decoding over chunked bodies
//! - [`batch`] module: bounded-concurrency chunk scheduler
//! - [`purl`] module: the `POST /purl` chunk fetcher tying them together

pub mod batch;
pub mod error;
pub mod ndjson;
pub mod policy;
pub mod purl;
pub mod request;
pub mod transport;

pub use batch::{
    partition, stream_batches, BatchConfig, BatchResult, BatchScheduler, BatchStats, BatchStream,
    Chunk, ChunkFetcher, ChunkResponse,
};
pub use error::ApiError;
pub use ndjson::{decode_stream, DecoderStats, NdjsonDecoder};
pub use policy::{execute_with_retry, RetryConfig, RetryPolicy};
pub use purl::PurlFetcher;
pub use request::{ApiRequest, Method, PurlBatchRequest, PurlComponent};
pub use transport::{ByteStream, RecordStream, RequestExecutor, StreamingResponse};

pub use tokio_util::sync::CancellationToken;
