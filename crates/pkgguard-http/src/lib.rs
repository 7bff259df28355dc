//! pkgguard-http: HTTP transport, upload streaming and the high-level client.
//!
//! ```rust,no_run
//! use futures::StreamExt;
//! use pkgguard_http::SecurityClient;
//!
//! # async fn run() -> Result<(), pkgguard_core::ApiError> {
//! let client = SecurityClient::from_env()?;
//! let mut results = client.batch_packages(vec!["pkg:npm/left-pad@1.3.0".into()], vec![]);
//! while let Some(item) = results.next().await {
//!     println!("{}", item?.to_json());
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod executor;
pub mod upload;

pub use client::SecurityClient;
pub use config::ClientConfig;
pub use executor::HttpExecutor;
pub use upload::{BodyOutcome, ChannelSink, PartBody, PartSource, UploadPart, UploadSink, UploadStreamer};
