//! Policy engine: reliability rules applied around a single request.
//!
//! ```text
//! Request → [RetryPolicy] → [RequestExecutor]
//! ```

pub mod retry;

pub use retry::{
    execute_with_retry, parse_retry_after, retry_after_from_header, RetryConfig, RetryDecision,
    RetryPolicy,
};
