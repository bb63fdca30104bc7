//! HTTP request plumbing: per-call options, retry loop and error classification.

mod options;
mod retry;

pub use options::RequestOptions;
#[cfg(test)]
pub use retry::MockSleeper;
pub use retry::{
    AttemptsExhausted, RequestError, RetryPolicy, Sleeper, TokioSleeper, is_retryable_error,
    with_retry,
};
