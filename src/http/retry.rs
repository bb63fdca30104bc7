//! Fixed-delay retry loop and the errors it classifies.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, error, warn};
use reqwest::{StatusCode, Url};

/// Failure of a single request attempt.
#[derive(Debug)]
pub enum RequestError {
    /// Connection, timeout, redirect or body error raised by the HTTP client
    Transport(reqwest::Error),
    /// Non-2xx response while status checking is enabled
    Status { status: StatusCode, url: Url },
    /// Configuration that can never produce a valid request
    InvalidConfig(String),
}

impl RequestError {
    /// The response status, if the server answered at all.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            RequestError::Transport(e) => e.status(),
            RequestError::Status { status, .. } => Some(*status),
            RequestError::InvalidConfig(_) => None,
        }
    }
}

impl std::fmt::Display for RequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestError::Transport(e) => write!(f, "Request failed: {}", e),
            RequestError::Status { status, url } => {
                write!(f, "Unexpected status {} from {}", status, url)
            }
            RequestError::InvalidConfig(msg) => {
                write!(f, "Invalid request configuration: {}", msg)
            }
        }
    }
}

impl std::error::Error for RequestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RequestError::Transport(e) => Some(e),
            _ => None,
        }
    }
}

/// Attached to the last failure once every attempt has been used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptsExhausted {
    pub operation: String,
    pub attempts: u32,
}

impl std::fmt::Display for AttemptsExhausted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: failed after {} attempts",
            self.operation, self.attempts
        )
    }
}

impl std::error::Error for AttemptsExhausted {}

/// How many times to try and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempt_count: u32,
    pub request_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempt_count: u32, request_delay: Duration) -> Self {
        Self {
            max_attempt_count,
            request_delay,
        }
    }

    /// Total attempts; a zero count still makes one.
    pub fn attempts(&self) -> u32 {
        self.max_attempt_count.max(1)
    }
}

/// Waits between attempts. Injected so tests can observe delays without sleeping.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// [`Sleeper`] backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Checks if an anyhow::Error is worth another attempt.
///
/// Request-construction errors (bad URL, bad header) and invalid
/// configuration fail the same way every time; everything else is retried.
pub fn is_retryable_error(e: &anyhow::Error) -> bool {
    match e.downcast_ref::<RequestError>() {
        Some(RequestError::InvalidConfig(_)) => false,
        Some(RequestError::Transport(inner)) => !inner.is_builder(),
        Some(RequestError::Status { .. }) => true,
        None => e
            .downcast_ref::<reqwest::Error>()
            .is_none_or(|inner| !inner.is_builder()),
    }
}

/// Executes an async operation, retrying retryable failures with a fixed delay.
///
/// After the last attempt the final error is returned with an
/// [`AttemptsExhausted`] context; non-retryable errors are returned as is.
pub async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    operation_name: &str,
    operation: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let attempts = policy.attempts();
    let mut last_error = None;

    for attempt in 1..=attempts {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !is_retryable_error(&e) {
                    debug!("{}: non-retryable error: {}", operation_name, e);
                    return Err(e);
                }

                if attempt < attempts {
                    warn!(
                        "{}: attempt {}/{} failed ({}), retrying in {:?}...",
                        operation_name, attempt, attempts, e, policy.request_delay
                    );
                    if !policy.request_delay.is_zero() {
                        sleeper.sleep(policy.request_delay).await;
                    }
                }
                last_error = Some(e);
            }
        }
    }

    let exhausted = AttemptsExhausted {
        operation: operation_name.to_string(),
        attempts,
    };

    match last_error {
        Some(e) => {
            error!("{} ({})", exhausted, e);
            Err(e.context(exhausted))
        }
        None => Err(anyhow::Error::new(exhausted)),
    }
}
