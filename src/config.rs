//! Request configuration bound to a mixin factory.
//!
//! A [`RequestConfig`] carries the defaults every request made through a
//! mixin falls back to. It can be built in code with the setter methods or
//! deserialized (e.g. from JSON), in which case unknown keys are rejected.

use std::time::Duration;

use anyhow::Result;
use reqwest::Method;
use reqwest::header::HeaderValue;
use serde::{Deserialize, Serialize};

use crate::http::RequestError;

/// Default number of attempts made before a request is considered failed.
pub const DEFAULT_MAX_ATTEMPT_COUNT: u32 = 5;

/// Methods a mixin may be configured with.
const SUPPORTED_METHODS: [Method; 7] = [
    Method::GET,
    Method::POST,
    Method::PUT,
    Method::PATCH,
    Method::DELETE,
    Method::HEAD,
    Method::OPTIONS,
];

/// Defaults applied to every request made through a mixin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RequestConfig {
    /// Method used when a call does not override it.
    #[serde(with = "method_name")]
    pub request_method: Method,
    /// Treat non-2xx responses as failures.
    pub check_status_code: bool,
    /// Total attempts, including the first one.
    pub max_attempt_count: u32,
    /// Pause between a failed attempt and the next one.
    #[serde(with = "delay_seconds")]
    pub request_delay: Duration,
    /// `Referer` header sent with every request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_referer: Option<String>,
    /// Share one session between all mixins built from the same factory.
    pub persist_session: bool,
    /// Least time between the starts of two requests on the same session.
    #[serde(with = "delay_seconds")]
    pub min_request_interval: Duration,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            request_method: Method::GET,
            check_status_code: false,
            max_attempt_count: DEFAULT_MAX_ATTEMPT_COUNT,
            request_delay: Duration::ZERO,
            update_referer: None,
            persist_session: true,
            min_request_interval: Duration::ZERO,
        }
    }
}

impl RequestConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default request method.
    pub fn method(mut self, method: Method) -> Self {
        self.request_method = method;
        self
    }

    /// Set whether non-2xx responses count as failures.
    pub fn check_status_code(mut self, check: bool) -> Self {
        self.check_status_code = check;
        self
    }

    /// Set the total number of attempts.
    pub fn max_attempt_count(mut self, count: u32) -> Self {
        self.max_attempt_count = count;
        self
    }

    /// Set the pause between attempts.
    pub fn request_delay(mut self, delay: Duration) -> Self {
        self.request_delay = delay;
        self
    }

    /// Send this `Referer` with every request.
    pub fn update_referer(mut self, referer: impl Into<String>) -> Self {
        self.update_referer = Some(referer.into());
        self
    }

    /// Set whether mixins from one factory share a session.
    pub fn persist_session(mut self, persist: bool) -> Self {
        self.persist_session = persist;
        self
    }

    /// Space out requests made through the session by at least `interval`.
    pub fn min_request_interval(mut self, interval: Duration) -> Self {
        self.min_request_interval = interval;
        self
    }

    /// Rejects values that could never produce a request.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempt_count == 0 {
            return Err(RequestError::InvalidConfig(
                "max_attempt_count must be at least 1, not 0".to_string(),
            )
            .into());
        }

        if !SUPPORTED_METHODS.contains(&self.request_method) {
            return Err(RequestError::InvalidConfig(format!(
                "unknown request method {}",
                self.request_method
            ))
            .into());
        }

        if let Some(referer) = &self.update_referer {
            HeaderValue::from_str(referer).map_err(|_| {
                RequestError::InvalidConfig(format!("invalid referer value {:?}", referer))
            })?;
        }

        Ok(())
    }
}

/// Parses a method name case-insensitively, accepting only the standard verbs.
pub fn parse_method(name: &str) -> Result<Method, RequestError> {
    let upper = name.trim().to_ascii_uppercase();
    SUPPORTED_METHODS
        .iter()
        .find(|method| method.as_str() == upper)
        .cloned()
        .ok_or_else(|| RequestError::InvalidConfig(format!("unknown request method {}", name)))
}

mod method_name {
    use reqwest::Method;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(method: &Method, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(method.as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Method, D::Error> {
        let name = String::deserialize(deserializer)?;
        super::parse_method(&name).map_err(serde::de::Error::custom)
    }
}

mod delay_seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(delay: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(delay.as_secs_f64())
    }

    // Negative delays mean "no delay".
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let seconds = f64::deserialize(deserializer)?;
        if !seconds.is_finite() {
            return Err(serde::de::Error::custom(format!(
                "delays must be a finite number of seconds, not {}",
                seconds
            )));
        }
        Ok(Duration::from_secs_f64(seconds.max(0.0)))
    }
}
