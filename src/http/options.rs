//! Per-call overrides forwarded to a single request.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, RequestBuilder};
use serde::Serialize;

/// Options for one `make_request` call.
///
/// `method`, `check_status_code` and `update_referer` override the mixin's
/// configuration for this call only. The rest is applied to the request as
/// is. Options are borrowed on every attempt, so retries send the same request.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub method: Option<Method>,
    pub check_status_code: Option<bool>,
    pub update_referer: Option<String>,
    pub headers: HeaderMap,
    pub query: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub json: Option<serde_json::Value>,
    pub form: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn check_status_code(mut self, check: bool) -> Self {
        self.check_status_code = Some(check);
        self
    }

    pub fn update_referer(mut self, referer: impl Into<String>) -> Self {
        self.update_referer = Some(referer.into());
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Serialize `value` as the JSON request body.
    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self> {
        let value = serde_json::to_value(value).context("Failed to serialize JSON body")?;
        self.json = Some(value);
        Ok(self)
    }

    pub fn form(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.form.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Applies headers, query, body and timeout to `builder`.
    ///
    /// A JSON body wins over a form body, which wins over a raw body.
    pub(crate) fn apply(&self, mut builder: RequestBuilder) -> RequestBuilder {
        if !self.headers.is_empty() {
            builder = builder.headers(self.headers.clone());
        }

        if !self.query.is_empty() {
            builder = builder.query(&self.query);
        }

        if let Some(json) = &self.json {
            builder = builder.json(json);
        } else if !self.form.is_empty() {
            builder = builder.form(&self.form);
        } else if let Some(body) = &self.body {
            builder = builder.body(body.clone());
        }

        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }

        builder
    }
}
