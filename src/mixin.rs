//! Request capability that host types embed instead of inheriting.
//!
//! [`RequestMixin::new`] gives a mixin bound to the process-wide session and
//! the default [`RequestConfig`]. [`create_request_mixin`] returns a
//! [`RequestMixinFactory`] with its own configuration and its own session;
//! every mixin it builds shares that session (unless `persist_session` is
//! off), and no state leaks between factories.
//!
//! ```no_run
//! use std::time::Duration;
//! use request_mixin::{HasRequestMixin, RequestConfig, RequestMixin, RequestOptions, create_request_mixin};
//! use reqwest::Method;
//!
//! struct Scraper {
//!     requests: RequestMixin,
//! }
//!
//! impl HasRequestMixin for Scraper {
//!     fn request_mixin(&self) -> &RequestMixin {
//!         &self.requests
//!     }
//! }
//!
//! # async fn run() -> anyhow::Result<()> {
//! let factory = create_request_mixin(
//!     RequestConfig::new()
//!         .method(Method::POST)
//!         .check_status_code(true)
//!         .max_attempt_count(10)
//!         .request_delay(Duration::from_secs(3)),
//! )?;
//!
//! let scraper = Scraper { requests: factory.build()? };
//! let page = scraper.make_text_request("https://example.com", &RequestOptions::new()).await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::debug;
use reqwest::header::{HeaderValue, REFERER};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;

use crate::config::RequestConfig;
use crate::http::{RequestError, RequestOptions, RetryPolicy, Sleeper, TokioSleeper, with_retry};
use crate::session::{Session, SessionProvider, get_session};

/// Builds [`RequestMixin`]s that share one configuration and one session.
#[derive(Clone)]
pub struct RequestMixinFactory {
    config: RequestConfig,
    sessions: Arc<SessionProvider>,
    sleeper: Arc<dyn Sleeper>,
}

impl RequestMixinFactory {
    /// Creates a factory handing out sessions from `sessions`.
    pub fn new(config: RequestConfig, sessions: Arc<SessionProvider>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            sessions,
            sleeper: Arc::new(TokioSleeper),
        })
    }

    /// Replace how mixins from this factory wait between attempts.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn config(&self) -> &RequestConfig {
        &self.config
    }

    /// The session shared by mixins from this factory.
    pub fn session(&self) -> Result<Arc<Session>> {
        self.sessions.get_session()
    }

    /// Builds a mixin carrying a copy of this factory's configuration.
    pub fn build(&self) -> Result<RequestMixin> {
        let session = if self.config.persist_session {
            self.sessions.get_session()?
        } else {
            Arc::new(Session::new()?)
        };

        Ok(RequestMixin {
            session,
            config: self.config.clone(),
            sleeper: Arc::clone(&self.sleeper),
        })
    }
}

impl std::fmt::Debug for RequestMixinFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestMixinFactory")
            .field("config", &self.config)
            .field("sessions", &self.sessions)
            .finish_non_exhaustive()
    }
}

/// Creates a factory with its own session and the given defaults.
pub fn create_request_mixin(config: RequestConfig) -> Result<RequestMixinFactory> {
    RequestMixinFactory::new(config, Arc::new(SessionProvider::new()))
}

/// Shared session plus retrying request methods.
#[derive(Clone)]
pub struct RequestMixin {
    session: Arc<Session>,
    config: RequestConfig,
    sleeper: Arc<dyn Sleeper>,
}

impl RequestMixin {
    /// A mixin on the process-wide session with the default configuration.
    pub fn new() -> Result<Self> {
        Self::with_session(get_session()?, RequestConfig::default())
    }

    /// A mixin on an explicitly owned session.
    pub fn with_session(session: Arc<Session>, config: RequestConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            session,
            config,
            sleeper: Arc::new(TokioSleeper),
        })
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn config(&self) -> &RequestConfig {
        &self.config
    }

    /// Overrides the attempt count for this mixin only.
    pub fn set_max_attempt_count(&mut self, count: u32) -> Result<()> {
        if count == 0 {
            return Err(RequestError::InvalidConfig(
                "max_attempt_count must be at least 1, not 0".to_string(),
            )
            .into());
        }
        self.config.max_attempt_count = count;
        Ok(())
    }

    /// Overrides the delay between attempts for this mixin only.
    pub fn set_request_delay(&mut self, delay: Duration) {
        self.config.request_delay = delay;
    }

    /// Sends a request through the shared session, retrying on failure.
    ///
    /// Transport errors always count as failures; non-2xx responses do when
    /// status checking is on. Once `max_attempt_count` attempts have failed
    /// the last error is returned with an
    /// [`AttemptsExhausted`](crate::AttemptsExhausted) context.
    #[tracing::instrument(skip(self, options))]
    pub async fn make_request(&self, url: &str, options: &RequestOptions) -> Result<Response> {
        let policy = RetryPolicy::new(self.config.max_attempt_count, self.config.request_delay);
        let operation = format!("{} {}", self.method_for(options), url);

        with_retry(&policy, self.sleeper.as_ref(), &operation, move || {
            self.attempt(url, options)
        })
        .await
    }

    /// Sends a request and deserializes the JSON response.
    #[tracing::instrument(skip(self, options))]
    pub async fn make_json_request<T: DeserializeOwned>(
        &self,
        url: &str,
        options: &RequestOptions,
    ) -> Result<T> {
        let response = self.make_request(url, options).await?;
        response
            .json::<T>()
            .await
            .context("Failed to parse JSON response")
    }

    /// Sends a request and returns the response body as text.
    #[tracing::instrument(skip(self, options))]
    pub async fn make_text_request(&self, url: &str, options: &RequestOptions) -> Result<String> {
        let response = self.make_request(url, options).await?;
        response
            .text()
            .await
            .context("Failed to read response body")
    }

    fn method_for(&self, options: &RequestOptions) -> Method {
        options
            .method
            .clone()
            .unwrap_or_else(|| self.config.request_method.clone())
    }

    /// Builds the request for one attempt: session headers, referer, then options.
    fn prepare(&self, method: Method, url: &str, options: &RequestOptions) -> Result<RequestBuilder> {
        let mut headers = self.session.headers();

        // Replaces the session's referer in this request's copy only, so the
        // shared headers never change underneath concurrent callers.
        let referer = options
            .update_referer
            .as_deref()
            .or(self.config.update_referer.as_deref());
        if let Some(referer) = referer {
            let value = HeaderValue::from_str(referer).map_err(|_| {
                RequestError::InvalidConfig(format!("invalid referer value {:?}", referer))
            })?;
            headers.insert(REFERER, value);
        }

        let builder = self.session.client().request(method, url).headers(headers);
        Ok(options.apply(builder))
    }

    /// Single attempt without retry.
    async fn attempt(&self, url: &str, options: &RequestOptions) -> Result<Response> {
        let method = self.method_for(options);
        let check_status_code = options
            .check_status_code
            .unwrap_or(self.config.check_status_code);

        let builder = self.prepare(method.clone(), url, options)?;

        if !self.config.min_request_interval.is_zero() {
            self.session
                .wait_for_turn(self.config.min_request_interval, self.sleeper.as_ref())
                .await;
        }

        debug!("Making {} request to {}...", method, url);
        let response = builder.send().await.map_err(RequestError::Transport)?;
        debug!("Response received with status {}", response.status());

        if check_status_code && !response.status().is_success() {
            return Err(RequestError::Status {
                status: response.status(),
                url: response.url().clone(),
            }
            .into());
        }

        Ok(response)
    }
}

impl std::fmt::Debug for RequestMixin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestMixin")
            .field("session", &self.session)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Gives a host type the request methods of the mixin it embeds.
#[async_trait]
pub trait HasRequestMixin: Sync {
    fn request_mixin(&self) -> &RequestMixin;

    async fn make_request(&self, url: &str, options: &RequestOptions) -> Result<Response> {
        self.request_mixin().make_request(url, options).await
    }

    async fn make_json_request<T: DeserializeOwned + Send>(
        &self,
        url: &str,
        options: &RequestOptions,
    ) -> Result<T> {
        self.request_mixin().make_json_request(url, options).await
    }

    async fn make_text_request(&self, url: &str, options: &RequestOptions) -> Result<String> {
        self.request_mixin().make_text_request(url, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{AttemptsExhausted, MockSleeper};
    use crate::test_utils::{no_delay_config, url_for};
    use mockall::predicate::eq;
    use mockito::Matcher;
    use reqwest::StatusCode;

    #[tokio::test]
    async fn test_make_request_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/test")
            .with_status(200)
            .with_body("hello")
            .create_async()
            .await;

        let mixin = create_request_mixin(no_delay_config(3)).unwrap().build().unwrap();
        let response = mixin
            .make_request(&url_for(&server, "/test"), &RequestOptions::new())
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_server_error_without_status_check_is_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/flaky")
            .with_status(500)
            .expect(1)
            .create_async()
            .await;

        let mixin = create_request_mixin(no_delay_config(3)).unwrap().build().unwrap();
        let response = mixin
            .make_request(&url_for(&server, "/flaky"), &RequestOptions::new())
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_server_error_with_status_check_retries_then_fails() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/flaky")
            .with_status(500)
            .expect(3)
            .create_async()
            .await;

        let config = no_delay_config(3).check_status_code(true);
        let mixin = create_request_mixin(config).unwrap().build().unwrap();
        let err = mixin
            .make_request(&url_for(&server, "/flaky"), &RequestOptions::new())
            .await
            .unwrap_err();

        mock.assert_async().await;
        assert_eq!(err.downcast_ref::<AttemptsExhausted>().unwrap().attempts, 3);
        let last = err.downcast_ref::<RequestError>().unwrap();
        assert_eq!(last.status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
    }

    #[tokio::test]
    async fn test_per_call_status_check_override() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/missing")
            .with_status(404)
            .expect(2)
            .create_async()
            .await;

        let mixin = create_request_mixin(no_delay_config(2)).unwrap().build().unwrap();
        let result = mixin
            .make_request(
                &url_for(&server, "/missing"),
                &RequestOptions::new().check_status_code(true),
            )
            .await;

        mock.assert_async().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_configured_method_and_per_call_override() {
        let mut server = mockito::Server::new_async().await;
        let post = server
            .mock("POST", "/items")
            .with_status(201)
            .create_async()
            .await;
        let delete = server
            .mock("DELETE", "/items")
            .with_status(204)
            .create_async()
            .await;

        let config = no_delay_config(1).method(Method::POST);
        let mixin = create_request_mixin(config).unwrap().build().unwrap();
        let url = url_for(&server, "/items");

        let created = mixin.make_request(&url, &RequestOptions::new()).await.unwrap();
        let deleted = mixin
            .make_request(&url, &RequestOptions::new().method(Method::DELETE))
            .await
            .unwrap();

        post.assert_async().await;
        delete.assert_async().await;
        assert_eq!(created.status(), StatusCode::CREATED);
        assert_eq!(deleted.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_invalid_url_is_not_retried() {
        let mut sleeper = MockSleeper::new();
        sleeper.expect_sleep().never();

        let config = RequestConfig::new()
            .max_attempt_count(5)
            .request_delay(Duration::from_secs(10));
        let mixin = create_request_mixin(config)
            .unwrap()
            .with_sleeper(Arc::new(sleeper))
            .build()
            .unwrap();

        let err = mixin
            .make_request("not a url", &RequestOptions::new())
            .await
            .unwrap_err();

        assert!(err.downcast_ref::<AttemptsExhausted>().is_none());
        assert!(matches!(
            err.downcast_ref::<RequestError>(),
            Some(RequestError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_request_delay_is_passed_to_sleeper() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/down")
            .with_status(503)
            .expect(4)
            .create_async()
            .await;

        let delay = Duration::from_secs(3);
        let mut sleeper = MockSleeper::new();
        sleeper
            .expect_sleep()
            .with(eq(delay))
            .times(3)
            .returning(|_| ());

        let config = RequestConfig::new()
            .check_status_code(true)
            .max_attempt_count(4)
            .request_delay(delay);
        let mixin = create_request_mixin(config)
            .unwrap()
            .with_sleeper(Arc::new(sleeper))
            .build()
            .unwrap();

        let result = mixin
            .make_request(&url_for(&server, "/down"), &RequestOptions::new())
            .await;

        mock.assert_async().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_referer_from_config_and_override() {
        let mut server = mockito::Server::new_async().await;
        let default_referer = server
            .mock("GET", "/a")
            .match_header("referer", "https://home.example/")
            .create_async()
            .await;
        let override_referer = server
            .mock("GET", "/b")
            .match_header("referer", "https://other.example/")
            .create_async()
            .await;

        let config = no_delay_config(1).update_referer("https://home.example/");
        let mixin = create_request_mixin(config).unwrap().build().unwrap();

        mixin
            .make_request(&url_for(&server, "/a"), &RequestOptions::new())
            .await
            .unwrap();
        mixin
            .make_request(
                &url_for(&server, "/b"),
                &RequestOptions::new().update_referer("https://other.example/"),
            )
            .await
            .unwrap();

        default_referer.assert_async().await;
        override_referer.assert_async().await;
        assert_eq!(mixin.session().header(&REFERER), None);
    }

    #[test]
    fn test_referer_replaces_session_default() {
        let factory = create_request_mixin(no_delay_config(1)).unwrap();
        factory
            .session()
            .unwrap()
            .set_header(REFERER, HeaderValue::from_static("https://session.example/"));
        let mixin = factory.build().unwrap();

        let request = mixin
            .prepare(
                Method::GET,
                "http://127.0.0.1/",
                &RequestOptions::new().update_referer("https://override.example/"),
            )
            .unwrap()
            .build()
            .unwrap();

        let referers: Vec<_> = request.headers().get_all(REFERER).iter().collect();
        assert_eq!(referers, vec!["https://override.example/"]);
        assert_eq!(
            mixin.session().header(&REFERER).unwrap(),
            "https://session.example/"
        );
    }

    #[tokio::test]
    async fn test_config_referer_replaces_session_default_on_the_wire() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/")
            .match_header("referer", "https://config.example/")
            .create_async()
            .await;

        let factory =
            create_request_mixin(no_delay_config(1).update_referer("https://config.example/"))
                .unwrap();
        factory
            .session()
            .unwrap()
            .set_header(REFERER, HeaderValue::from_static("https://session.example/"));

        factory
            .build()
            .unwrap()
            .make_request(&url_for(&server, "/"), &RequestOptions::new())
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_invalid_per_call_referer_is_not_retried() {
        let mixin = create_request_mixin(no_delay_config(3)).unwrap().build().unwrap();
        let err = mixin
            .make_request(
                "http://127.0.0.1:1/",
                &RequestOptions::new().update_referer("bad\nvalue"),
            )
            .await
            .unwrap_err();

        assert!(err.downcast_ref::<AttemptsExhausted>().is_none());
        assert!(matches!(
            err.downcast_ref::<RequestError>(),
            Some(RequestError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_min_request_interval_spaces_successive_requests() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/page")
            .expect(2)
            .create_async()
            .await;

        let interval = Duration::from_secs(30);
        let mut sleeper = MockSleeper::new();
        sleeper
            .expect_sleep()
            .withf(move |d| *d > Duration::from_secs(20) && *d <= interval)
            .times(1)
            .returning(|_| ());

        let factory = create_request_mixin(no_delay_config(1).min_request_interval(interval))
            .unwrap()
            .with_sleeper(Arc::new(sleeper));
        let first = factory.build().unwrap();
        let second = factory.build().unwrap();
        let url = url_for(&server, "/page");

        first.make_request(&url, &RequestOptions::new()).await.unwrap();
        second.make_request(&url, &RequestOptions::new()).await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_session_default_headers_are_sent() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/")
            .match_header("x-api-key", "secret")
            .match_header("user-agent", Matcher::Regex("^request-mixin/".to_string()))
            .create_async()
            .await;

        let factory = create_request_mixin(no_delay_config(1)).unwrap();
        factory
            .session()
            .unwrap()
            .set_header("x-api-key".parse().unwrap(), HeaderValue::from_static("secret"));

        let mixin = factory.build().unwrap();
        mixin
            .make_request(&url_for(&server, "/"), &RequestOptions::new())
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_make_json_request() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/data?page=1")
            .with_header("content-type", "application/json")
            .with_body(r#"{"name": "test", "value": 42}"#)
            .create_async()
            .await;

        #[derive(serde::Deserialize, Debug, PartialEq)]
        struct Data {
            name: String,
            value: i32,
        }

        let mixin = create_request_mixin(no_delay_config(1)).unwrap().build().unwrap();
        let data: Data = mixin
            .make_json_request(
                &url_for(&server, "/data"),
                &RequestOptions::new().query("page", "1"),
            )
            .await
            .unwrap();

        assert_eq!(
            data,
            Data {
                name: "test".to_string(),
                value: 42
            }
        );
    }

    #[tokio::test]
    async fn test_make_json_request_invalid_body() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/data")
            .with_body("not json")
            .create_async()
            .await;

        let mixin = create_request_mixin(no_delay_config(1)).unwrap().build().unwrap();
        let result: Result<serde_json::Value> = mixin
            .make_json_request(&url_for(&server, "/data"), &RequestOptions::new())
            .await;

        assert!(result.unwrap_err().to_string().contains("parse JSON"));
    }

    #[test]
    fn test_factory_rejects_invalid_config() {
        let err = create_request_mixin(RequestConfig::new().max_attempt_count(0)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RequestError>(),
            Some(RequestError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_mixins_from_one_factory_share_session() {
        let factory = create_request_mixin(RequestConfig::default()).unwrap();
        let a = factory.build().unwrap();
        let b = factory.build().unwrap();
        assert!(Arc::ptr_eq(a.session(), b.session()));
        assert!(Arc::ptr_eq(a.session(), &factory.session().unwrap()));
    }

    #[test]
    fn test_unpersisted_sessions_are_per_mixin() {
        let factory = create_request_mixin(RequestConfig::new().persist_session(false)).unwrap();
        let a = factory.build().unwrap();
        let b = factory.build().unwrap();
        assert!(!Arc::ptr_eq(a.session(), b.session()));
    }

    #[test]
    fn test_factories_do_not_share_sessions_or_config() {
        let first = create_request_mixin(RequestConfig::new().max_attempt_count(2)).unwrap();
        let second = create_request_mixin(RequestConfig::new().max_attempt_count(7)).unwrap();

        let a = first.build().unwrap();
        let b = second.build().unwrap();

        assert!(!Arc::ptr_eq(a.session(), b.session()));
        assert_eq!(a.config().max_attempt_count, 2);
        assert_eq!(b.config().max_attempt_count, 7);
    }

    #[test]
    fn test_per_mixin_overrides_stay_local() {
        let factory = create_request_mixin(RequestConfig::default()).unwrap();
        let mut a = factory.build().unwrap();
        let b = factory.build().unwrap();

        a.set_max_attempt_count(9).unwrap();
        a.set_request_delay(Duration::from_secs(1));

        assert_eq!(a.config().max_attempt_count, 9);
        assert_eq!(a.config().request_delay, Duration::from_secs(1));
        assert_eq!(b.config(), factory.config());
        assert!(a.set_max_attempt_count(0).is_err());
    }

    #[test]
    fn test_default_mixins_share_global_session() {
        let a = RequestMixin::new().unwrap();
        let b = RequestMixin::new().unwrap();
        assert!(Arc::ptr_eq(a.session(), b.session()));
        assert_eq!(a.config(), &RequestConfig::default());
    }

    #[test]
    fn test_with_session_validates_config() {
        let session = Arc::new(Session::new().unwrap());
        let result = RequestMixin::with_session(session, RequestConfig::new().max_attempt_count(0));
        assert!(result.is_err());
    }
}
