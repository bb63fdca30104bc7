//! Shared-session HTTP requests with fixed-delay retries for any host type.
//!
//! - `config` - Per-factory request defaults ([`RequestConfig`])
//! - `http` - Per-call options, the retry loop and its errors
//! - `session` - Cookie/header persisting sessions and their providers
//! - `mixin` - [`RequestMixin`], its factory and the [`HasRequestMixin`] trait

pub mod config;
pub mod http;
pub mod mixin;
pub mod session;

pub use config::RequestConfig;
pub use http::{AttemptsExhausted, RequestError, RequestOptions, Sleeper, TokioSleeper};
pub use mixin::{HasRequestMixin, RequestMixin, RequestMixinFactory, create_request_mixin};
pub use session::{Session, SessionProvider, get_session};
