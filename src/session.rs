//! Cookie- and header-persisting HTTP session shared between mixins.
//!
//! A [`Session`] wraps a `reqwest::Client` wired to its own cookie jar, plus a
//! set of default headers sent with every request. A [`SessionProvider`]
//! lazily builds one session and hands out the same `Arc` afterwards; the
//! process-wide provider behind [`get_session`] is what the default
//! [`RequestMixin`](crate::RequestMixin) uses.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::debug;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Url};

use crate::http::Sleeper;

/// User agent sent by every session.
pub const USER_AGENT: &str = concat!("request-mixin/", env!("CARGO_PKG_VERSION"));

static GLOBAL_SESSIONS: SessionProvider = SessionProvider::new();

/// Cookies and default headers persisted across requests.
pub struct Session {
    client: Client,
    cookies: Arc<Jar>,
    headers: RwLock<HeaderMap>,
    last_request: tokio::sync::Mutex<Option<Instant>>,
}

impl Session {
    /// Creates a session with an empty cookie jar and no default headers.
    pub fn new() -> Result<Self> {
        let cookies = Arc::new(Jar::default());
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .cookie_provider(Arc::clone(&cookies))
            .build()
            .context("Failed to build HTTP client")?;

        debug!("Created new HTTP session");

        Ok(Self {
            client,
            cookies,
            headers: RwLock::new(HeaderMap::new()),
            last_request: tokio::sync::Mutex::new(None),
        })
    }

    /// Returns a reference to the underlying reqwest Client.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Snapshot of the default headers.
    pub fn headers(&self) -> HeaderMap {
        self.headers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn header(&self, name: &HeaderName) -> Option<HeaderValue> {
        self.headers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Sets a default header, returning the previous value.
    pub fn set_header(&self, name: HeaderName, value: HeaderValue) -> Option<HeaderValue> {
        self.headers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, value)
    }

    pub fn remove_header(&self, name: &HeaderName) -> Option<HeaderValue> {
        self.headers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    /// Stores a `Set-Cookie` style string as if `url` had sent it.
    pub fn add_cookie(&self, url: &Url, cookie: &str) {
        self.cookies.add_cookie_str(cookie, url);
    }

    /// The `Cookie` header this session would send to `url`.
    pub fn cookie_header(&self, url: &Url) -> Option<String> {
        self.cookies
            .cookies(url)
            .and_then(|value| value.to_str().ok().map(str::to_owned))
    }

    /// Waits until `interval` has passed since the previous request on this
    /// session started, then marks a new request as started.
    ///
    /// Callers queue on the lock, so concurrent requests are spaced out too.
    pub async fn wait_for_turn(&self, interval: Duration, sleeper: &dyn Sleeper) {
        let mut last_request = self.last_request.lock().await;

        if let Some(previous) = *last_request {
            let elapsed = previous.elapsed();
            if elapsed < interval {
                let remaining = interval - elapsed;
                debug!("Waiting {:?} before the next request", remaining);
                sleeper.sleep(remaining).await;
            }
        }

        *last_request = Some(Instant::now());
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("headers", &self.headers())
            .finish_non_exhaustive()
    }
}

/// Lazily builds one [`Session`] and returns it on every call.
///
/// Construction happens under a lock, so concurrent first calls still end up
/// with a single session.
#[derive(Debug)]
pub struct SessionProvider {
    session: Mutex<Option<Arc<Session>>>,
}

impl Default for SessionProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionProvider {
    pub const fn new() -> Self {
        Self {
            session: Mutex::new(None),
        }
    }

    /// A provider that hands out `session` instead of building its own.
    pub fn with_session(session: Arc<Session>) -> Self {
        Self {
            session: Mutex::new(Some(session)),
        }
    }

    /// Returns the cached session, building it on first use.
    pub fn get_session(&self) -> Result<Arc<Session>> {
        let mut slot = self.session.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(session) = slot.as_ref() {
            return Ok(Arc::clone(session));
        }

        let session = Arc::new(Session::new()?);
        *slot = Some(Arc::clone(&session));
        Ok(session)
    }

    pub fn is_initialized(&self) -> bool {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

/// The process-wide session used by [`RequestMixin::new`](crate::RequestMixin::new).
pub fn get_session() -> Result<Arc<Session>> {
    GLOBAL_SESSIONS.get_session()
}
