//! Middleware to automatically attach the session's access token to outgoing requests
//!
//! When using [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware),
//! include the [`AccessTokenMiddleware`] in the middleware stack to use
//! the session's current access token for each outbound request. The token is
//! read from the session store on every call, so a refresh is picked up by the
//! very next request.
//!
//! If a request already has specified an `Authorization` header value by
//! the time that the middleware executes, the existing value will be left
//! in place, allowing overrides to be specified as required.
//!
//! ```
//! use std::sync::Arc;
//!
//! use reqwest::Client;
//! use reqwest_middleware::ClientBuilder;
//! use tokenkeeper::InMemorySessionStore;
//! use tokenkeeper_reqwest::AccessTokenMiddleware;
//!
//! let store = Arc::new(InMemorySessionStore::default());
//!
//! let client = ClientBuilder::new(Client::default())
//!     .with(AccessTokenMiddleware::new(store))
//!     .build();
//!
//! let req = client.get("https://example.com");
//! # let _ = async move { req
//!     .send()
//!     .await
//! # };
//! ```
//!
//! Given a [`TokenRefresher`], such as the one handed out by
//! [`SessionKeeper::refresher()`](tokenkeeper::SessionKeeper::refresher()),
//! the middleware also recovers from the backend rejecting the access token.
//! On a `401 Unauthorized` response it asks the refresher for a new token and
//! retries the request exactly once. If the retry is rejected too, or no new
//! token can be had, the unauthorized response is returned to the caller.
//! Requests whose bodies cannot be replayed are never retried.
//!
//! The middleware can also be configured to add an authorization token
//! only conditionally. This can be useful in the event that you want to
//! use a single common middleware stack with multiple potential backends
//! and want to ensure that the session's token is only sent to its backend.
//!
//! These predicates can be composed together to evaluate more complex
//! requirements prior to attaching a token to a request.
//!
//! ```
//! use std::sync::Arc;
//!
//! use predicates::prelude::PredicateBooleanExt;
//! use tokenkeeper::InMemorySessionStore;
//! use tokenkeeper_reqwest::{AccessTokenMiddleware, ExactHostMatch, HttpsOnly};
//!
//! let store = Arc::new(InMemorySessionStore::default());
//!
//! AccessTokenMiddleware::new(store)
//!     .with_predicate(HttpsOnly.and(ExactHostMatch::new("api.example.com")));
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::{fmt, sync::Arc};

use bytes::{BufMut, BytesMut};
use predicates::{prelude::*, reflection};
use reqwest::{header, Request, Response, StatusCode};
use reqwest_middleware::{Middleware, Next, Result};
use tokenkeeper::{
    refresh::{RefreshTrigger, TokenRefresher},
    AccessToken, AccessTokenRef, SessionStore,
};
use tokenkeeper_clock::{Clock, System};

/// A middleware that injects the session's access token into outgoing
/// requests and retries once on rejection
#[derive(Clone)]
pub struct AccessTokenMiddleware<P = HttpsOnly> {
    session: Arc<dyn SessionStore>,
    refresher: Option<Arc<dyn TokenRefresher>>,
    predicate: P,
}

impl<P: fmt::Debug> fmt::Debug for AccessTokenMiddleware<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessTokenMiddleware")
            .field("session", &self.session.read())
            .field("refresher", &self.refresher.is_some())
            .field("predicate", &self.predicate)
            .finish()
    }
}

impl AccessTokenMiddleware<HttpsOnly> {
    /// Construct a new middleware from a session store
    ///
    /// By default, this middleware will only send its token if the request
    /// is being sent via HTTPS. To change this behavior, provide a
    /// custom predicate with [`with_predicate()`][Self::with_predicate()].
    pub fn new(session: Arc<dyn SessionStore>) -> Self {
        Self {
            session,
            refresher: None,
            predicate: HttpsOnly,
        }
    }
}

impl<P> AccessTokenMiddleware<P> {
    /// Registers the refresher to use when the backend rejects a token
    pub fn with_refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    /// Replaces the predicate with a custom predicate
    pub fn with_predicate<Q>(self, predicate: Q) -> AccessTokenMiddleware<Q> {
        AccessTokenMiddleware {
            session: self.session,
            refresher: self.refresher,
            predicate,
        }
    }

    fn current_token(&self) -> Option<AccessToken> {
        let record = self.session.read();
        let token = record.usable_access_token()?;

        if tracing::enabled!(tracing::Level::TRACE) {
            if let Some(tokens) = &record.tokens {
                let now = System.now();
                tracing::trace!(
                    token.expiry = tokens.effective_expiry().as_millis(),
                    token.until_expired_ms = tokens.until_expired_at(now).as_millis() as u64,
                    "obtained access token"
                );
            }
        }

        Some(token.to_owned())
    }
}

fn attach(req: &mut Request, token: &AccessTokenRef) {
    let mut header_value = BytesMut::with_capacity(token.as_str().len() + 7);
    header_value.put_slice(b"Bearer ");
    header_value.put_slice(token.as_str().as_bytes());

    match header::HeaderValue::from_maybe_shared(header_value) {
        Ok(mut value) => {
            value.set_sensitive(true);
            req.headers_mut().insert(header::AUTHORIZATION, value);
        }
        Err(_) => tracing::warn!("access token is not a valid header value, sending without it"),
    }
}

#[async_trait::async_trait]
impl<P> Middleware for AccessTokenMiddleware<P>
where
    P: Predicate<Request> + Send + Sync + 'static,
{
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        if !self.predicate.eval(&req) || req.headers().contains_key(header::AUTHORIZATION) {
            return next.run(req, extensions).await;
        }

        let sent = match self.current_token() {
            Some(token) => token,
            None => {
                tracing::trace!("no usable session, sending without authorization");
                return next.run(req, extensions).await;
            }
        };
        attach(&mut req, &sent);

        let refresher = match &self.refresher {
            Some(refresher) => refresher,
            None => return next.run(req, extensions).await,
        };

        let retry = req.try_clone();
        let resp = next.clone().run(req, extensions).await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        let mut retry = match retry {
            Some(retry) => retry,
            None => {
                tracing::debug!("request rejected as unauthorized, but cannot be replayed");
                return Ok(resp);
            }
        };

        tracing::debug!("request rejected as unauthorized, refreshing token");
        let outcome = refresher
            .refresh(RefreshTrigger::Unauthorized, Some(&*sent))
            .await;

        match outcome.access_token() {
            Some(token) => {
                tracing::debug!("retrying request with renewed token");
                attach(&mut retry, token);
                next.run(retry, extensions).await
            }
            None => {
                tracing::debug!(?outcome, "no renewed token, returning unauthorized response");
                Ok(resp)
            }
        }
    }
}

/// Only attach an access token if the request is being sent over HTTPS
#[derive(Clone, Copy, Debug)]
pub struct HttpsOnly;

impl Predicate<Request> for HttpsOnly {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().scheme() == "https"
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "scheme",
                    req.url().scheme().to_owned(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for HttpsOnly {}
impl fmt::Display for HttpsOnly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("scheme is https")
    }
}

/// Only attach an access token if the request is being sent to the exact host specified
#[derive(Clone, Debug)]
pub struct ExactHostMatch {
    host: String,
}

impl ExactHostMatch {
    /// Construct a new predicate from a host string
    pub fn new<S>(host: S) -> Self
    where
        S: ToString,
    {
        Self {
            host: host.to_string(),
        }
    }
}

impl Predicate<Request> for ExactHostMatch {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().host_str() == Some(&self.host)
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let result = self.eval(req);
        if result != expected {
            Some(
                reflection::Case::new(Some(self), result).add_product(reflection::Product::new(
                    "host",
                    req.url()
                        .host_str()
                        .unwrap_or("<value not valid utf-8>")
                        .to_owned(),
                )),
            )
        } else {
            None
        }
    }
}

impl reflection::PredicateReflection for ExactHostMatch {}
impl fmt::Display for ExactHostMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("host == ")?;
        f.write_str(&self.host)
    }
}
