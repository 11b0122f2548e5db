use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use tokenkeeper_clock::{Clock, UnixTime};

use crate::{
    exchange::{ExchangeError, SignInRequest, SignedIn, TokenExchange},
    AccessToken, BackendIdentity, InMemorySessionStore, RefreshToken, RefreshTokenRef, Role,
    SessionPatch, TokenPair,
};

/// An unsigned JWT whose `exp` claim is `expiry`
pub(crate) fn jwt_expiring_at(expiry: UnixTime) -> String {
    jwt_with_claims(serde_json::json!({ "exp": expiry.as_millis() as f64 / 1000. }))
}

pub(crate) fn jwt_with_claims(claims: serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.c2lnbmF0dXJl")
}

pub(crate) fn identity() -> BackendIdentity {
    BackendIdentity {
        id: 42,
        email: "ada@example.com".into(),
        display_name: "Ada Lovelace".into(),
        avatar_url: None,
        role: Role::Tutor,
    }
}

pub(crate) fn signed_in_store(expiry: UnixTime) -> InMemorySessionStore {
    let store = InMemorySessionStore::default();
    store.apply(SessionPatch::SignedIn {
        tokens: TokenPair::new(
            AccessToken::new(jwt_with_claims(
                serde_json::json!({ "exp": expiry.as_millis() / 1000, "jti": "initial" }),
            )),
            RefreshToken::from_static("refresh-initial"),
            expiry,
        ),
        identity: identity(),
    });
    store
}

/// A clock that follows tokio's (possibly paused) timer
#[derive(Clone, Debug)]
pub(crate) struct PausedClock {
    origin: UnixTime,
    start: tokio::time::Instant,
}

impl PausedClock {
    pub(crate) fn new(origin: UnixTime) -> Self {
        Self {
            origin,
            start: tokio::time::Instant::now(),
        }
    }
}

impl Clock for PausedClock {
    fn now(&self) -> UnixTime {
        self.origin + self.start.elapsed()
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum Reply {
    Renew,
    RenewWithoutRotation,
    Reject,
    Transient,
}

/// A scripted backend
///
/// Refreshes answer with the scripted replies in order, then with
/// [`Reply::Renew`] once the script runs out.
#[derive(Debug)]
pub(crate) struct StubExchange<C> {
    clock: C,
    lifetime: Duration,
    latency: Mutex<Duration>,
    replies: Mutex<VecDeque<Reply>>,
    reject_sign_in: Mutex<bool>,
    issued: AtomicUsize,
    pub(crate) refreshes: AtomicUsize,
    pub(crate) revoked: Mutex<Vec<RefreshToken>>,
}

impl<C: Clock> StubExchange<C> {
    pub(crate) fn new(clock: C, lifetime: Duration) -> Self {
        Self {
            clock,
            lifetime,
            latency: Mutex::new(Duration::ZERO),
            replies: Mutex::new(VecDeque::new()),
            reject_sign_in: Mutex::new(false),
            issued: AtomicUsize::new(0),
            refreshes: AtomicUsize::new(0),
            revoked: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn script(&self, replies: impl IntoIterator<Item = Reply>) {
        self.replies.lock().unwrap().extend(replies);
    }

    pub(crate) fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    pub(crate) fn reject_sign_in(&self) {
        *self.reject_sign_in.lock().unwrap() = true;
    }

    pub(crate) fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::Acquire)
    }

    fn issue(&self, refresh_token: Option<&RefreshTokenRef>) -> TokenPair {
        let n = self.issued.fetch_add(1, Ordering::AcqRel);
        let expiry = self.clock.now() + self.lifetime;
        let access_token = AccessToken::new(jwt_with_claims(
            serde_json::json!({ "exp": expiry.as_millis() / 1000, "jti": n }),
        ));
        let refresh_token = refresh_token
            .map(RefreshTokenRef::to_owned)
            .unwrap_or_else(|| RefreshToken::new(format!("refresh-{n}")));
        TokenPair::new(access_token, refresh_token, expiry)
    }

    async fn wait(&self) {
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

pub(crate) fn rejected() -> ExchangeError {
    ExchangeError::TokenBodyError(serde_json::from_str::<()>("rejected").unwrap_err())
}

pub(crate) fn transient() -> ExchangeError {
    let err = reqwest::Client::new()
        .post("not a url")
        .build()
        .unwrap_err();
    ExchangeError::RequestSend(err)
}

#[async_trait]
impl<C: Clock + Send + Sync> TokenExchange for StubExchange<C> {
    async fn exchange_identity(&self, _request: &SignInRequest) -> Result<SignedIn, ExchangeError> {
        self.wait().await;
        if *self.reject_sign_in.lock().unwrap() {
            return Err(rejected());
        }
        Ok(SignedIn {
            tokens: self.issue(None),
            identity: identity(),
        })
    }

    async fn refresh(&self, refresh_token: &RefreshTokenRef) -> Result<TokenPair, ExchangeError> {
        self.refreshes.fetch_add(1, Ordering::AcqRel);
        self.wait().await;
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Reply::Renew);
        match reply {
            Reply::Renew => Ok(self.issue(None)),
            Reply::RenewWithoutRotation => Ok(self.issue(Some(refresh_token))),
            Reply::Reject => Err(rejected()),
            Reply::Transient => Err(transient()),
        }
    }

    async fn revoke(&self, refresh_token: &RefreshTokenRef) -> Result<(), ExchangeError> {
        self.revoked.lock().unwrap().push(refresh_token.to_owned());
        Ok(())
    }
}
