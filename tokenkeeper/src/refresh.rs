//! Coordination of refresh attempts across every trigger that can start one
//!
//! A scheduled timer, a window-focus re-check and a rejected request may all
//! decide, within moments of each other, that the session needs new tokens.
//! Only one of them may reach the backend: the refresh token may rotate on
//! use, and a second concurrent exchange would then fail against a token that
//! has just been retired. The [`RefreshCoordinator`] owns the attempt state
//! that enforces this. Triggers that arrive while an attempt is running, or
//! during the cooldown that follows it, share that attempt's outcome.

use std::{
    error, fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use tokenkeeper_clock::{Clock, System, UnixTime};
use tokio::sync::watch;

use crate::{
    backoff::RetryPolicy,
    exchange::{ExchangeError, TokenExchange},
    AccessToken, AccessTokenRef, RefreshToken, RefreshTokenRef, SessionPatch, SessionStore,
    TokenPair, TokenStatus,
};

/// Configuration of when and how tokens are refreshed
#[derive(Clone, Debug)]
pub struct RefreshConfig {
    refresh_buffer: Duration,
    cooldown: Duration,
    retry: RetryPolicy,
}

impl Default for RefreshConfig {
    /// Default refresh configuration
    ///
    /// Refreshes two minutes ahead of expiry with a two second cooldown after
    /// each attempt. Transient failures are retried according to the default
    /// [`RetryPolicy`].
    fn default() -> Self {
        Self {
            refresh_buffer: Duration::from_secs(120),
            cooldown: Duration::from_secs(2),
            retry: RetryPolicy::default(),
        }
    }
}

impl RefreshConfig {
    /// Constructs a new refresh configuration
    ///
    /// Tokens are refreshed once they are within `refresh_buffer` of expiry.
    /// After an attempt completes, triggers arriving within `cooldown` share
    /// its outcome instead of starting another.
    pub fn new(refresh_buffer: Duration, cooldown: Duration) -> Self {
        Self {
            refresh_buffer,
            cooldown,
            ..Self::default()
        }
    }

    /// Sets how transient failures are retried before the refresh is
    /// considered to have failed
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The lead time ahead of expiry at which tokens are refreshed
    pub fn refresh_buffer(&self) -> Duration {
        self.refresh_buffer
    }

    /// The window after an attempt during which new triggers are absorbed
    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }
}

/// What prompted a refresh
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RefreshTrigger {
    /// The proactive timer elapsed
    Scheduled,
    /// The client re-checked the session, such as on window focus
    Revalidate,
    /// The backend rejected a request as unauthorized
    Unauthorized,
}

impl RefreshTrigger {
    /// A short name for the trigger, suitable for logging
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Revalidate => "revalidate",
            Self::Unauthorized => "unauthorized",
        }
    }
}

/// The result of asking for a refresh
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A usable access token is available
    Refreshed(AccessToken),
    /// The refresh was rejected and the session is now in error
    Failed,
    /// The session already carries an error marker
    Halted,
    /// There is no session to refresh
    SignedOut,
}

impl RefreshOutcome {
    /// The access token to use, if the refresh produced one
    pub fn access_token(&self) -> Option<&AccessTokenRef> {
        match self {
            Self::Refreshed(token) => Some(token),
            _ => None,
        }
    }
}

/// A capability to obtain renewed tokens on demand
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Requests a refresh
    ///
    /// `rejected` is the access token the backend refused, if any. If the
    /// session has already moved past that token, the current token is
    /// returned without contacting the backend.
    async fn refresh(
        &self,
        trigger: RefreshTrigger,
        rejected: Option<&AccessTokenRef>,
    ) -> RefreshOutcome;
}

#[derive(Debug, Default)]
struct RefreshAttemptState {
    in_flight: bool,
    generation: u64,
    last_attempted_refresh_token: Option<RefreshToken>,
    issued_refresh_token: Option<RefreshToken>,
    cooldown_until: Option<UnixTime>,
    completion: Option<watch::Receiver<Option<RefreshOutcome>>>,
}

impl RefreshAttemptState {
    /// Whether the attempt exchanged or produced `refresh_token`
    fn concerns(&self, refresh_token: &RefreshTokenRef) -> bool {
        self.last_attempted_refresh_token.as_deref() == Some(refresh_token)
            || self.issued_refresh_token.as_deref() == Some(refresh_token)
    }
}

struct Inner<C> {
    store: Arc<dyn SessionStore>,
    exchange: Arc<dyn TokenExchange>,
    config: RefreshConfig,
    clock: C,
    attempt: Mutex<RefreshAttemptState>,
}

/// Serializes refresh attempts for one session
///
/// Clones share the same attempt state.
pub struct RefreshCoordinator<C = System> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for RefreshCoordinator<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: fmt::Debug> fmt::Debug for RefreshCoordinator<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RefreshCoordinator")
            .field("config", &self.inner.config)
            .field("clock", &self.inner.clock)
            .field("attempt", &*self.lock_attempt())
            .finish()
    }
}

impl RefreshCoordinator<System> {
    /// Constructs a coordinator for the session held in `store`
    pub fn new(
        store: Arc<dyn SessionStore>,
        exchange: Arc<dyn TokenExchange>,
        config: RefreshConfig,
    ) -> Self {
        Self::with_clock(store, exchange, config, System)
    }
}

impl<C> RefreshCoordinator<C> {
    /// Constructs a coordinator using the given clock
    pub fn with_clock(
        store: Arc<dyn SessionStore>,
        exchange: Arc<dyn TokenExchange>,
        config: RefreshConfig,
        clock: C,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                exchange,
                config,
                clock,
                attempt: Mutex::new(RefreshAttemptState::default()),
            }),
        }
    }

    /// The store holding the session
    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.inner.store
    }

    /// The refresh configuration
    pub fn config(&self) -> &RefreshConfig {
        &self.inner.config
    }

    /// The clock used for timing decisions
    pub fn clock(&self) -> &C {
        &self.inner.clock
    }

    /// The end of the current cooldown, if an attempt recently completed
    pub fn cooldown_until(&self) -> Option<UnixTime> {
        let attempt = self.lock_attempt();
        attempt.cooldown_until.filter(|_| attempt.in_flight)
    }

    /// Whether an attempt is running or cooling down
    pub fn is_in_flight(&self) -> bool {
        self.lock_attempt().in_flight
    }

    fn lock_attempt(&self) -> MutexGuard<'_, RefreshAttemptState> {
        self.inner
            .attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C: Clock + Send + Sync + 'static> RefreshCoordinator<C> {
    /// Requests a refresh, sharing any attempt already under way
    pub async fn request_refresh(
        &self,
        trigger: RefreshTrigger,
        rejected: Option<&AccessTokenRef>,
    ) -> RefreshOutcome {
        let mut completion = match self.begin(trigger, rejected) {
            Ok(completion) => completion,
            Err(outcome) => return outcome,
        };

        let outcome = match completion.wait_for(Option::is_some).await {
            Ok(outcome) => Option::clone(&outcome),
            Err(_) => None,
        };

        outcome.unwrap_or_else(|| {
            tracing::error!(
                trigger = trigger.as_str(),
                "refresh attempt ended without reporting an outcome"
            );
            RefreshOutcome::Failed
        })
    }

    /// Refreshes if the session's token is within the refresh buffer of its
    /// expiry
    ///
    /// Returns `None` if no refresh was needed.
    pub async fn revalidate(&self) -> Option<RefreshOutcome> {
        let record = self.inner.store.read();
        let tokens = record.tokens.as_ref().filter(|_| record.error.is_none())?;

        let now = self.inner.clock.now();
        match tokens.token_status_at(now, self.inner.config.refresh_buffer) {
            TokenStatus::Fresh => {
                tracing::trace!(
                    until_expired_ms = tokens.until_expired_at(now).as_millis() as u64,
                    "token still fresh on revalidation"
                );
                None
            }
            status => {
                tracing::debug!(?status, "token needs renewal on revalidation");
                Some(self.request_refresh(RefreshTrigger::Revalidate, None).await)
            }
        }
    }

    fn begin(
        &self,
        trigger: RefreshTrigger,
        rejected: Option<&AccessTokenRef>,
    ) -> Result<watch::Receiver<Option<RefreshOutcome>>, RefreshOutcome> {
        let mut attempt = self.lock_attempt();
        let record = self.inner.store.read();

        if let Some(error) = record.error {
            tracing::debug!(
                trigger = trigger.as_str(),
                ?error,
                "session carries an error marker, not refreshing"
            );
            return Err(RefreshOutcome::Halted);
        }

        let tokens = match record.tokens.as_ref() {
            Some(tokens) => tokens,
            None => {
                tracing::debug!(trigger = trigger.as_str(), "no session to refresh");
                return Err(RefreshOutcome::SignedOut);
            }
        };

        if let Some(rejected) = rejected {
            if tokens.access_token() != rejected {
                tracing::debug!(
                    trigger = trigger.as_str(),
                    "rejected access token was already replaced"
                );
                return Err(RefreshOutcome::Refreshed(tokens.access_token().to_owned()));
            }
        }

        if attempt.in_flight {
            match attempt.completion.as_ref().filter(|rx| is_live(rx)) {
                Some(completion) if attempt.concerns(tokens.refresh_token()) => {
                    tracing::debug!(
                        trigger = trigger.as_str(),
                        "refresh already in flight, sharing its outcome"
                    );
                    return Ok(completion.clone());
                }
                Some(_) => tracing::debug!(
                    trigger = trigger.as_str(),
                    "previous refresh attempt belongs to an earlier session"
                ),
                None => tracing::warn!("previous refresh attempt was abandoned, starting over"),
            }
        }

        if attempt.last_attempted_refresh_token.as_deref() == Some(tokens.refresh_token()) {
            tracing::warn!(
                trigger = trigger.as_str(),
                "refresh token was already rejected, not retrying"
            );
            return Err(RefreshOutcome::Failed);
        }

        let refresh_token = tokens.refresh_token().to_owned();
        let generation = attempt.generation.wrapping_add(1);
        let (tx, rx) = watch::channel(None);
        *attempt = RefreshAttemptState {
            in_flight: true,
            generation,
            last_attempted_refresh_token: Some(refresh_token.clone()),
            issued_refresh_token: None,
            cooldown_until: None,
            completion: Some(rx.clone()),
        };

        tracing::debug!(trigger = trigger.as_str(), generation, "starting refresh");

        // The exchange runs detached so that a caller giving up on waiting
        // never cancels a refresh the backend may already have rotated.
        tokio::spawn(
            self.clone()
                .run_attempt(trigger, generation, refresh_token, tx),
        );

        Ok(rx)
    }

    #[tracing::instrument(skip_all, fields(trigger = trigger.as_str(), generation = generation))]
    async fn run_attempt(
        self,
        trigger: RefreshTrigger,
        generation: u64,
        refresh_token: RefreshToken,
        tx: watch::Sender<Option<RefreshOutcome>>,
    ) {
        let result = self.exchange_with_retries(&refresh_token).await;
        let issued = result
            .as_ref()
            .ok()
            .map(|tokens| tokens.refresh_token().to_owned());

        let outcome = match result {
            Ok(tokens) => {
                let record = self
                    .inner
                    .store
                    .update(SessionPatch::Refreshed {
                        from: refresh_token,
                        tokens,
                    })
                    .await;

                match record.usable_access_token() {
                    Some(access_token) => RefreshOutcome::Refreshed(access_token.to_owned()),
                    None => {
                        tracing::info!("session ended while refreshing, discarding tokens");
                        RefreshOutcome::SignedOut
                    }
                }
            }
            Err(error) => {
                tracing::error!(
                    error = (&error as &dyn error::Error),
                    "unable to refresh tokens, session can no longer be renewed"
                );
                self.inner
                    .store
                    .update(SessionPatch::RefreshFailed {
                        from: refresh_token,
                    })
                    .await;
                RefreshOutcome::Failed
            }
        };

        let cooldown = self.inner.config.cooldown;
        {
            let mut attempt = self.lock_attempt();
            if attempt.generation == generation {
                attempt.cooldown_until = Some(self.inner.clock.now() + cooldown);
                if issued.is_some() {
                    attempt.last_attempted_refresh_token = None;
                    attempt.issued_refresh_token = issued;
                }
            }
        }

        tx.send_replace(Some(outcome));

        tokio::time::sleep(cooldown).await;

        let mut attempt = self.lock_attempt();
        if attempt.generation != generation {
            tracing::trace!("refresh attempt superseded during cooldown");
            return;
        }
        attempt.in_flight = false;
        attempt.cooldown_until = None;
        attempt.completion = None;
        tracing::trace!("refresh cooldown elapsed");
    }

    async fn exchange_with_retries(
        &self,
        refresh_token: &RefreshTokenRef,
    ) -> Result<TokenPair, ExchangeError> {
        let mut budget = self.inner.config.retry.budget();

        loop {
            let error = match self.inner.exchange.refresh(refresh_token).await {
                Ok(tokens) => return Ok(tokens),
                Err(error) => error,
            };

            if !error.is_transient() {
                return Err(error);
            }

            let Some(delay) = budget.next_delay() else {
                return Err(error);
            };

            tracing::warn!(
                error = (&error as &dyn error::Error),
                retry = budget.spent(),
                delay_ms = delay.as_millis() as u64,
                "transient error refreshing tokens, will retry"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

fn is_live(completion: &watch::Receiver<Option<RefreshOutcome>>) -> bool {
    completion.borrow().is_some() || completion.has_changed().is_ok()
}

#[async_trait]
impl<C: Clock + Send + Sync + 'static> TokenRefresher for RefreshCoordinator<C> {
    async fn refresh(
        &self,
        trigger: RefreshTrigger,
        rejected: Option<&AccessTokenRef>,
    ) -> RefreshOutcome {
        self.request_refresh(trigger, rejected).await
    }
}
