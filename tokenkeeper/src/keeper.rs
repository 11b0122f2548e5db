use std::{error, fmt, sync::Arc};

use tokenkeeper_clock::{Clock, System};

use crate::{
    exchange::{ExchangeError, SignInRequest, SignedIn, TokenExchange},
    guard::{SignOutGuard, SignOutHandler},
    refresh::{RefreshConfig, RefreshCoordinator, RefreshOutcome, TokenRefresher},
    scheduler::RefreshScheduler,
    BackendIdentity, SessionPatch, SessionRecord, SessionStore,
};

/// The assembled token lifecycle for one client session
///
/// Owns the proactive refresh scheduler and the sign-out guard, and offers
/// sign-in, sign-out and revalidation as entry points. Requests to the
/// backend obtain their token refresher from [`SessionKeeper::refresher`].
///
/// Dropping the keeper stops its background tasks.
pub struct SessionKeeper<C = System> {
    store: Arc<dyn SessionStore>,
    exchange: Arc<dyn TokenExchange>,
    scheduler: RefreshScheduler<C>,
    guard: SignOutGuard,
}

impl<C: fmt::Debug> fmt::Debug for SessionKeeper<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SessionKeeper")
            .field("session", &self.store.read())
            .field("scheduler", &self.scheduler)
            .field("guard", &self.guard)
            .finish_non_exhaustive()
    }
}

impl SessionKeeper<System> {
    /// Starts managing the session held in `store`
    pub fn start<H>(
        store: Arc<dyn SessionStore>,
        exchange: Arc<dyn TokenExchange>,
        config: RefreshConfig,
        handler: H,
    ) -> Self
    where
        H: SignOutHandler + 'static,
    {
        Self::start_with_clock(store, exchange, config, handler, System)
    }
}

impl<C: Clock + Send + Sync + 'static> SessionKeeper<C> {
    /// Starts managing the session using the given clock
    pub fn start_with_clock<H>(
        store: Arc<dyn SessionStore>,
        exchange: Arc<dyn TokenExchange>,
        config: RefreshConfig,
        handler: H,
        clock: C,
    ) -> Self
    where
        H: SignOutHandler + 'static,
    {
        let coordinator = RefreshCoordinator::with_clock(
            Arc::clone(&store),
            Arc::clone(&exchange),
            config,
            clock,
        );
        let scheduler = RefreshScheduler::spawn(coordinator);
        let guard = SignOutGuard::spawn(Arc::clone(&store), Arc::clone(&exchange), handler);

        tracing::debug!(
            signed_in = store.read().is_signed_in(),
            "session keeper started"
        );

        Self {
            store,
            exchange,
            scheduler,
            guard,
        }
    }

    /// Exchanges an identity assertion or credentials for a new session
    ///
    /// On failure the session records a backend authentication error and the
    /// exchange error is returned.
    #[tracing::instrument(skip_all, fields(method = request.method()))]
    pub async fn sign_in(&self, request: &SignInRequest) -> Result<BackendIdentity, ExchangeError> {
        match self.exchange.exchange_identity(request).await {
            Ok(SignedIn { tokens, identity }) => {
                self.store
                    .update(SessionPatch::SignedIn {
                        tokens,
                        identity: identity.clone(),
                    })
                    .await;
                tracing::info!(user.id = identity.id, "signed in");
                Ok(identity)
            }
            Err(error) => {
                tracing::warn!(
                    error = (&error as &dyn error::Error),
                    "identity exchange failed"
                );
                self.store.update(SessionPatch::SignInFailed).await;
                Err(error)
            }
        }
    }

    /// Re-checks the session, refreshing if it is about to expire
    pub async fn revalidate(&self) -> Option<RefreshOutcome> {
        self.scheduler.revalidate().await
    }

    /// A refresher for request paths that receive an unauthorized response
    pub fn refresher(&self) -> Arc<dyn TokenRefresher> {
        Arc::new(self.scheduler.coordinator().clone())
    }
}

impl<C> SessionKeeper<C> {
    /// Signs the user out at their request
    ///
    /// Returns `false` if there is no session or it is already being signed
    /// out.
    pub async fn sign_out(&self) -> bool {
        self.guard.sign_out().await
    }

    /// The current session record
    pub fn session(&self) -> Arc<SessionRecord> {
        self.store.read()
    }

    /// The store holding the session
    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Stops the background tasks
    pub fn shutdown(self) {}
}

#[cfg(test)]
mod tests {
    use std::{sync::Mutex, time::Duration};

    use tokenkeeper_clock::UnixTime;

    use super::*;
    use crate::{
        guard::SignOutReason,
        refresh::RefreshTrigger,
        test_util::{PausedClock, Reply, StubExchange},
        ErrorMarker, InMemorySessionStore, Password, Role,
    };

    const LIFETIME: Duration = Duration::from_secs(900);

    struct Fixture {
        store: Arc<InMemorySessionStore>,
        exchange: Arc<StubExchange<PausedClock>>,
        keeper: SessionKeeper<PausedClock>,
        sign_outs: Arc<Mutex<Vec<SignOutReason>>>,
    }

    fn fixture() -> Fixture {
        let clock = PausedClock::new(UnixTime::from_secs(1_700_000_000));
        let store = Arc::new(InMemorySessionStore::default());
        let exchange = Arc::new(StubExchange::new(clock.clone(), LIFETIME));
        let sign_outs = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&sign_outs);
        let keeper = SessionKeeper::start_with_clock(
            store.clone(),
            exchange.clone(),
            RefreshConfig::default(),
            move |reason: SignOutReason| recorded.lock().unwrap().push(reason),
            clock,
        );
        Fixture {
            store,
            exchange,
            keeper,
            sign_outs,
        }
    }

    fn credentials() -> SignInRequest {
        SignInRequest::Credentials {
            email: "ada@example.com".into(),
            password: Password::from_static("hunter2"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sign_in_establishes_session() {
        let f = fixture();

        let identity = f.keeper.sign_in(&credentials()).await.unwrap();

        assert_eq!(identity.role, Role::Tutor);
        let session = f.keeper.session();
        assert!(session.is_signed_in());
        assert_eq!(session.identity.as_ref(), Some(&identity));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_sign_in_records_error() {
        let f = fixture();
        f.exchange.reject_sign_in();

        assert!(f.keeper.sign_in(&credentials()).await.is_err());

        let session = f.keeper.session();
        assert_eq!(session.error, Some(ErrorMarker::BackendAuthError));
        assert_eq!(session.usable_access_token(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn session_is_kept_fresh_for_hours() {
        let f = fixture();
        f.keeper.sign_in(&credentials()).await.unwrap();

        tokio::time::sleep(Duration::from_secs(3 * 3_600)).await;

        // One refresh every 13 minutes.
        assert_eq!(f.exchange.refresh_count(), 13);
        assert!(f.keeper.session().is_signed_in());
        assert!(f.sign_outs.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_failure_signs_out_exactly_once() {
        let f = fixture();
        f.keeper.sign_in(&credentials()).await.unwrap();
        f.exchange.script([Reply::Reject]);
        let refresher = f.keeper.refresher();

        tokio::time::sleep(Duration::from_secs(781)).await;

        assert_eq!(f.exchange.refresh_count(), 1);
        assert_eq!(
            *f.sign_outs.lock().unwrap(),
            vec![SignOutReason::RefreshFailed]
        );
        assert_eq!(*f.store.read(), SessionRecord::default());

        let outcome = refresher.refresh(RefreshTrigger::Unauthorized, None).await;
        assert_eq!(outcome, RefreshOutcome::SignedOut);
        assert_eq!(f.exchange.refresh_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_sign_out_revokes_and_stops_refreshing() {
        let f = fixture();
        f.keeper.sign_in(&credentials()).await.unwrap();

        assert!(f.keeper.sign_out().await);
        assert_eq!(f.exchange.revoked.lock().unwrap().len(), 1);

        tokio::time::sleep(Duration::from_secs(3_600)).await;
        assert_eq!(f.exchange.refresh_count(), 0);
        assert_eq!(
            *f.sign_outs.lock().unwrap(),
            vec![SignOutReason::UserRequested]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn debug_output_redacts_tokens() {
        let f = fixture();
        f.keeper.sign_in(&credentials()).await.unwrap();

        let debug = format!("{:?}", f.keeper);

        assert!(debug.starts_with("SessionKeeper {"));
        assert!(debug.contains("***ACCESS TOKEN***"));
        assert!(debug.contains("***REFRESH TOKEN***"));
        assert!(!debug.contains("refresh-0"));
    }

    #[tokio::test(start_paused = true)]
    async fn revalidate_leaves_fresh_session_alone() {
        let f = fixture();
        f.keeper.sign_in(&credentials()).await.unwrap();

        assert_eq!(f.keeper.revalidate().await, None);
        assert_eq!(f.exchange.refresh_count(), 0);

        f.keeper.shutdown();
    }
}
