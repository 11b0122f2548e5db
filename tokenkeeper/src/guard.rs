//! Termination of sessions that can no longer be renewed

use std::{
    error, fmt,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::{sync::watch, task::JoinHandle};

use crate::{
    exchange::TokenExchange, ErrorMarker, RefreshToken, SessionPatch, SessionRecord, SessionStore,
};

/// Why a session was signed out
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignOutReason {
    /// The refresh token was rejected and the session cannot be renewed
    RefreshFailed,
    /// The user asked to sign out
    UserRequested,
}

/// Notified once each time a session is signed out
///
/// The client uses this to route the user back to the sign-in page.
pub trait SignOutHandler: Send + Sync {
    /// Handles a completed sign-out
    fn signed_out(&self, reason: SignOutReason);
}

impl<F> SignOutHandler for F
where
    F: Fn(SignOutReason) + Send + Sync,
{
    fn signed_out(&self, reason: SignOutReason) {
        self(reason)
    }
}

struct Inner {
    store: Arc<dyn SessionStore>,
    exchange: Arc<dyn TokenExchange>,
    handler: Box<dyn SignOutHandler>,
    /// The refresh token of the session most recently signed out
    ended: Mutex<Option<RefreshToken>>,
}

impl Inner {
    /// Claims the sign-out of the session holding `record`'s tokens
    ///
    /// Fails if that session was already signed out, or if the record is
    /// already empty.
    fn claim(&self, record: &SessionRecord) -> bool {
        let refresh_token = match record.tokens.as_ref() {
            Some(tokens) => tokens.refresh_token(),
            None => return *record != SessionRecord::default(),
        };

        let mut ended = self.ended.lock().unwrap_or_else(PoisonError::into_inner);
        if ended.as_deref() == Some(refresh_token) {
            return false;
        }
        *ended = Some(refresh_token.to_owned());
        true
    }

    async fn sign_out(&self, reason: SignOutReason, record: &SessionRecord) -> bool {
        if !self.claim(record) {
            tracing::debug!(?reason, "session already signed out");
            return false;
        }

        if reason == SignOutReason::UserRequested {
            if let Some(tokens) = record.tokens.as_ref() {
                if let Err(error) = self.exchange.revoke(tokens.refresh_token()).await {
                    tracing::warn!(
                        error = (&error as &dyn error::Error),
                        "unable to revoke refresh token, signing out locally"
                    );
                }
            }
        }

        self.store.update(SessionPatch::Cleared).await;
        tracing::info!(?reason, "session signed out");
        self.handler.signed_out(reason);
        true
    }
}

/// Ends sessions whose refresh has failed
///
/// The guard watches the session store and, on observing a refresh failure,
/// clears the session and notifies its [`SignOutHandler`]. Each session is
/// signed out at most once, however many failures or requests name it.
pub struct SignOutGuard {
    inner: Arc<Inner>,
    task: JoinHandle<()>,
}

impl fmt::Debug for SignOutGuard {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SignOutGuard")
            .field("ended", &*self.inner.ended.lock().unwrap_or_else(PoisonError::into_inner))
            .field("task", &self.task)
            .finish()
    }
}

impl SignOutGuard {
    /// Spawns a guard over the session held in `store`
    pub fn spawn<H>(
        store: Arc<dyn SessionStore>,
        exchange: Arc<dyn TokenExchange>,
        handler: H,
    ) -> Self
    where
        H: SignOutHandler + 'static,
    {
        let session = store.subscribe();
        let inner = Arc::new(Inner {
            store,
            exchange,
            handler: Box::new(handler),
            ended: Mutex::new(None),
        });
        let task = tokio::spawn(watch_for_failure(Arc::clone(&inner), session));

        Self { inner, task }
    }

    /// Signs the user out at their request
    ///
    /// The refresh token is revoked with the backend on a best-effort basis
    /// before the session is cleared. Returns `false` if there is no
    /// session or it is already being signed out.
    pub async fn sign_out(&self) -> bool {
        let record = self.inner.store.read();
        self.inner.sign_out(SignOutReason::UserRequested, &record).await
    }
}

impl Drop for SignOutGuard {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn watch_for_failure(inner: Arc<Inner>, mut session: watch::Receiver<Arc<SessionRecord>>) {
    loop {
        let record = Arc::clone(&session.borrow_and_update());

        if record.error == Some(ErrorMarker::RefreshAccessTokenError) {
            tracing::warn!("session refresh failed, forcing sign-out");
            inner.sign_out(SignOutReason::RefreshFailed, &record).await;
        }

        if session.changed().await.is_err() {
            tracing::debug!("session store dropped, guard exiting");
            return;
        }
    }
}
