//! Proactive refresh ahead of access token expiry

use std::{sync::Arc, time::Duration};

use tokenkeeper_clock::{Clock, System, UnixTime};
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    refresh::{RefreshCoordinator, RefreshOutcome, RefreshTrigger},
    SessionRecord,
};

/// A background task that refreshes the session's tokens shortly before the
/// access token expires
///
/// The task watches the session store. Whenever the session changes, any
/// pending timer is dropped and a new one is derived from the current access
/// token, so at most one timer is ever outstanding.
///
/// The timer is derived only from the expiry decoded from the access token
/// itself. Sessions whose access token has no decodable expiry are left to
/// be refreshed reactively.
#[derive(Debug)]
pub struct RefreshScheduler<C = System> {
    coordinator: RefreshCoordinator<C>,
    task: JoinHandle<()>,
}

impl<C: Clock + Send + Sync + 'static> RefreshScheduler<C> {
    /// Spawns the scheduler for the coordinator's session
    pub fn spawn(coordinator: RefreshCoordinator<C>) -> Self {
        let session = coordinator.store().subscribe();
        let task = tokio::spawn(keep_fresh(coordinator.clone(), session));

        Self { coordinator, task }
    }

    /// Re-checks the session, refreshing if the access token is within the
    /// refresh buffer of its expiry
    ///
    /// Intended to be called when the client regains focus. Returns `None`
    /// if the token was still fresh.
    pub async fn revalidate(&self) -> Option<RefreshOutcome> {
        self.coordinator.revalidate().await
    }
}

impl<C> RefreshScheduler<C> {
    /// The coordinator this scheduler triggers
    pub fn coordinator(&self) -> &RefreshCoordinator<C> {
        &self.coordinator
    }

    /// Stops the scheduler
    ///
    /// A refresh already handed to the coordinator still completes.
    pub fn shutdown(self) {}
}

impl<C> Drop for RefreshScheduler<C> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn refresh_at<C: Clock>(
    coordinator: &RefreshCoordinator<C>,
    record: &SessionRecord,
) -> Option<UnixTime> {
    if let Some(error) = record.error {
        tracing::trace!(?error, "session in error, nothing to schedule");
        return None;
    }

    let tokens = record.tokens.as_ref()?;
    let expiry = match tokens.decoded_expiry() {
        Some(expiry) => expiry,
        None => {
            tracing::debug!("access token has no decodable expiry, relying on reactive refresh");
            return None;
        }
    };

    let mut at = expiry - coordinator.config().refresh_buffer();
    if let Some(cooldown_until) = coordinator.cooldown_until() {
        at = at.max(cooldown_until);
    }

    Some(at)
}

async fn keep_fresh<C: Clock + Send + Sync + 'static>(
    coordinator: RefreshCoordinator<C>,
    mut session: watch::Receiver<Arc<SessionRecord>>,
) {
    loop {
        let record = Arc::clone(&session.borrow_and_update());

        if let Some(at) = refresh_at(&coordinator, &record) {
            let now = coordinator.clock().now();

            if at <= now {
                tracing::debug!(
                    overdue_ms = now.saturating_duration_since(at).as_millis() as u64,
                    "token within refresh buffer, refreshing now"
                );
                let outcome = coordinator
                    .request_refresh(RefreshTrigger::Scheduled, None)
                    .await;

                match session.has_changed() {
                    Ok(true) => continue,
                    Ok(false) if matches!(outcome, RefreshOutcome::Refreshed(_)) => continue,
                    Ok(false) => {}
                    Err(_) => break,
                }
            } else {
                tracing::debug!(
                    delay_ms = at.saturating_duration_since(now).as_millis() as u64,
                    "scheduled token refresh"
                );

                tokio::select! {
                    changed = session.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        tracing::trace!("session changed, rescheduling");
                    }
                    () = sleep_until(coordinator.clock(), at) => {
                        tracing::trace!("refresh timer elapsed");
                    }
                }
                continue;
            }
        }

        if session.changed().await.is_err() {
            break;
        }
    }

    tracing::info!("session store dropped, halting refreshes");
}

async fn sleep_until<C: Clock>(clock: &C, deadline: UnixTime) {
    // The timer does not advance while a machine is suspended, so wake
    // periodically and compare against the wall clock.
    const HEARTBEAT: Duration = Duration::from_secs(30);

    loop {
        let now = clock.now();
        if now >= deadline {
            break;
        }

        let remaining = deadline.saturating_duration_since(now);
        let delay = remaining.min(HEARTBEAT);
        tracing::trace!(
            delay_ms = delay.as_millis() as u64,
            remaining_ms = remaining.as_millis() as u64,
            "refresh not yet due, sleeping…"
        );
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::{
        refresh::RefreshConfig,
        test_util::{jwt_expiring_at, signed_in_store, PausedClock, Reply, StubExchange},
        AccessToken, ErrorMarker, InMemorySessionStore, RefreshToken, SessionPatch, SessionStore,
        TokenPair,
    };

    const ORIGIN: UnixTime = UnixTime(1_700_000_000_000);

    struct Fixture {
        store: Arc<InMemorySessionStore>,
        exchange: Arc<StubExchange<PausedClock>>,
        scheduler: RefreshScheduler<PausedClock>,
    }

    fn fixture(expires_in: Duration, lifetime: Duration) -> Fixture {
        let clock = PausedClock::new(ORIGIN);
        let store = Arc::new(signed_in_store(clock.now() + expires_in));
        let exchange = Arc::new(StubExchange::new(clock.clone(), lifetime));
        let coordinator = RefreshCoordinator::with_clock(
            store.clone(),
            exchange.clone(),
            RefreshConfig::default(),
            clock,
        );
        Fixture {
            store,
            exchange,
            scheduler: RefreshScheduler::spawn(coordinator),
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn token_inside_buffer_is_refreshed_immediately() {
        let f = fixture(Duration::from_secs(90), Duration::from_secs(900));
        settle().await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(f.exchange.refresh_count(), 1);
        let expiry = f.store.read().tokens.as_ref().unwrap().effective_expiry();
        assert_eq!(expiry, ORIGIN + Duration::from_secs(900));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_fires_buffer_ahead_of_expiry() {
        let f = fixture(Duration::from_secs(600), Duration::from_secs(600));

        tokio::time::sleep(Duration::from_secs(479)).await;
        assert_eq!(f.exchange.refresh_count(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(f.exchange.refresh_count(), 1);

        // The renewed token is scheduled in turn.
        tokio::time::sleep(Duration::from_secs(480)).await;
        assert_eq!(f.exchange.refresh_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reactive_refresh_supersedes_pending_timer() {
        let f = fixture(Duration::from_secs(600), Duration::from_secs(600));
        tokio::time::sleep(Duration::from_secs(300)).await;

        let stale = f.store.read().usable_access_token().unwrap().to_owned();
        f.scheduler
            .coordinator()
            .request_refresh(RefreshTrigger::Unauthorized, Some(&stale))
            .await;
        assert_eq!(f.exchange.refresh_count(), 1);

        // The original timer at minute 8 must not fire; the next is due at
        // minute 13 for the token issued at minute 5.
        tokio::time::sleep(Duration::from_secs(400)).await;
        assert_eq!(f.exchange.refresh_count(), 1);

        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(f.exchange.refresh_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_and_unauthorized_at_once_share_one_exchange() {
        let f = fixture(Duration::from_secs(600), Duration::from_secs(600));
        f.exchange.set_latency(Duration::from_millis(300));

        tokio::time::sleep(Duration::from_secs(480)).await;
        let stale = f.store.read().usable_access_token().unwrap().to_owned();
        let outcome = f
            .scheduler
            .coordinator()
            .request_refresh(RefreshTrigger::Unauthorized, Some(&stale))
            .await;

        assert!(matches!(outcome, RefreshOutcome::Refreshed(_)));
        assert_eq!(f.exchange.refresh_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_stops_scheduling() {
        let f = fixture(Duration::from_secs(60), Duration::from_secs(600));
        f.exchange.script([Reply::Reject]);

        tokio::time::sleep(Duration::from_secs(3_600)).await;

        assert_eq!(f.exchange.refresh_count(), 1);
        assert_eq!(
            f.store.read().error,
            Some(ErrorMarker::RefreshAccessTokenError)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn opaque_token_is_not_scheduled() {
        let f = fixture(Duration::from_secs(600), Duration::from_secs(600));
        f.store
            .update(SessionPatch::SignedIn {
                tokens: TokenPair::new(
                    AccessToken::from_static("opaque"),
                    RefreshToken::from_static("r1"),
                    ORIGIN + Duration::from_secs(60),
                ),
                identity: crate::test_util::identity(),
            })
            .await;

        tokio::time::sleep(Duration::from_secs(3_600)).await;
        assert_eq!(f.exchange.refresh_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn new_sign_in_reschedules() {
        let f = fixture(Duration::from_secs(600), Duration::from_secs(600));
        tokio::time::sleep(Duration::from_secs(60)).await;

        f.store
            .update(SessionPatch::SignedIn {
                tokens: TokenPair::new(
                    AccessToken::new(jwt_expiring_at(ORIGIN + Duration::from_secs(180))),
                    RefreshToken::from_static("r2"),
                    ORIGIN + Duration::from_secs(180),
                ),
                identity: crate::test_util::identity(),
            })
            .await;

        // Due at 180 - 120 = 60 s, which has already passed.
        settle().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.exchange.refreshes.load(Ordering::Acquire), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sign_out_cancels_timer() {
        let f = fixture(Duration::from_secs(600), Duration::from_secs(600));
        f.store.update(SessionPatch::Cleared).await;

        tokio::time::sleep(Duration::from_secs(3_600)).await;
        assert_eq!(f.exchange.refresh_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn revalidate_skips_fresh_token() {
        let f = fixture(Duration::from_secs(600), Duration::from_secs(600));
        assert_eq!(f.scheduler.revalidate().await, None);

        f.scheduler.shutdown();
        assert_eq!(f.exchange.refresh_count(), 0);
    }
}
