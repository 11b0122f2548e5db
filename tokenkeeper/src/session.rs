//! The persisted session record and the contract of the store that owns it

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::{AccessTokenRef, RefreshToken, TokenPair};

/// The role a user holds in the marketplace
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// A user booking lessons
    Student,
    /// A user offering lessons
    Tutor,
    /// A role this client does not know about
    #[serde(other)]
    Unknown,
}

/// The user identity the backend associates with a session
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendIdentity {
    /// Backend user identifier
    pub id: i64,
    /// Primary email address
    pub email: String,
    /// Name to show for the user
    pub display_name: String,
    /// Avatar image, if the user has one
    pub avatar_url: Option<String>,
    /// The user's role
    pub role: Role,
}

/// A terminal authentication failure recorded in the session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorMarker {
    /// The initial identity exchange failed
    BackendAuthError,
    /// Exchanging the refresh token for a new pair failed
    RefreshAccessTokenError,
}

/// The session as held by the session store
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// The current token pair
    pub tokens: Option<TokenPair>,
    /// A terminal failure; while set, `tokens` must not be used
    pub error: Option<ErrorMarker>,
    /// The signed-in user
    pub identity: Option<BackendIdentity>,
}

impl SessionRecord {
    /// The access token to present to the backend, if one is usable
    ///
    /// An access token is never usable while an error marker is set,
    /// regardless of its expiry.
    pub fn usable_access_token(&self) -> Option<&AccessTokenRef> {
        if self.error.is_some() {
            return None;
        }

        self.tokens.as_ref().map(TokenPair::access_token)
    }

    /// Whether the record holds a token pair without an error marker
    pub fn is_signed_in(&self) -> bool {
        self.usable_access_token().is_some()
    }

    /// Applies a patch, returning whether the record changed
    pub fn apply(&mut self, patch: SessionPatch) -> bool {
        match patch {
            SessionPatch::SignedIn { tokens, identity } => {
                *self = SessionRecord {
                    tokens: Some(tokens),
                    error: None,
                    identity: Some(identity),
                };
                true
            }
            SessionPatch::Refreshed { from, tokens } => {
                if !self.holds_refresh_token(&from) {
                    return false;
                }
                self.tokens = Some(tokens);
                self.error = None;
                true
            }
            SessionPatch::RefreshFailed { from } => {
                if !self.holds_refresh_token(&from) {
                    return false;
                }
                self.error = Some(ErrorMarker::RefreshAccessTokenError);
                true
            }
            SessionPatch::SignInFailed => {
                *self = SessionRecord {
                    tokens: None,
                    error: Some(ErrorMarker::BackendAuthError),
                    identity: None,
                };
                true
            }
            SessionPatch::Cleared => {
                let changed = *self != SessionRecord::default();
                *self = SessionRecord::default();
                changed
            }
        }
    }

    fn holds_refresh_token(&self, refresh_token: &RefreshToken) -> bool {
        self.tokens
            .as_ref()
            .map_or(false, |t| t.refresh_token().as_str() == refresh_token.as_str())
    }
}

/// A change to the session record
///
/// Patches resulting from a refresh name the refresh token they were derived
/// from, and are discarded if the session no longer holds that token. This
/// keeps a late refresh from resurrecting a session that was signed out or
/// replaced in the meantime.
#[derive(Clone, Debug)]
pub enum SessionPatch {
    /// A new sign-in replaced the session
    SignedIn {
        /// The issued tokens
        tokens: TokenPair,
        /// The signed-in user
        identity: BackendIdentity,
    },
    /// A refresh produced a new token pair
    Refreshed {
        /// The refresh token that was exchanged
        from: RefreshToken,
        /// The renewed tokens
        tokens: TokenPair,
    },
    /// Exchanging a refresh token failed
    RefreshFailed {
        /// The refresh token that was rejected
        from: RefreshToken,
    },
    /// The initial identity exchange failed
    SignInFailed,
    /// The session was terminated
    Cleared,
}

/// The store that owns the session record
///
/// All components read and change the session only through this contract.
/// Subscribers are notified of every change.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Reads the current session record
    fn read(&self) -> Arc<SessionRecord>;

    /// Applies a patch and returns the resulting record
    async fn update(&self, patch: SessionPatch) -> Arc<SessionRecord>;

    /// Subscribes to changes of the session record
    fn subscribe(&self) -> watch::Receiver<Arc<SessionRecord>>;
}

/// A session store that keeps the record in memory
#[derive(Debug)]
pub struct InMemorySessionStore {
    tx: watch::Sender<Arc<SessionRecord>>,
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new(SessionRecord::default())
    }
}

impl InMemorySessionStore {
    /// Constructs a new in-memory store holding `record`
    pub fn new(record: SessionRecord) -> Self {
        let (tx, _) = watch::channel(Arc::new(record));
        Self { tx }
    }

    /// Applies a patch atomically, notifying subscribers only if the
    /// record changed
    pub fn apply(&self, patch: SessionPatch) -> Arc<SessionRecord> {
        let mut resulting = None;
        self.tx.send_if_modified(|current| {
            let mut next = SessionRecord::clone(&**current);
            let changed = next.apply(patch);
            if changed {
                *current = Arc::new(next);
            }
            resulting = Some(Arc::clone(current));
            changed
        });

        resulting.unwrap_or_else(|| self.read())
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    fn read(&self) -> Arc<SessionRecord> {
        Arc::clone(&self.tx.borrow())
    }

    async fn update(&self, patch: SessionPatch) -> Arc<SessionRecord> {
        self.apply(patch)
    }

    fn subscribe(&self) -> watch::Receiver<Arc<SessionRecord>> {
        self.tx.subscribe()
    }
}
