//! Access and refresh token lifecycle management for interactive clients
//!
//! A client signs in once, by exchanging an identity provider's assertion or
//! a set of credentials with the backend, and receives a short-lived access
//! token together with a longer-lived refresh token. This crate keeps that
//! session alive for as long as the refresh token is honored, and ends it
//! cleanly once it is not.
//!
//! Renewal happens from three directions:
//!
//! * A background [scheduler][scheduler::RefreshScheduler] refreshes the
//!   session shortly before the access token expires, as read from the
//!   token's own `exp` claim.
//! * The client can [revalidate][SessionKeeper::revalidate()] when it
//!   regains focus, which catches up after the machine was suspended.
//! * A request that the backend rejects as unauthorized asks the
//!   [refresher][refresh::TokenRefresher] for a new token and retries once.
//!
//! All three funnel through a single [coordinator][refresh::RefreshCoordinator]
//! so that at most one exchange of the refresh token is ever in flight. When
//! the backend rejects the refresh token, the session is marked as failed, no
//! further refreshes are attempted, and the
//! [sign-out guard][guard::SignOutGuard] ends the session exactly once.
//!
//! # General Flow
//!
//! On application start-up, set up a session store and the exchange with the
//! backend, then start a [`SessionKeeper`]. The file-backed store lets a
//! session survive application restarts.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tokenkeeper::{
//!     exchange::{BackendEndpoints, BackendExchangeService, IdentityProvider, SignInRequest},
//!     file::FileSessionStore,
//!     guard::SignOutReason,
//!     refresh::RefreshConfig,
//!     ProviderAssertion, SessionKeeper, TokenLifetimeConfig,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let endpoints = BackendEndpoints::new("https://api.example.com/api/".parse()?)?;
//! let exchange = BackendExchangeService::new(
//!     reqwest::Client::new(),
//!     endpoints,
//!     TokenLifetimeConfig::default(),
//! );
//!
//! let store = FileSessionStore::open("session.json".into()).await?;
//!
//! let keeper = SessionKeeper::start(
//!     Arc::new(store),
//!     Arc::new(exchange),
//!     RefreshConfig::default(),
//!     |reason: SignOutReason| tracing::info!(?reason, "signed out, returning to sign-in"),
//! );
//!
//! let identity = keeper
//!     .sign_in(&SignInRequest::Provider {
//!         provider: IdentityProvider::Google,
//!         assertion: ProviderAssertion::from_static("eyJhbGciOi..."),
//!     })
//!     .await?;
//!
//! tracing::info!(user = %identity.display_name, "signed in");
//! # Ok(())
//! # }
//! ```
//!
//! Outgoing requests attach the session's access token and hand the result
//! of [`SessionKeeper::refresher()`] whatever token the backend rejected. The
//! `tokenkeeper_reqwest` crate provides this as middleware for [reqwest].
//!
//! # Features
//!
//! The following features are supported by this crate, all of which are enabled by default:
//!
//! * `file`: Provides a session store that persists the session to the local filesystem.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod backoff;
mod braids;
pub mod codec;
pub mod exchange;
#[cfg(feature = "file")]
#[cfg_attr(docsrs, doc(cfg(feature = "file")))]
pub mod file;
pub mod guard;
mod keeper;
pub mod refresh;
pub mod scheduler;
mod session;
mod tokens;

#[cfg(test)]
mod test_util;

pub use braids::*;
pub use keeper::SessionKeeper;
pub use session::{
    BackendIdentity, ErrorMarker, InMemorySessionStore, Role, SessionPatch, SessionRecord,
    SessionStore,
};
pub use tokens::{TokenLifetimeConfig, TokenPair, TokenStatus};
