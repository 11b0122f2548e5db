use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokenkeeper_clock::{Clock, System, UnixTime};

use crate::{codec, AccessToken, AccessTokenRef, RefreshToken, RefreshTokenRef};

/// An access token and refresh token as issued together by the backend
///
/// A pair is never modified once issued; a refresh produces a new pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    access_token: AccessToken,
    refresh_token: RefreshToken,
    #[serde(rename = "accessTokenExpiresAtMs")]
    access_token_expires_at: UnixTime,
}

/// A token's lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenStatus {
    /// The token is fresh and valid
    Fresh,
    /// The token is valid, but should be refreshed
    Stale,
    /// The token is no longer valid
    Expired,
}

impl TokenPair {
    /// Constructs a token pair with an explicit access token expiry
    pub fn new(
        access_token: AccessToken,
        refresh_token: RefreshToken,
        access_token_expires_at: UnixTime,
    ) -> Self {
        Self {
            access_token,
            refresh_token,
            access_token_expires_at,
        }
    }

    /// Gets the access token
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// Gets the refresh token
    #[inline]
    pub fn refresh_token(&self) -> &RefreshTokenRef {
        &self.refresh_token
    }

    /// Gets the expiry recorded when the pair was issued
    #[inline]
    pub fn access_token_expires_at(&self) -> UnixTime {
        self.access_token_expires_at
    }

    /// Gets the expiry claimed by the access token itself, if it carries one
    #[inline]
    pub fn decoded_expiry(&self) -> Option<UnixTime> {
        codec::decode_expiry(self.access_token.as_str())
    }

    /// Gets the best known expiry of the access token
    ///
    /// The expiry embedded in the token is preferred, as it reflects the
    /// token actually issued. The recorded expiry is used otherwise.
    #[inline]
    pub fn effective_expiry(&self) -> UnixTime {
        self.decoded_expiry()
            .unwrap_or(self.access_token_expires_at)
    }

    /// Gets the token's lifecycle status as of the provided time
    ///
    /// A token is considered stale once it is within `refresh_buffer` of
    /// its effective expiry.
    #[inline]
    pub fn token_status_at(&self, time: UnixTime, refresh_buffer: Duration) -> TokenStatus {
        let expiry = self.effective_expiry();
        if time >= expiry {
            TokenStatus::Expired
        } else if time >= expiry - refresh_buffer {
            TokenStatus::Stale
        } else {
            TokenStatus::Fresh
        }
    }

    /// Gets a duration for how much longer the token would be valid as of the
    /// provided time
    #[inline]
    pub fn until_expired_at(&self, time: UnixTime) -> Duration {
        self.effective_expiry().saturating_duration_since(time)
    }
}

/// Configuration for the lifetime assumed for newly issued access tokens
#[derive(Clone, Debug)]
pub struct TokenLifetimeConfig<C = System> {
    access_token_lifetime: Duration,
    clock: C,
}

impl Default for TokenLifetimeConfig {
    /// Default lifetime configuration
    ///
    /// Assumes an access token lifetime of 14 minutes, one minute shorter than
    /// the backend's 15 minute token lifetime, using the system clock.
    fn default() -> Self {
        Self {
            access_token_lifetime: Duration::from_secs(14 * 60),
            clock: System,
        }
    }
}

impl TokenLifetimeConfig {
    /// Constructs a new lifetime configuration
    ///
    /// `access_token_lifetime` should be slightly shorter than the lifetime the
    /// backend actually grants to leave headroom for renewal.
    pub fn new(access_token_lifetime: Duration) -> Self {
        Self {
            access_token_lifetime,
            clock: System,
        }
    }
}

impl<C> TokenLifetimeConfig<C> {
    /// Sets a custom clock to be used
    ///
    /// Useful for testing purposes
    pub fn with_clock<D>(self, clock: D) -> TokenLifetimeConfig<D> {
        TokenLifetimeConfig {
            access_token_lifetime: self.access_token_lifetime,
            clock,
        }
    }

    /// The assumed access token lifetime
    pub fn access_token_lifetime(&self) -> Duration {
        self.access_token_lifetime
    }
}

impl<C: Clock> TokenLifetimeConfig<C> {
    /// The expiry to record for an access token issued now
    pub fn expiry_from_now(&self) -> UnixTime {
        self.clock.now() + self.access_token_lifetime
    }

    /// Given freshly issued tokens, constructs a token pair expiring one
    /// lifetime from now
    pub fn create_pair(&self, access_token: AccessToken, refresh_token: RefreshToken) -> TokenPair {
        TokenPair::new(access_token, refresh_token, self.expiry_from_now())
    }
}
