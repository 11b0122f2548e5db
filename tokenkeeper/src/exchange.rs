//! Token exchange with the backend identity service

use std::{fmt, time::Duration};

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokenkeeper_clock::{Clock, System};

use crate::{
    BackendIdentity, Password, ProviderAssertion, RefreshTokenRef, TokenLifetimeConfig, TokenPair,
};

pub mod dto;

/// An external identity provider whose assertions the backend accepts
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdentityProvider {
    /// Google, asserting identity with an ID token
    Google,
    /// GitHub, asserting identity with a provider access token
    GitHub,
}

impl IdentityProvider {
    /// A short name for the provider, suitable for logging
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Google => "google",
            Self::GitHub => "github",
        }
    }
}

impl fmt::Display for IdentityProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to establish a new session
#[derive(Clone, Debug)]
pub enum SignInRequest {
    /// Exchange an identity provider's assertion
    Provider {
        /// The provider that issued the assertion
        provider: IdentityProvider,
        /// The provider's assertion
        assertion: ProviderAssertion,
    },
    /// Sign in with an email address and password
    Credentials {
        /// The account email address
        email: String,
        /// The account password
        password: Password,
    },
    /// Create an account with an email address and password, signing in
    /// to it
    Register {
        /// The account email address
        email: String,
        /// The account password
        password: Password,
        /// Given name, may be empty
        first_name: String,
        /// Family name, may be empty
        last_name: String,
    },
}

impl SignInRequest {
    /// The sign-in method, suitable for logging
    pub fn method(&self) -> &'static str {
        match self {
            Self::Provider { provider, .. } => provider.as_str(),
            Self::Credentials { .. } => "credentials",
            Self::Register { .. } => "register",
        }
    }
}

/// The result of a successful identity exchange
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedIn {
    /// The first-party tokens issued
    pub tokens: TokenPair,
    /// The backend's view of the user
    pub identity: BackendIdentity,
}

/// An exchange of credentials for first-party tokens
#[async_trait]
pub trait TokenExchange: Send + Sync {
    /// Exchanges an external identity assertion for a first-party token pair
    async fn exchange_identity(&self, request: &SignInRequest) -> Result<SignedIn, ExchangeError>;

    /// Exchanges a refresh token for a renewed token pair
    ///
    /// If the backend does not rotate the refresh token, the pair carries
    /// `refresh_token` forward.
    async fn refresh(&self, refresh_token: &RefreshTokenRef) -> Result<TokenPair, ExchangeError>;

    /// Asks the backend to stop honoring a refresh token
    async fn revoke(&self, refresh_token: &RefreshTokenRef) -> Result<(), ExchangeError>;
}

/// An error while exchanging tokens with the backend
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// The backend responded with a non-success status
    #[error("error response from backend: {body}")]
    ErrorWithBody {
        /// The underlying request error
        source: reqwest::Error,
        /// The body of the error
        body: String,
    },
    /// Unable to deserialize the response body
    #[error("error deserializing response body from backend")]
    TokenBodyError(#[from] serde_json::Error),
    /// Unable to read the response
    #[error("error reading response body")]
    BodyReadError(#[source] reqwest::Error),
    /// Unable to send the request, including timing out
    #[error("error sending request to backend")]
    RequestSend(#[source] reqwest::Error),
}

impl ExchangeError {
    /// The status code the backend responded with, if it responded
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::ErrorWithBody { source, .. } => source.status(),
            _ => None,
        }
    }

    /// Whether the failure may clear up on its own if retried
    ///
    /// Network failures, timeouts, server errors and throttling are
    /// transient. A response rejecting the credentials is not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ErrorWithBody { .. } => self.status().map_or(true, |status| {
                status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
            }),
            Self::TokenBodyError(_) => false,
            Self::BodyReadError(_) | Self::RequestSend(_) => true,
        }
    }
}

/// A base URL cannot be used to build the backend endpoints
#[derive(Debug, Error)]
pub enum EndpointError {
    /// The URL cannot have paths joined to it
    #[error("'{0}' cannot be used as a base URL")]
    CannotBeABase(Url),
    /// An endpoint path could not be joined to the base URL
    #[error("unable to join '{path}' to the base URL")]
    Join {
        /// The endpoint path
        path: &'static str,
        /// The underlying parse error
        source: url::ParseError,
    },
}

/// The backend endpoints involved in the token lifecycle
#[derive(Clone, Debug)]
pub struct BackendEndpoints {
    google: Url,
    github: Url,
    credentials: Url,
    register: Url,
    refresh: Url,
    logout: Url,
}

impl BackendEndpoints {
    /// Builds the endpoints relative to the backend's API base URL
    ///
    /// For a base of `https://example.com/api`, the refresh endpoint is
    /// `https://example.com/api/auth/token/refresh/`.
    pub fn new(mut base: Url) -> Result<Self, EndpointError> {
        if base.cannot_be_a_base() {
            return Err(EndpointError::CannotBeABase(base));
        }

        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let join = |path: &'static str| {
            base.join(path)
                .map_err(|source| EndpointError::Join { path, source })
        };

        Ok(Self {
            google: join("auth/google/")?,
            github: join("auth/github/")?,
            credentials: join("auth/login/")?,
            register: join("auth/register/")?,
            refresh: join("auth/token/refresh/")?,
            logout: join("auth/logout/")?,
        })
    }

    /// The endpoint handling a sign-in request
    pub fn sign_in(&self, request: &SignInRequest) -> &Url {
        match request {
            SignInRequest::Provider {
                provider: IdentityProvider::Google,
                ..
            } => &self.google,
            SignInRequest::Provider {
                provider: IdentityProvider::GitHub,
                ..
            } => &self.github,
            SignInRequest::Credentials { .. } => &self.credentials,
            SignInRequest::Register { .. } => &self.register,
        }
    }

    /// The refresh endpoint
    pub fn refresh(&self) -> &Url {
        &self.refresh
    }

    /// The logout endpoint
    pub fn logout(&self) -> &Url {
        &self.logout
    }
}

/// A token exchange against the backend's HTTP API
#[derive(Debug)]
pub struct BackendExchangeService<C = System> {
    client: reqwest::Client,
    endpoints: BackendEndpoints,
    lifetime_config: TokenLifetimeConfig<C>,
    timeout: Duration,
}

impl<C> BackendExchangeService<C> {
    /// Constructs a new exchange service
    ///
    /// Requests time out after 10 seconds unless configured otherwise with
    /// [`with_timeout()`][Self::with_timeout()].
    pub fn new(
        client: reqwest::Client,
        endpoints: BackendEndpoints,
        lifetime_config: TokenLifetimeConfig<C>,
    ) -> Self {
        Self {
            client,
            endpoints,
            lifetime_config,
            timeout: Duration::from_secs(10),
        }
    }

    /// Sets the timeout applied to each request
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn post<P: Serialize + ?Sized>(
        &self,
        url: &Url,
        payload: &P,
    ) -> Result<reqwest::Response, ExchangeError> {
        tracing::trace!("sending request to backend");

        let resp = self
            .client
            .post(url.clone())
            .timeout(self.timeout)
            .json(payload)
            .send()
            .await
            .map_err(ExchangeError::RequestSend)?;

        tracing::debug!(
            response.status = resp.status().as_u16(),
            "received response from backend"
        );

        if let Err(error) = resp.error_for_status_ref() {
            let body = resp.text().await.map_err(ExchangeError::BodyReadError)?;
            return Err(ExchangeError::ErrorWithBody {
                source: error,
                body,
            });
        }

        Ok(resp)
    }
}

async fn parse<R: DeserializeOwned>(resp: reqwest::Response) -> Result<R, ExchangeError> {
    let body = resp.bytes().await.map_err(ExchangeError::BodyReadError)?;
    Ok(serde_json::from_slice(&body)?)
}

#[async_trait]
impl<C: Clock + Send + Sync> TokenExchange for BackendExchangeService<C> {
    #[tracing::instrument(
        err,
        skip(self, request),
        fields(
            sign_in.method = request.method(),
            url = %self.endpoints.sign_in(request),
        ),
    )]
    async fn exchange_identity(&self, request: &SignInRequest) -> Result<SignedIn, ExchangeError> {
        let url = self.endpoints.sign_in(request);
        let resp = match request {
            SignInRequest::Provider {
                provider: IdentityProvider::Google,
                assertion,
            } => {
                self.post(url, &dto::IdTokenRequest { id_token: assertion })
                    .await?
            }
            SignInRequest::Provider {
                provider: IdentityProvider::GitHub,
                assertion,
            } => {
                self.post(url, &dto::AccessTokenRequest {
                    access_token: assertion,
                })
                .await?
            }
            SignInRequest::Credentials { email, password } => {
                self.post(url, &dto::CredentialsRequest { email, password })
                    .await?
            }
            SignInRequest::Register {
                email,
                password,
                first_name,
                last_name,
            } => {
                self.post(url, &dto::RegisterRequest {
                    email,
                    password,
                    first_name,
                    last_name,
                })
                .await?
            }
        };

        let resp: dto::SignInResponse = parse(resp).await?;
        let tokens = self.lifetime_config.create_pair(resp.access, resp.refresh);
        let identity = BackendIdentity::from(resp.user);

        tracing::info!(
            user.id = identity.id,
            user.role = ?identity.role,
            expiry = tokens.access_token_expires_at().0,
            "exchanged identity for tokens"
        );

        Ok(SignedIn { tokens, identity })
    }

    #[tracing::instrument(err, skip(self, refresh_token), fields(url = %self.endpoints.refresh()))]
    async fn refresh(&self, refresh_token: &RefreshTokenRef) -> Result<TokenPair, ExchangeError> {
        let resp = self
            .post(
                self.endpoints.refresh(),
                &dto::RefreshRequest {
                    refresh: refresh_token,
                },
            )
            .await?;

        let resp: dto::RefreshResponse = parse(resp).await?;
        let rotated = resp.refresh.is_some();
        let refresh_token = resp.refresh.unwrap_or_else(|| refresh_token.to_owned());
        let tokens = self.lifetime_config.create_pair(resp.access, refresh_token);

        tracing::info!(
            rotated,
            expiry = tokens.access_token_expires_at().0,
            "received renewed tokens"
        );

        Ok(tokens)
    }

    #[tracing::instrument(err, skip(self, refresh_token), fields(url = %self.endpoints.logout()))]
    async fn revoke(&self, refresh_token: &RefreshTokenRef) -> Result<(), ExchangeError> {
        self.post(
            self.endpoints.logout(),
            &dto::RefreshRequest {
                refresh: refresh_token,
            },
        )
        .await?;

        tracing::debug!("refresh token revoked");
        Ok(())
    }
}
