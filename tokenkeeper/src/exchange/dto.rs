//! DTOs for interacting with the backend identity service

use serde::{Deserialize, Serialize};

use crate::{
    AccessToken, BackendIdentity, PasswordRef, ProviderAssertionRef, RefreshToken,
    RefreshTokenRef, Role,
};

/// Identity exchange body for providers asserting with an ID token
#[derive(Debug, Serialize)]
pub struct IdTokenRequest<'a> {
    /// The provider's ID token
    pub id_token: &'a ProviderAssertionRef,
}

/// Identity exchange body for providers asserting with an access token
#[derive(Debug, Serialize)]
pub struct AccessTokenRequest<'a> {
    /// The provider's access token
    pub access_token: &'a ProviderAssertionRef,
}

/// Credentials sign-in body
#[derive(Debug, Serialize)]
pub struct CredentialsRequest<'a> {
    /// The account email address
    pub email: &'a str,
    /// The account password
    pub password: &'a PasswordRef,
}

/// Account registration body
#[derive(Debug, Serialize)]
pub struct RegisterRequest<'a> {
    /// The account email address
    pub email: &'a str,
    /// The account password
    pub password: &'a PasswordRef,
    /// Given name
    pub first_name: &'a str,
    /// Family name
    pub last_name: &'a str,
}

/// Refresh and logout body
#[derive(Debug, Serialize)]
pub struct RefreshRequest<'a> {
    /// The refresh token
    pub refresh: &'a RefreshTokenRef,
}

#[derive(Debug, Deserialize)]
pub(super) struct SignInResponse {
    pub access: AccessToken,
    pub refresh: RefreshToken,
    pub user: UserResponse,
}

#[derive(Debug, Deserialize)]
pub(super) struct UserResponse {
    pub id: i64,
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(default = "unknown_role")]
    pub user_type: Role,
}

fn unknown_role() -> Role {
    Role::Unknown
}

impl From<UserResponse> for BackendIdentity {
    fn from(user: UserResponse) -> Self {
        let full_name = format!("{} {}", user.first_name, user.last_name);
        let display_name = match full_name.trim() {
            "" => user.email.clone(),
            name => name.to_owned(),
        };

        Self {
            id: user.id,
            email: user.email,
            display_name,
            avatar_url: Some(user.avatar).filter(|a| !a.is_empty()),
            role: user.user_type,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct RefreshResponse {
    pub access: AccessToken,
    #[serde(default)]
    pub refresh: Option<RefreshToken>,
}
