use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use tokenkeeper::{
    exchange::{BackendEndpoints, BackendExchangeService, IdentityProvider, SignInRequest},
    file::FileSessionStore,
    guard::SignOutReason,
    refresh::RefreshConfig,
    Password, ProviderAssertion, SessionKeeper, TokenLifetimeConfig, TokenStatus,
};
use tokenkeeper_clock::{Clock, System};
use tokio::time;

#[derive(Debug, Parser)]
struct Opts {
    /// The backend API base URL, such as `https://api.example.com/api/`
    #[arg(short, long, env)]
    backend_url: reqwest::Url,

    /// Email address to sign in with when there is no stored session
    #[arg(short, long, env, requires = "password")]
    email: Option<String>,

    /// Password to sign in with
    #[arg(short, long, env, hide_env_values = true)]
    password: Option<Password>,

    /// A Google ID token to exchange when there is no stored session
    #[arg(short, long, env, hide_env_values = true, conflicts_with = "email")]
    google_id_token: Option<ProviderAssertion>,

    /// The local file used to persist the session
    #[arg(short = 'f', long, env, default_value = ".session.json")]
    session_file: PathBuf,
}

impl Opts {
    fn sign_in_request(&self) -> Option<SignInRequest> {
        if let Some(assertion) = &self.google_id_token {
            return Some(SignInRequest::Provider {
                provider: IdentityProvider::Google,
                assertion: assertion.clone(),
            });
        }

        match (&self.email, &self.password) {
            (Some(email), Some(password)) => Some(SignInRequest::Credentials {
                email: email.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let exchange = BackendExchangeService::new(
        reqwest::Client::new(),
        BackendEndpoints::new(opts.backend_url.clone())?,
        TokenLifetimeConfig::default(),
    );
    let store = FileSessionStore::open(opts.session_file.clone()).await?;

    let keeper = SessionKeeper::start(
        Arc::new(store),
        Arc::new(exchange),
        RefreshConfig::default(),
        |reason: SignOutReason| tracing::warn!(?reason, "signed out, sign in again to continue"),
    );

    if !keeper.session().is_signed_in() {
        let request = opts
            .sign_in_request()
            .ok_or_else(|| color_eyre::eyre::eyre!("no stored session and no sign-in details"))?;
        let identity = keeper.sign_in(&request).await?;
        tracing::info!(
            user.id = identity.id,
            user.name = %identity.display_name,
            user.role = ?identity.role,
            "signed in"
        );
    }

    let buffer = Duration::from_secs(120);
    let mut interval = time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;

        if let Some(outcome) = keeper.revalidate().await {
            tracing::info!(?outcome, "revalidated session");
        }

        let session = keeper.session();
        let tokens = match (&session.tokens, session.error) {
            (Some(tokens), None) => tokens,
            (_, error) => {
                tracing::error!(?error, "no usable session");
                break;
            }
        };

        let now = System.now();
        let status = tokens.token_status_at(now, buffer);
        let expiry = tokens.effective_expiry().as_millis();
        let until_expired = tokens.until_expired_at(now).as_secs();
        match status {
            TokenStatus::Fresh => {
                tracing::debug!(?status, expiry, until_expired, "pulled token")
            }
            TokenStatus::Stale => {
                tracing::warn!(?status, expiry, until_expired, "pulled token")
            }
            TokenStatus::Expired => {
                tracing::error!(?status, expiry, until_expired, "pulled token")
            }
        }
    }

    keeper.shutdown();
    Ok(())
}
