//! Access credentials for the catalog service.
//!
//! An [`Authenticator`] talks to the identity endpoint; the [`TokenManager`] owns the resulting
//! [`Credential`], refreshes it in the background and hands read-only snapshots to workers
//! through a [`CredentialReader`]. Workers never call the authenticator themselves.

use std::fmt;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio::time::Instant;

mod manager;
pub mod oauth;

pub use manager::{
    BackoffStrategy, CredentialReader, RetryPolicy, TokenHandle, TokenManager, TokenSettings,
    TokenState,
};

/// An access token and its lifetime.
///
/// Instances are immutable. A refresh produces a new credential that replaces the old one as a
/// whole.
#[derive(Clone)]
pub struct Credential {
    token: String,
    expires_at: Option<Instant>,
    refresh_interval: Option<Duration>,
}

impl Credential {
    /// Creates a credential that expires at `expires_at` and should be refreshed every
    /// `refresh_interval`.
    pub fn new(token: impl Into<String>, expires_at: Instant, refresh_interval: Duration) -> Self {
        Self {
            token: token.into(),
            expires_at: Some(expires_at),
            refresh_interval: Some(refresh_interval),
        }
    }

    /// Creates a credential that never expires and is never refreshed.
    pub fn fixed(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            expires_at: None,
            refresh_interval: None,
        }
    }

    /// The bearer token.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// When the token stops being accepted, if ever.
    pub fn expires_at(&self) -> Option<Instant> {
        self.expires_at
    }

    /// How often the token should be refreshed, if at all.
    pub fn refresh_interval(&self) -> Option<Duration> {
        self.refresh_interval
    }

    /// Returns `true` once the expiry has passed.
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .is_some_and(|expires_at| expires_at <= Instant::now())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"[redacted]")
            .field("expires_at", &self.expires_at)
            .field("refresh_interval", &self.refresh_interval)
            .finish()
    }
}

/// Client identity presented to the [`Authenticator`].
#[derive(Clone, Debug)]
pub struct ClientCredentials {
    /// The OAuth client ID.
    pub client_id: String,
    /// The OAuth client secret.
    pub client_secret: SecretString,
    /// Optional scope to request.
    pub scope: Option<String>,
}

impl ClientCredentials {
    /// Creates client credentials without a scope.
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: SecretString::from(client_secret.into()),
            scope: None,
        }
    }

    pub(crate) fn secret(&self) -> &str {
        self.client_secret.expose_secret()
    }
}

/// Failure reported by an [`Authenticator`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum AuthError {
    /// The identity endpoint answered with an error status.
    #[error("token endpoint returned {code}: {message}")]
    Status {
        /// The HTTP status code.
        code: u16,
        /// The response body, for diagnostics.
        message: String,
    },
    /// The attempt did not complete within the configured timeout.
    #[error("token request timed out")]
    Timeout,
    /// The request could not be sent or the response not read.
    #[error("token request failed: {0}")]
    Transport(String),
    /// The endpoint answered, but not with a usable token.
    #[error("invalid token response: {0}")]
    InvalidResponse(String),
}

impl AuthError {
    /// Returns `true` if another attempt may succeed.
    ///
    /// Timeouts and transport errors are always retried; error statuses only if their code is
    /// listed in `retryable_codes`.
    pub fn is_retryable(&self, retryable_codes: &[u16]) -> bool {
        match self {
            AuthError::Status { code, .. } => retryable_codes.contains(code),
            AuthError::Timeout | AuthError::Transport(_) => true,
            AuthError::InvalidResponse(_) => false,
        }
    }
}

/// The identity endpoint issuing access tokens.
#[async_trait::async_trait]
pub trait Authenticator: fmt::Debug + Send + Sync + 'static {
    /// Obtains a fresh credential for `client`.
    async fn acquire_token(&self, client: &ClientCredentials) -> Result<Credential, AuthError>;

    /// Replaces `current` with a fresh credential.
    ///
    /// Defaults to acquiring a new token with the client's credentials.
    async fn refresh_token(
        &self,
        client: &ClientCredentials,
        current: &Credential,
    ) -> Result<Credential, AuthError> {
        let _ = current;
        self.acquire_token(client).await
    }
}

/// An [`Authenticator`] handing out a preconfigured bearer token.
#[derive(Debug)]
pub struct StaticAuthenticator {
    token: SecretString,
}

impl StaticAuthenticator {
    /// Creates an authenticator that always returns `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: SecretString::from(token.into()),
        }
    }
}

#[async_trait::async_trait]
impl Authenticator for StaticAuthenticator {
    async fn acquire_token(&self, _client: &ClientCredentials) -> Result<Credential, AuthError> {
        Ok(Credential::fixed(self.token.expose_secret()))
    }
}
