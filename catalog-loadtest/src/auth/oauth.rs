//! OAuth2 client-credentials flow against the catalog's token endpoint.

use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use tokio::time::Instant;

use super::{AuthError, Authenticator, ClientCredentials, Credential};

/// Token lifetime assumed when the endpoint does not report `expires_in`.
const DEFAULT_EXPIRES_IN: Duration = Duration::from_secs(3600);

/// Lower bound of the derived refresh interval.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// Path of the token endpoint relative to the service's base URL.
pub const DEFAULT_TOKEN_PATH: &str = "api/catalog/v1/oauth/tokens";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<serde_json::Value>,
}

/// Obtains tokens with the `client_credentials` grant.
///
/// Tokens are refreshed `refresh_buffer` before they expire, by requesting a new one.
#[derive(Debug)]
pub struct OAuthAuthenticator {
    client: reqwest::Client,
    token_url: String,
    realm: Option<(String, String)>,
    refresh_buffer: Duration,
}

impl OAuthAuthenticator {
    /// Creates an authenticator posting to `token_url`.
    pub fn new(client: reqwest::Client, token_url: impl Into<String>) -> Self {
        Self {
            client,
            token_url: token_url.into(),
            realm: None,
            refresh_buffer: Duration::from_secs(60),
        }
    }

    /// Sends `realm` in the header `header` with every token request.
    pub fn with_realm(mut self, header: impl Into<String>, realm: impl Into<String>) -> Self {
        self.realm = Some((header.into(), realm.into()));
        self
    }

    /// How long before the expiry a token is refreshed.
    pub fn with_refresh_buffer(mut self, refresh_buffer: Duration) -> Self {
        self.refresh_buffer = refresh_buffer;
        self
    }

    /// Turns the endpoint's answer into a [`Credential`].
    ///
    /// The lifetime is never shorter than the refresh buffer, and the refresh is scheduled one
    /// buffer ahead of the expiry.
    fn credential(&self, response: TokenResponse) -> Result<Credential, AuthError> {
        let token = response
            .access_token
            .filter(|token| !token.is_empty())
            .ok_or_else(|| AuthError::InvalidResponse("missing access_token".into()))?;

        let ttl = parse_expires_in(response.expires_in.as_ref())
            .unwrap_or(DEFAULT_EXPIRES_IN)
            .max(self.refresh_buffer);
        let refresh_interval = ttl
            .saturating_sub(self.refresh_buffer)
            .max(MIN_REFRESH_INTERVAL);

        Ok(Credential::new(token, Instant::now() + ttl, refresh_interval))
    }
}

/// Accepts `expires_in` as a number or a numeric string.
fn parse_expires_in(value: Option<&serde_json::Value>) -> Option<Duration> {
    let seconds = match value? {
        serde_json::Value::Number(number) => number.as_f64()?,
        serde_json::Value::String(string) => string.trim().parse().ok()?,
        _ => return None,
    };
    Duration::try_from_secs_f64(seconds).ok()
}

#[async_trait::async_trait]
impl Authenticator for OAuthAuthenticator {
    #[tracing::instrument(level = "debug", skip_all, fields(client_id = %client.client_id))]
    async fn acquire_token(&self, client: &ClientCredentials) -> Result<Credential, AuthError> {
        let mut form = vec![
            ("grant_type", "client_credentials"),
            ("client_id", client.client_id.as_str()),
            ("client_secret", client.secret()),
        ];
        if let Some(scope) = &client.scope {
            form.push(("scope", scope.as_str()));
        }

        let mut request = self.client.post(&self.token_url).form(&form);
        if let Some((header, realm)) = &self.realm {
            request = request.header(header.as_str(), realm.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|error| AuthError::Transport(error.to_string()))?;

        let status = response.status();
        if status != StatusCode::OK {
            let message = response.text().await.unwrap_or_default();
            return Err(AuthError::Status {
                code: status.as_u16(),
                message,
            });
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|error| AuthError::InvalidResponse(error.to_string()))?;

        self.credential(body)
    }
}
