//! Background acquisition and refresh of the shared [`Credential`].
//!
//! The [`TokenManager`] moves through the states `Idle → Acquiring → Active ⇄ Refreshing`
//! and ends in either `Stopped` (explicit shutdown) or `Failed` (retry budget exhausted or the
//! last good credential expired). Each transition publishes a new snapshot over a
//! [`watch`] channel, so readers always see either the old or the new credential, never a mix.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use backon::{BackoffBuilder, ConstantBuilder, ExponentialBuilder, Retryable};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{AuthError, Authenticator, ClientCredentials, Credential};
use crate::error::{Error, Result};

/// Lifecycle state of the shared credential.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TokenState {
    /// Not started yet.
    Idle,
    /// Obtaining the first credential.
    Acquiring,
    /// A valid credential is available.
    Active,
    /// A refresh is in flight; the previous credential is served until it expires.
    Refreshing,
    /// No credential could be obtained; the run must abort.
    Failed,
    /// Shut down after the run completed.
    Stopped,
}

/// How retry delays grow between attempts.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// Double the delay after every attempt, from `min_delay` up to `max_delay`.
    #[default]
    Exponential,
    /// Wait `min_delay` between all attempts.
    Fixed,
}

/// Retry behavior for token acquisition and refresh.
///
/// Used in: [`AuthConfig::retry`](crate::config::AuthConfig::retry)
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total number of attempts, the first one included.
    pub max_attempts: usize,
    /// Growth of the delay between attempts.
    pub backoff: BackoffStrategy,
    /// Delay before the first retry.
    #[serde(with = "humantime_serde")]
    pub min_delay: Duration,
    /// Upper bound of the delay for exponential backoff.
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Randomize delays to avoid synchronized retries.
    pub jitter: bool,
    /// HTTP status codes of the token endpoint that warrant another attempt.
    pub retryable_status_codes: Vec<u16>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: BackoffStrategy::Exponential,
            min_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            jitter: true,
            retryable_status_codes: vec![408, 429, 500, 502, 503, 504],
        }
    }
}

impl RetryPolicy {
    /// Builds the sequence of delays between attempts.
    pub fn backoff(&self) -> Box<dyn Iterator<Item = Duration> + Send + Sync> {
        let retries = self.max_attempts.saturating_sub(1);
        match self.backoff {
            BackoffStrategy::Exponential => {
                let mut builder = ExponentialBuilder::new()
                    .with_min_delay(self.min_delay)
                    .with_max_delay(self.max_delay)
                    .with_max_times(retries);
                if self.jitter {
                    builder = builder.with_jitter();
                }
                Box::new(builder.build())
            }
            BackoffStrategy::Fixed => {
                let mut builder = ConstantBuilder::new()
                    .with_delay(self.min_delay)
                    .with_max_times(retries);
                if self.jitter {
                    builder = builder.with_jitter();
                }
                Box::new(builder.build())
            }
        }
    }
}

/// Configuration of the [`TokenManager`].
///
/// Derived from [`AuthConfig::token_settings`](crate::config::AuthConfig::token_settings).
#[derive(Clone, Debug, PartialEq)]
pub struct TokenSettings {
    /// Upper bound for a single acquisition or refresh attempt.
    pub timeout: Duration,
    /// Fixed refresh interval, overriding the one derived from the token lifetime.
    pub refresh_interval: Option<Duration>,
    /// Retry behavior of every acquisition and refresh.
    pub retry: RetryPolicy,
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            refresh_interval: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Clone, Debug)]
struct Snapshot {
    state: TokenState,
    credential: Option<Arc<Credential>>,
    /// Attempts and reason of the failure that moved the manager to `Failed`.
    failure: Option<(usize, String)>,
}

/// The snapshot's credential, if it may still be sent to the catalog.
fn usable(snapshot: &Snapshot) -> Option<&Arc<Credential>> {
    match snapshot.state {
        TokenState::Active | TokenState::Refreshing => snapshot
            .credential
            .as_ref()
            .filter(|credential| !credential.is_expired()),
        _ => None,
    }
}

/// Read-only access to the current credential snapshot.
///
/// Cloning is cheap; every worker holds its own reader.
#[derive(Clone, Debug)]
pub struct CredentialReader {
    receiver: watch::Receiver<Snapshot>,
}

impl CredentialReader {
    /// Returns the current credential, or `None` if none is available.
    ///
    /// During a refresh this keeps returning the last known-good credential until it expires.
    pub fn current(&self) -> Option<Arc<Credential>> {
        usable(&self.receiver.borrow()).cloned()
    }

    /// Waits until a credential is usable or the manager can no longer provide one.
    ///
    /// Returns `None` if the manager is idle, failed, or stopped.
    pub async fn wait_current(&mut self) -> Option<Arc<Credential>> {
        let settled = self
            .receiver
            .wait_for(|snapshot| match snapshot.state {
                TokenState::Acquiring => false,
                TokenState::Active | TokenState::Refreshing => usable(snapshot).is_some(),
                TokenState::Idle | TokenState::Failed | TokenState::Stopped => true,
            })
            .await
            .is_ok();

        if settled { self.current() } else { None }
    }

    /// The current lifecycle state.
    pub fn state(&self) -> TokenState {
        self.receiver.borrow().state
    }

    /// Returns why the manager failed, once it is `Failed`.
    pub fn failure(&self) -> Option<Error> {
        let snapshot = self.receiver.borrow();
        let (attempts, reason) = snapshot.failure.clone()?;
        Some(Error::AuthenticationExhausted { attempts, reason })
    }
}

/// Owns the shared credential and keeps it fresh.
#[derive(Debug)]
pub struct TokenManager {
    authenticator: Arc<dyn Authenticator>,
    client: ClientCredentials,
    settings: TokenSettings,
    snapshot: watch::Sender<Snapshot>,
}

impl TokenManager {
    /// Creates an idle manager.
    pub fn new(
        authenticator: Arc<dyn Authenticator>,
        client: ClientCredentials,
        settings: TokenSettings,
    ) -> Self {
        let (snapshot, _) = watch::channel(Snapshot {
            state: TokenState::Idle,
            credential: None,
            failure: None,
        });

        Self {
            authenticator,
            client,
            settings,
            snapshot,
        }
    }

    /// Returns a reader observing this manager's credential.
    pub fn reader(&self) -> CredentialReader {
        CredentialReader {
            receiver: self.snapshot.subscribe(),
        }
    }

    /// Acquires the first credential and spawns the background refresh task.
    ///
    /// If the credential later becomes unavailable, `abort` is cancelled so all workers stop.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AuthenticationExhausted`] if no credential could be acquired within the
    /// retry budget. The manager is `Failed` in that case.
    pub async fn start(self, abort: CancellationToken) -> Result<TokenHandle> {
        self.transition(TokenState::Acquiring);

        let acquired = self
            .fetch("acquire", || self.authenticator.acquire_token(&self.client))
            .await;
        let credential = match acquired {
            Ok(credential) => credential,
            Err(error) => {
                tracing::error!(%error, "failed to acquire access token");
                self.fail(&error);
                return Err(error);
            }
        };

        tracing::info!(
            refresh_interval = ?self.refresh_interval(&credential),
            "access token acquired"
        );
        self.publish(TokenState::Active, Some(Arc::new(credential)));

        let reader = self.reader();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(self.refresh_loop(abort, shutdown.clone()));

        Ok(TokenHandle {
            reader,
            shutdown,
            task,
        })
    }

    async fn refresh_loop(self, abort: CancellationToken, shutdown: CancellationToken) {
        // Cause of the most recent failed refresh, reported if the token then expires.
        let mut last_error = None;

        loop {
            let current = self.snapshot.borrow().credential.clone();
            let Some(current) = current else {
                break;
            };

            let wait = self.next_refresh(&current);
            let sleep = async {
                match wait {
                    Some(wait) => tokio::time::sleep(wait).await,
                    None => std::future::pending().await,
                }
            };

            // Shutdown is only observed between refreshes, so an in-flight refresh always
            // completes before the manager stops.
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = sleep => {}
            }

            if current.is_expired() {
                self.expire(last_error.take(), &abort);
                return;
            }

            let expiry = async {
                match current.expires_at() {
                    Some(expires_at) => tokio::time::sleep_until(expires_at).await,
                    None => std::future::pending().await,
                }
            };

            self.transition(TokenState::Refreshing);
            let refresh = self.fetch("refresh", || {
                self.authenticator.refresh_token(&self.client, &current)
            });
            let refreshed = tokio::select! {
                refreshed = refresh => refreshed,
                _ = expiry => {
                    self.expire(last_error.take(), &abort);
                    return;
                }
            };

            match refreshed {
                Ok(credential) => {
                    tracing::info!("access token refreshed");
                    self.publish(TokenState::Active, Some(Arc::new(credential)));
                    last_error = None;
                }
                Err(error) => {
                    tracing::warn!(%error, "token refresh failed, keeping the current token");
                    self.transition(TokenState::Active);
                    last_error = Some(error);
                }
            }
        }

        self.publish(TokenState::Stopped, None);
        tracing::debug!("token manager stopped");
    }

    /// Gives up on the expired credential and aborts the run.
    fn expire(&self, last_error: Option<Error>, abort: &CancellationToken) {
        let error = last_error.unwrap_or_else(|| Error::AuthenticationExhausted {
            attempts: 0,
            reason: "access token expired before it could be refreshed".into(),
        });
        tracing::error!(%error, "access token expired and could not be refreshed");
        self.fail(&error);
        abort.cancel();
    }

    /// Runs `call` under the configured timeout and retry policy.
    async fn fetch<F, Fut>(&self, operation: &'static str, mut call: F) -> Result<Credential>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Credential, AuthError>>,
    {
        let attempts = AtomicUsize::new(0);
        let timeout = self.settings.timeout;
        let retry = &self.settings.retry;

        let result = (|| {
            attempts.fetch_add(1, Ordering::Relaxed);
            let call = call();
            async move {
                match tokio::time::timeout(timeout, call).await {
                    Ok(result) => result,
                    Err(_) => Err(AuthError::Timeout),
                }
            }
        })
        .retry(retry.backoff())
        .when(|error| error.is_retryable(&retry.retryable_status_codes))
        .notify(|error, delay| {
            tracing::warn!(
                operation,
                attempt = attempts.load(Ordering::Relaxed),
                ?delay,
                %error,
                "token request failed, retrying"
            );
        })
        .await;

        result.map_err(|error| Error::AuthenticationExhausted {
            attempts: attempts.load(Ordering::Relaxed),
            reason: error.to_string(),
        })
    }

    fn refresh_interval(&self, credential: &Credential) -> Option<Duration> {
        self.settings
            .refresh_interval
            .or(credential.refresh_interval())
    }

    /// Time until the next refresh: the refresh interval, but never past the expiry.
    fn next_refresh(&self, credential: &Credential) -> Option<Duration> {
        let until_expiry = credential
            .expires_at()
            .map(|expires_at| expires_at.saturating_duration_since(Instant::now()));

        match (self.refresh_interval(credential), until_expiry) {
            (Some(interval), Some(until_expiry)) => Some(interval.min(until_expiry)),
            (interval, until_expiry) => interval.or(until_expiry),
        }
    }

    fn transition(&self, state: TokenState) {
        tracing::trace!(?state, "token state transition");
        self.snapshot.send_modify(|snapshot| snapshot.state = state);
    }

    fn publish(&self, state: TokenState, credential: Option<Arc<Credential>>) {
        tracing::trace!(?state, "token state transition");
        self.snapshot.send_replace(Snapshot {
            state,
            credential,
            failure: None,
        });
    }

    fn fail(&self, error: &Error) {
        let failure = match error {
            Error::AuthenticationExhausted { attempts, reason } => (*attempts, reason.clone()),
            other => (0, other.to_string()),
        };

        tracing::trace!(state = ?TokenState::Failed, "token state transition");
        self.snapshot.send_replace(Snapshot {
            state: TokenState::Failed,
            credential: None,
            failure: Some(failure),
        });
    }
}

/// Handle to a running [`TokenManager`].
#[derive(Debug)]
pub struct TokenHandle {
    reader: CredentialReader,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl TokenHandle {
    /// Returns a reader observing the managed credential.
    pub fn reader(&self) -> CredentialReader {
        self.reader.clone()
    }

    /// Stops refreshing and invalidates the credential.
    ///
    /// Waits for an in-flight refresh to finish first.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(error) = self.task.await {
            tracing::error!(%error, "token refresh task panicked");
        }
    }
}
