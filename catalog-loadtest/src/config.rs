//! Configuration for the load-testing harness.
//!
//! Configuration can be loaded from multiple sources with the following precedence (highest to
//! lowest):
//!
//! 1. Environment variables (prefixed with `CLT__`)
//! 2. YAML configuration file (specified via `-c` or `--config` flag)
//! 3. Defaults
//!
//! See [`Config`] for a description of all sections.
//!
//! # Environment Variables
//!
//! Environment variables use `CLT__` as a prefix and double underscores (`__`) to denote nested
//! configuration structures. For example:
//!
//! - `CLT__CATALOG__BASE_URL=http://localhost:8181` sets the catalog service
//! - `CLT__AUTH__CLIENT_SECRET=s3cr3t` sets the OAuth client secret
//! - `CLT__DATASET__TREE_DEPTH=6` sets the depth of the namespace tree
//!
//! # YAML Configuration File
//!
//! ```yaml
//! catalog:
//!   base_url: http://localhost:8181
//!   realm: POLARIS
//! auth:
//!   client_id: root
//!   client_secret: s3cr3t
//! dataset:
//!   tree_width: 2
//!   tree_depth: 4
//! workload:
//!   phases:
//!     - { name: create namespaces, action: create, kind: namespace, concurrency: 8 }
//!     - { name: verify namespaces, action: verify, kind: namespace, concurrency: 32 }
//! ```

use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use figment::providers::{Env, Format, Serialized, Yaml};
use secrecy::{CloneableSecret, ExposeSecret, SecretBox, SerializableSecret, zeroize::Zeroize};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

use crate::auth::oauth::DEFAULT_TOKEN_PATH;
use crate::auth::{RetryPolicy, TokenSettings};
use crate::catalog::http::DEFAULT_REALM_HEADER;
use crate::dataset::{DatasetWalker, EntityKind};
use crate::error::Error;
use crate::naming::DEFAULT_CATALOG_PREFIX;
use crate::topology::{ShapeParameters, Topology};
use crate::workload::{ActionKind, Phase};

/// Environment variable prefix for all configuration options.
const ENV_PREFIX: &str = "CLT__";

/// Newtype around `String` that may protect against accidental
/// logging of secrets in our configuration struct. Use with
/// [`secrecy::SecretBox`].
#[derive(Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigSecret(String);

impl ConfigSecret {
    /// The secret value.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for ConfigSecret {
    fn from(str: &str) -> Self {
        ConfigSecret(str.to_string())
    }
}

impl fmt::Debug for ConfigSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        write!(f, "[redacted]")
    }
}

impl CloneableSecret for ConfigSecret {}
impl SerializableSecret for ConfigSecret {}
impl Zeroize for ConfigSecret {
    fn zeroize(&mut self) {
        self.0.zeroize();
    }
}

/// The catalog service under test.
///
/// Used in: [`Config::catalog`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Base URL of the service, without the `api/...` path.
    ///
    /// # Environment Variable
    ///
    /// `CLT__CATALOG__BASE_URL`
    pub base_url: String,

    /// Realm sent with every request, if the service is multi-tenant.
    pub realm: Option<String>,

    /// Name of the header carrying [`realm`](Self::realm).
    ///
    /// # Default
    ///
    /// `Polaris-Realm`
    pub realm_header: String,

    /// Prefix of generated catalog names.
    ///
    /// # Default
    ///
    /// `C`, producing `C_0`, `C_1`, ...
    pub catalog_prefix: String,

    /// Upper bound for a single catalog action. Exceeding it counts as a failed action.
    ///
    /// # Default
    ///
    /// `30s`
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Base location for the storage of created catalogs.
    pub storage_location: String,

    /// Run against an in-memory catalog prepopulated with the dataset instead of the service.
    pub dry_run: bool,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8181".to_owned(),
            realm: None,
            realm_header: DEFAULT_REALM_HEADER.to_owned(),
            catalog_prefix: DEFAULT_CATALOG_PREFIX.to_owned(),
            request_timeout: Duration::from_secs(30),
            storage_location: "file:///tmp/catalog-loadtest".to_owned(),
            dry_run: false,
        }
    }
}

/// Access credentials and their lifecycle.
///
/// Either a static [`token`](Self::token) or a client ID and secret for the OAuth
/// client-credentials flow must be configured.
///
/// Used in: [`Config::auth`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    /// OAuth client ID.
    pub client_id: String,

    /// OAuth client secret. Redacted from logs.
    ///
    /// # Environment Variable
    ///
    /// `CLT__AUTH__CLIENT_SECRET`
    pub client_secret: Option<SecretBox<ConfigSecret>>,

    /// A bearer token used as is. It never expires and is never refreshed.
    pub token: Option<SecretBox<ConfigSecret>>,

    /// The token endpoint.
    ///
    /// # Default
    ///
    /// `<catalog.base_url>/api/catalog/v1/oauth/tokens`
    pub token_url: Option<String>,

    /// Scope requested with every token.
    pub scope: Option<String>,

    /// Refresh interval overriding the one derived from the token lifetime.
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Option<Duration>,

    /// How long before its expiry a token is refreshed.
    ///
    /// # Default
    ///
    /// `60s`
    #[serde(with = "humantime_serde")]
    pub refresh_buffer: Duration,

    /// Upper bound for a single token request.
    ///
    /// # Default
    ///
    /// `15s`
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Retries of failed token requests.
    pub retry: RetryPolicy,
}

impl AuthConfig {
    /// Settings of the [`TokenManager`](crate::auth::TokenManager).
    pub fn token_settings(&self) -> TokenSettings {
        TokenSettings {
            timeout: self.timeout,
            refresh_interval: self.refresh_interval,
            retry: self.retry.clone(),
        }
    }

    /// The token endpoint, derived from `base_url` unless configured explicitly.
    pub fn token_url(&self, base_url: &str) -> String {
        match &self.token_url {
            Some(url) => url.clone(),
            None => format!("{}/{DEFAULT_TOKEN_PATH}", base_url.trim_end_matches('/')),
        }
    }

    /// The static bearer token, if configured.
    pub fn static_token(&self) -> Option<&str> {
        self.token.as_ref().map(|token| token.expose_secret().as_str())
    }

    /// The client secret, or an empty string.
    pub fn client_secret(&self) -> &str {
        match &self.client_secret {
            Some(secret) => secret.expose_secret().as_str(),
            None => "",
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        let settings = TokenSettings::default();
        Self {
            client_id: String::new(),
            client_secret: None,
            token: None,
            token_url: None,
            scope: None,
            refresh_interval: settings.refresh_interval,
            refresh_buffer: Duration::from_secs(60),
            timeout: settings.timeout,
            retry: settings.retry,
        }
    }
}

/// One phase of the workload.
///
/// Used in: [`WorkloadConfig::phases`]
#[derive(Debug, Deserialize, Serialize)]
pub struct PhaseConfig {
    /// Name for identification in logs and reports.
    pub name: String,
    /// The action applied to every entity.
    pub action: ActionKind,
    /// The kind of entity visited.
    pub kind: EntityKind,
    /// Number of concurrent workers. Defaults to [`WorkloadConfig::concurrency`].
    #[serde(default)]
    pub concurrency: Option<usize>,
    /// Number of actions. Defaults to the number of entities of `kind`.
    #[serde(default)]
    pub count: Option<u64>,
    /// Actions per second across all workers. Unpaced if absent.
    #[serde(default)]
    pub rate: Option<f64>,
}

/// The phases to run, in order.
///
/// Used in: [`Config::workload`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkloadConfig {
    /// Default number of workers per phase.
    ///
    /// # Default
    ///
    /// `8`
    pub concurrency: usize,

    /// The phases. Empty means verifying catalogs, namespaces, tables and views in that order.
    pub phases: Vec<PhaseConfig>,
}

impl WorkloadConfig {
    /// Resolves the configured phases against the dataset.
    pub fn phases(&self, walker: &DatasetWalker) -> crate::error::Result<Vec<Phase>> {
        if self.phases.is_empty() {
            return Phase::default_pipeline(walker, self.concurrency);
        }

        self.phases
            .iter()
            .map(|phase| {
                let mut builder = Phase::builder(&phase.name, phase.action, phase.kind)
                    .concurrency(phase.concurrency.unwrap_or(self.concurrency));
                if let Some(count) = phase.count {
                    builder = builder.count(count);
                }
                if let Some(rate) = phase.rate {
                    builder = builder.rate(rate);
                }
                builder.build(walker)
            })
            .collect()
    }
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            phases: Vec::new(),
        }
    }
}

/// Log output format.
///
/// Controls how log messages are formatted. The format can be explicitly specified or
/// auto-detected based on whether output is to a TTY.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect the best format.
    ///
    /// This chooses [`LogFormat::Pretty`] for TTY, otherwise [`LogFormat::Simplified`].
    Auto,

    /// Pretty printing with colors.
    Pretty,

    /// Simplified plain text output.
    Simplified,

    /// Dump out JSON lines.
    Json,
}

mod display_fromstr {
    pub fn serialize<T, S>(value: &T, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
        T: std::fmt::Display,
    {
        serializer.collect_str(&value)
    }

    pub fn deserialize<'de, T, D>(deserializer: D) -> Result<T, D::Error>
    where
        D: serde::Deserializer<'de>,
        T: std::str::FromStr,
        <T as std::str::FromStr>::Err: std::fmt::Display,
    {
        use serde::Deserialize;
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Logging configuration.
///
/// Logs are always written to stderr; the report goes to stdout.
///
/// Used in: [`Config::logging`]
#[derive(Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct Logging {
    /// Minimum log level to output, unless `RUST_LOG` is set.
    ///
    /// # Default
    ///
    /// `INFO`
    ///
    /// # Environment Variable
    ///
    /// `CLT__LOGGING__LEVEL`
    #[serde(with = "display_fromstr")]
    pub level: LevelFilter,

    /// Log output format. See [`LogFormat`] for available options.
    ///
    /// # Default
    ///
    /// `Auto` (pretty for TTY, simplified otherwise)
    pub format: LogFormat,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
        }
    }
}

/// Harness configuration.
#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// The catalog service under test.
    pub catalog: CatalogConfig,
    /// Access credentials.
    pub auth: AuthConfig,
    /// Shape of the generated dataset.
    pub dataset: ShapeParameters,
    /// The phases to run.
    pub workload: WorkloadConfig,
    /// Logging configuration.
    pub logging: Logging,
}

impl Config {
    /// Loads configuration from the provided arguments.
    ///
    /// Configuration is merged in the following order (later sources override earlier ones):
    /// 1. Default values
    /// 2. YAML configuration file (if provided)
    /// 3. Environment variables (prefixed with `CLT__`)
    ///
    /// The result is not validated yet, see [`validate`](Self::validate).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = figment::Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        Ok(config)
    }

    /// Rejects invalid values before anything runs.
    pub fn validate(&self) -> crate::error::Result<()> {
        Topology::new(&self.dataset)?;

        let catalog = &self.catalog;
        if catalog.catalog_prefix.is_empty() {
            return Err(Error::invalid("catalog.catalog_prefix", "must not be empty"));
        }
        if catalog.request_timeout.is_zero() {
            return Err(Error::invalid("catalog.request_timeout", "must be positive"));
        }
        if !catalog.dry_run && catalog.base_url.is_empty() {
            return Err(Error::invalid("catalog.base_url", "must not be empty"));
        }

        let auth = &self.auth;
        let has_client = !auth.client_id.is_empty() && auth.client_secret.is_some();
        if !catalog.dry_run && auth.token.is_none() && !has_client {
            return Err(Error::invalid(
                "auth",
                "either a token or a client ID and secret are required",
            ));
        }
        if auth.timeout.is_zero() {
            return Err(Error::invalid("auth.timeout", "must be positive"));
        }
        if auth.refresh_interval.is_some_and(|interval| interval.is_zero()) {
            return Err(Error::invalid("auth.refresh_interval", "must be positive"));
        }
        if auth.retry.max_attempts == 0 {
            return Err(Error::invalid("auth.retry.max_attempts", "must be at least 1"));
        }
        if auth.retry.min_delay > auth.retry.max_delay {
            return Err(Error::invalid(
                "auth.retry.min_delay",
                "must not exceed max_delay",
            ));
        }

        if self.workload.concurrency == 0 {
            return Err(Error::invalid("workload.concurrency", "must be at least 1"));
        }
        for phase in &self.workload.phases {
            if phase.concurrency == Some(0) {
                return Err(Error::invalid(
                    "workload.phases.concurrency",
                    format!("phase `{}` needs at least one worker", phase.name),
                ));
            }
            if phase.rate.is_some_and(|rate| !(rate.is_finite() && rate > 0.0)) {
                return Err(Error::invalid(
                    "workload.phases.rate",
                    format!("phase `{}`: rate must be positive", phase.name),
                ));
            }
        }

        Ok(())
    }
}
