//! Log output of the harness.
//!
//! Logs go to stderr so the report on stdout stays machine-readable.

use std::env;
use std::io::IsTerminal;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, prelude::*};

use crate::config::{LogFormat, Logging};

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. See [`parse_rust_log`].
pub fn init_tracing(logging: &Logging) {
    let (level, env_filter) = parse_rust_log(logging.level);

    tracing_subscriber::registry()
        .with(format_layer(resolve_format(logging.format)).with_filter(level))
        .with(env_filter)
        .init();
}

/// Resolves [`LogFormat::Auto`] based on whether stderr is a terminal.
pub fn resolve_format(format: LogFormat) -> LogFormat {
    match format {
        LogFormat::Auto if std::io::stderr().is_terminal() => LogFormat::Pretty,
        LogFormat::Auto => LogFormat::Simplified,
        format => format,
    }
}

fn format_layer(format: LogFormat) -> Box<dyn Layer<Registry> + Send + Sync> {
    let layer = fmt::layer().with_writer(std::io::stderr).with_target(true);
    match format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Simplified | LogFormat::Auto => layer.compact().with_ansi(false).boxed(),
    }
}

/// Returns the level to log at and the per-crate filter.
///
/// A plain level in `RUST_LOG` replaces `default` and keeps the internal per-crate levels. Any
/// other value is used literally as the filter.
pub fn parse_rust_log(default: LevelFilter) -> (LevelFilter, EnvFilter) {
    let level = match env::var(EnvFilter::DEFAULT_ENV) {
        Ok(value) => match value.parse::<LevelFilter>() {
            Ok(level) => level,
            Err(_) => return (LevelFilter::TRACE, EnvFilter::new(value)),
        },
        Err(_) => default,
    };

    // This is the maximum verbosity that will be logged, we filter this down to `level`.
    let env_filter = EnvFilter::new(
        "INFO,\
        hyper=WARN,\
        reqwest=WARN,\
        catalog_loadtest=TRACE,\
        ",
    );

    (level, env_filter)
}
