use thiserror::Error;

/// Errors that abort a load-test run.
///
/// Individual entity actions fail with [`ActionError`](crate::catalog::ActionError) instead,
/// which is tallied in the phase report and never aborts a phase.
#[derive(Debug, Error)]
pub enum Error {
    /// A malformed shape or configuration value, detected before any phase runs.
    #[error("invalid parameter `{name}`: {reason}")]
    InvalidParameter {
        /// The offending parameter.
        name: &'static str,
        /// Why the value was rejected.
        reason: String,
    },

    /// The requested tree shape or caps cannot be represented.
    #[error("topology overflow: {0}")]
    TopologyOverflow(String),

    /// No credential could be acquired or kept fresh within the retry budget.
    #[error("authentication exhausted after {attempts} attempt(s): {reason}")]
    AuthenticationExhausted {
        /// Number of attempts made in the last acquisition or refresh cycle.
        attempts: usize,
        /// The last error reported by the authentication endpoint.
        reason: String,
    },

    /// The run was cancelled from the outside, for example by Ctrl-C.
    #[error("interrupted")]
    Interrupted,

    /// The run was aborted while the given phase was executing.
    #[error("run aborted in phase `{phase}`: {source}")]
    Aborted {
        /// Name of the phase that was running when the abort happened.
        phase: String,
        /// The underlying cause.
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }
}

/// A convenience alias that defaults our [`Error`] type.
pub type Result<T, E = Error> = std::result::Result<T, E>;
