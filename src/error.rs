//! Error types shared across the orchestrator.

use thiserror::Error;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, StackError>;

/// Every failure the orchestrator can surface to the operator.
#[derive(Error, Debug)]
pub enum StackError {
    /// Invalid configuration: duplicate names/ports, bad env values, malformed requests.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A process could not be spawned, signalled or tracked.
    #[error("process error: {0}")]
    Process(String),

    /// Transport-level failure talking to a service.
    #[error("network error ({target}): {reason}")]
    Network { target: String, reason: String },

    /// A service answered but the body was not what the contract says.
    #[error("protocol error ({target}): {reason}")]
    Protocol { target: String, reason: String },

    /// A readiness probe exhausted its attempts.
    #[error("{target} not ready after {attempts} attempts")]
    NotReady { target: String, attempts: u32 },

    /// The end-to-end run check failed.
    #[error("verification failed for run {run_id}: {reason}")]
    Verification {
        run_id: String,
        reason: String,
        last_body: Option<String>,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StackError {
    pub fn network(target: impl Into<String>, reason: impl ToString) -> Self {
        Self::Network {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    pub fn protocol(target: impl Into<String>, reason: impl ToString) -> Self {
        Self::Protocol {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    /// Process exit code for this failure. Always non-zero.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Io(_) => 1,
            Self::Configuration(_) => 2,
            Self::Process(_) => 3,
            Self::NotReady { .. } => 4,
            Self::Network { .. } | Self::Protocol { .. } | Self::Verification { .. } => 5,
        }
    }

    /// Last response body captured for diagnostics, if any.
    pub fn last_body(&self) -> Option<&str> {
        match self {
            Self::Verification { last_body, .. } => last_body.as_deref(),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for StackError {
    fn from(err: serde_json::Error) -> Self {
        Self::Configuration(format!("invalid json: {err}"))
    }
}

impl From<toml::de::Error> for StackError {
    fn from(err: toml::de::Error) -> Self {
        Self::Configuration(format!("invalid stack file: {err}"))
    }
}
