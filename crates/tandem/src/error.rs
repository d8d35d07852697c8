//! Error types for the harness.
//!
//! Setup and teardown failures surface synchronously to the caller that owns
//! the test class. Nothing in this crate retries.

use std::io;

/// Result alias used across the harness.
pub type Result<T, E = HarnessError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    // ===== Configuration =====
    #[error("Unknown topology kind: {0}")]
    UnknownTopology(String),
    #[error("Missing required fixture: {0}")]
    MissingFixture(&'static str),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Failed to load configuration '{path}': {reason}")]
    ConfigFile { path: String, reason: String },

    // ===== Startup =====
    #[error("Failed to bind {what}: {source}")]
    Bind {
        what: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to start background runtime for {0}")]
    Runtime(String),
    #[error("TLS setup failed: {0}")]
    Tls(String),

    // ===== Protocol =====
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Invalid spec {0}")]
    InvalidSpec(String),

    // ===== Misuse =====
    #[error("{0} was already shut down")]
    AlreadyShutdown(String),
    #[error("Embedded applications are not enabled for this harness")]
    AppsDisabled,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl HarnessError {
    /// Configuration errors abort the whole test class.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            HarnessError::UnknownTopology(_)
                | HarnessError::MissingFixture(_)
                | HarnessError::InvalidConfig(_)
                | HarnessError::ConfigFile { .. }
        )
    }

    pub(crate) fn protocol(message: impl std::fmt::Display) -> Self {
        HarnessError::Protocol(message.to_string())
    }

    pub(crate) fn tls(message: impl std::fmt::Display) -> Self {
        HarnessError::Tls(message.to_string())
    }
}

impl From<rustls::Error> for HarnessError {
    fn from(err: rustls::Error) -> Self {
        HarnessError::Tls(err.to_string())
    }
}

impl From<hyper::Error> for HarnessError {
    fn from(err: hyper::Error) -> Self {
        HarnessError::Protocol(err.to_string())
    }
}
