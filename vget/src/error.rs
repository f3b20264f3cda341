//! Operation error taxonomy shared across the crate.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, OperationError>;

/// Upper bound on diagnostic text carried inside errors and reports.
pub const DIAGNOSTIC_SNIPPET_CHARS: usize = 200;

/// Every failure the orchestrator can produce.
///
/// Retryable kinds (`Network`, `Proxy`, `Stalled`) are absorbed by the
/// supervisor's retry loop and only surface wrapped in `MaxRetriesExceeded`.
/// `Authentication` is handled once by the auth recovery coordinator; the
/// remaining kinds are terminal and reach the caller as-is.
#[derive(Debug, Error)]
pub enum OperationError {
    /// Transient connectivity or upstream server failure.
    #[error("network failure: {0}")]
    Network(String),

    /// Proxy-specific connectivity failure.
    #[error("proxy failure: {0}")]
    Proxy(String),

    /// The child produced no output within the stall window.
    #[error("no output for {idle:?}, attempt considered stalled")]
    Stalled { idle: Duration },

    /// The upstream source demands fresh credentials.
    #[error("authentication required: {0}")]
    Authentication(String),

    /// Unrecognized failure, never retried.
    #[error("{0}")]
    Fatal(String),

    /// The circuit breaker for this target is open; nothing was spawned.
    #[error("circuit open for {target}, retry in {}s", .retry_after.as_secs())]
    CircuitOpen {
        target: String,
        retry_after: Duration,
    },

    /// The retry budget is exhausted; carries the last underlying failure.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    MaxRetriesExceeded {
        attempts: u32,
        #[source]
        last: Box<OperationError>,
    },

    /// The stream listing is empty or unusable after classification.
    #[error("no usable formats in stream listing")]
    NoUsableFormats,

    /// The extractor emitted a listing this crate cannot decode.
    #[error("malformed stream listing: {0}")]
    Listing(String),

    /// Filesystem failure while staging or finalizing artifacts.
    #[error("io failure at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl OperationError {
    /// Whether the supervisor's internal retry loop may absorb this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Proxy(_) | Self::Stalled { .. }
        )
    }

    /// Whether this failure should count against the target's circuit breaker.
    ///
    /// Only transport-class failures do: a removed video or an account block
    /// says nothing about the health of the host.
    pub fn counts_against_breaker(&self) -> bool {
        self.is_retryable()
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Truncate diagnostic text to [`DIAGNOSTIC_SNIPPET_CHARS`] characters.
///
/// Truncation happens on character boundaries; an ellipsis marks cut text so
/// logs never mislead about completeness.
pub fn snippet(text: &str) -> String {
    let text = text.trim();
    if text.chars().count() <= DIAGNOSTIC_SNIPPET_CHARS {
        return text.to_string();
    }
    let mut out: String = text.chars().take(DIAGNOSTIC_SNIPPET_CHARS).collect();
    out.push('…');
    out
}
