//! Error Taxonomy
//!
//! Every failure the pipeline can surface to a caller is a [`RelayError`].
//! Each variant maps to an [`ErrorKind`] whose string form is what clients
//! see as the `errorKind` of a terminal error chunk.
//!
//! # Propagation
//!
//! | Kind | Surfaced | Sandbox |
//! |------|----------|---------|
//! | `SpawnError` | error chunk | cleaned immediately |
//! | `Timeout` | error chunk | cleaned immediately |
//! | `KilledByCancellation` | nothing (nobody is listening) | configured policy |
//! | `NonZeroExit` / `ProviderError` | error chunk after any partial output | configured delay |
//! | `ResourceExhausted` | error chunk, before any spawn | nothing to clean |

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable, client-visible classification of a failure
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The external tool could not be started
    SpawnError,
    /// The subprocess exceeded its time budget
    Timeout,
    /// The consumer went away and the subprocess was terminated
    KilledByCancellation,
    /// The tool exited with a failure status
    NonZeroExit,
    /// The tool reported an error or produced only malformed output
    ProviderError,
    /// No sandbox could be allocated
    ResourceExhausted,
}

impl ErrorKind {
    /// Wire name of this kind
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SpawnError => "spawn_error",
            Self::Timeout => "timeout",
            Self::KilledByCancellation => "killed_by_cancellation",
            Self::NonZeroExit => "non_zero_exit",
            Self::ProviderError => "provider_error",
            Self::ResourceExhausted => "resource_exhausted",
        }
    }

    /// Whether a sandbox touched by this failure must be cleaned right away
    /// instead of following the configured delay
    #[must_use]
    pub fn forces_immediate_cleanup(&self) -> bool {
        matches!(self, Self::SpawnError | Self::Timeout)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the relay pipeline
#[derive(Debug, Error)]
pub enum RelayError {
    /// The external tool is missing or could not be started
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        /// Program that was being started
        program: String,
        /// Underlying OS error
        #[source]
        source: std::io::Error,
    },

    /// The subprocess ran longer than allowed and was killed
    #[error("subprocess timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The consumer cancelled the request
    #[error("subprocess terminated because the client went away")]
    KilledByCancellation,

    /// The tool exited with a failure status
    #[error("{message}")]
    NonZeroExit {
        /// Exit code, if the process exited normally
        code: Option<i32>,
        /// Tool diagnostics (stderr tail) or a generic description
        message: String,
    },

    /// The tool reported a failure inside its own output
    #[error("{0}")]
    Provider(String),

    /// No sandbox directory could be created
    #[error("could not allocate sandbox: {0}")]
    ResourceExhausted(#[source] std::io::Error),
}

impl RelayError {
    /// Classification of this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Spawn { .. } => ErrorKind::SpawnError,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::KilledByCancellation => ErrorKind::KilledByCancellation,
            Self::NonZeroExit { .. } => ErrorKind::NonZeroExit,
            Self::Provider(_) => ErrorKind::ProviderError,
            Self::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
        }
    }

    /// Build a non-zero-exit error from an exit code and captured stderr
    #[must_use]
    pub fn non_zero_exit(code: Option<i32>, stderr: &str) -> Self {
        let stderr = stderr.trim();
        let message = if stderr.is_empty() {
            match code {
                Some(code) => format!("tool exited with code {code}"),
                None => "tool was terminated by a signal".to_string(),
            }
        } else {
            stderr.to_string()
        };
        Self::NonZeroExit { code, message }
    }
}
