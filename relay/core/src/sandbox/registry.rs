//! Sandbox Registry
//!
//! Process-wide table of sandbox directories and their cleanup deadlines.
//! One registry is built at startup and cloned into the request path and the
//! cleanup scheduler.
//!
//! # State machine
//!
//! ```text
//! Active ──► PendingCleanup ──► Cleaned
//!    └──────────────────────────────┘   (zero delay / immediate cleanup)
//! ```
//!
//! Transitions only move forward. `Cleaned` is terminal; cleaning twice is a
//! no-op. Deadlines live in a min-heap with lazy deletion: an entry is acted on
//! only if it still matches the session's current deadline.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::artifacts::{NoArtifacts, SessionArtifacts};
use super::env::{EnvPolicy, SanitizedEnv};
use super::lease::{Lease, LeaseError};
use crate::error::RelayError;

/// Directory name prefix of every sandbox
pub const SANDBOX_PREFIX: &str = "relay-sandbox-";

/// Delay before a failed cleanup is retried
const CLEANUP_RETRY_DELAY: Duration = Duration::from_secs(30);

// ============================================================================
// Identifiers and state
// ============================================================================

/// Opaque sandbox identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SandboxId(Uuid);

impl SandboxId {
    /// Generate a fresh identifier
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Directory name used for this sandbox
    #[must_use]
    pub fn dir_name(&self) -> String {
        format!("{SANDBOX_PREFIX}{}", self.0)
    }
}

impl Default for SandboxId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a sandbox
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    /// Owned by a running request
    Active,
    /// Waiting for its cleanup deadline
    PendingCleanup,
    /// Directory and artifacts removed
    Cleaned,
}

impl SandboxState {
    fn rank(self) -> u8 {
        match self {
            Self::Active => 0,
            Self::PendingCleanup => 1,
            Self::Cleaned => 2,
        }
    }

    /// Whether moving to `next` is a forward transition
    #[must_use]
    pub fn can_advance_to(self, next: Self) -> bool {
        next.rank() > self.rank()
    }
}

/// One isolated execution context
#[derive(Clone, Debug)]
pub struct SandboxSession {
    /// Identifier
    pub id: SandboxId,
    /// Working directory, owned exclusively by this session
    pub path: PathBuf,
    /// Allocation time
    pub created_at: DateTime<Utc>,
    /// Provider-side session, used only as a cleanup target
    pub provider_session_id: Option<String>,
    /// When the cleanup scheduler may reclaim this sandbox
    pub cleanup_deadline: Option<Instant>,
    /// Lifecycle state
    pub state: SandboxState,
    /// Environment the subprocess runs with
    pub env: Arc<SanitizedEnv>,
}

/// Result of a cleanup request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// This call removed the sandbox
    Cleaned,
    /// Nothing to do
    AlreadyClean,
    /// Another task is cleaning it right now
    InProgress,
}

/// Sandbox bookkeeping failures
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The id is not (or no longer) registered
    #[error("unknown sandbox {0}")]
    UnknownSession(SandboxId),

    /// The sandbox directory could not be removed
    #[error("failed to remove {path}: {source}")]
    Remove {
        /// Directory being removed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// Lease bookkeeping failed
    #[error(transparent)]
    Lease(#[from] LeaseError),
}

// ============================================================================
// Registry
// ============================================================================

/// Registry construction parameters
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Directory under which sandboxes are created
    pub root: PathBuf,
    /// Child environment rules
    pub env_policy: EnvPolicy,
    /// Persist leases for pending sandboxes
    pub write_leases: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir().join("cli-relay"),
            env_policy: EnvPolicy::default(),
            write_leases: true,
        }
    }
}

impl RegistryConfig {
    /// Use a different sandbox root
    #[must_use]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }
}

#[derive(Debug)]
struct Entry {
    session: SandboxSession,
    cleaning: bool,
    cleaned_at: Option<Instant>,
}

#[derive(Debug)]
struct Inner {
    config: RegistryConfig,
    sessions: DashMap<SandboxId, Entry>,
    deadlines: Mutex<BinaryHeap<Reverse<(Instant, SandboxId)>>>,
    artifacts: Arc<dyn SessionArtifacts>,
}

/// Shared table of sandboxes
#[derive(Clone, Debug)]
pub struct SandboxRegistry {
    inner: Arc<Inner>,
}

impl SandboxRegistry {
    /// Registry for providers that keep no session artifacts
    #[must_use]
    pub fn new(config: RegistryConfig) -> Self {
        Self::with_artifacts(config, Arc::new(NoArtifacts))
    }

    /// Registry that also removes provider session artifacts
    #[must_use]
    pub fn with_artifacts(config: RegistryConfig, artifacts: Arc<dyn SessionArtifacts>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                sessions: DashMap::new(),
                deadlines: Mutex::new(BinaryHeap::new()),
                artifacts,
            }),
        }
    }

    /// Sandbox root directory
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.inner.config.root
    }

    /// Create a fresh sandbox directory
    pub async fn allocate(&self) -> Result<SandboxSession, RelayError> {
        let root = &self.inner.config.root;
        tokio::fs::create_dir_all(root)
            .await
            .map_err(RelayError::ResourceExhausted)?;

        let id = SandboxId::new();
        let path = root.join(id.dir_name());
        tokio::fs::create_dir(&path)
            .await
            .map_err(RelayError::ResourceExhausted)?;
        // the tool sees the resolved path; redaction and artifact lookup must too
        let path = match tokio::fs::canonicalize(&path).await {
            Ok(resolved) => resolved,
            Err(_) => path,
        };

        let session = SandboxSession {
            id,
            path,
            created_at: Utc::now(),
            provider_session_id: None,
            cleanup_deadline: None,
            state: SandboxState::Active,
            env: Arc::new(self.inner.config.env_policy.from_host()),
        };
        self.inner.sessions.insert(
            id,
            Entry {
                session: session.clone(),
                cleaning: false,
                cleaned_at: None,
            },
        );

        info!(sandbox_id = %id, path = %session.path.display(), "Sandbox allocated");
        Ok(session)
    }

    /// Snapshot of a session
    #[must_use]
    pub fn get(&self, id: &SandboxId) -> Option<SandboxSession> {
        self.inner.sessions.get(id).map(|e| e.session.clone())
    }

    /// Current state of a session
    #[must_use]
    pub fn state(&self, id: &SandboxId) -> Option<SandboxState> {
        self.inner.sessions.get(id).map(|e| e.session.state)
    }

    /// Number of tracked sessions, including recently cleaned ones
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Whether no sessions are tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    /// Number of sessions in `state`
    #[must_use]
    pub fn count(&self, state: SandboxState) -> usize {
        self.inner
            .sessions
            .iter()
            .filter(|e| e.session.state == state)
            .count()
    }

    /// Whether a live (not yet cleaned) session uses `path`
    #[must_use]
    pub fn owns_path(&self, path: &Path) -> bool {
        self.inner
            .sessions
            .iter()
            .any(|e| e.session.state != SandboxState::Cleaned && e.session.path == path)
    }

    /// Record the provider session reported by the tool
    pub fn set_provider_session(&self, id: &SandboxId, session_id: impl Into<String>) -> bool {
        match self.inner.sessions.get_mut(id) {
            Some(mut entry) if entry.session.state != SandboxState::Cleaned => {
                let session_id = session_id.into();
                debug!(sandbox_id = %id, provider_session = %session_id, "Provider session recorded");
                entry.session.provider_session_id = Some(session_id);
                true
            }
            _ => false,
        }
    }

    /// Schedule cleanup `delay` from now; zero cleans inline
    ///
    /// A pending session's deadline can only move earlier.
    pub async fn mark_pending_cleanup(
        &self,
        id: &SandboxId,
        delay: Duration,
    ) -> Result<(), SandboxError> {
        if delay.is_zero() {
            return self.cleanup(id).await.map(|_| ());
        }

        let deadline = Instant::now() + delay;
        let lease = {
            let mut entry = self
                .inner
                .sessions
                .get_mut(id)
                .ok_or(SandboxError::UnknownSession(*id))?;
            match entry.session.state {
                SandboxState::Cleaned => return Ok(()),
                SandboxState::PendingCleanup
                    if entry.session.cleanup_deadline.is_some_and(|d| d <= deadline) =>
                {
                    return Ok(());
                }
                _ => {}
            }
            entry.session.state = SandboxState::PendingCleanup;
            entry.session.cleanup_deadline = Some(deadline);
            Lease {
                sandbox_path: entry.session.path.clone(),
                provider_session_id: entry.session.provider_session_id.clone(),
                deadline: Utc::now()
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::days(365)),
            }
        };
        self.inner.deadlines.lock().push(Reverse((deadline, *id)));
        debug!(sandbox_id = %id, delay_ms = delay.as_millis() as u64, "Sandbox pending cleanup");

        if self.inner.config.write_leases {
            if let Err(e) = lease.store().await {
                warn!(sandbox_id = %id, error = %e, "Failed to write cleanup lease");
            }
        }
        Ok(())
    }

    /// Hand an unfinished session to the sweeper with an immediate deadline
    ///
    /// Synchronous so it can run from `Drop`. No lease is written.
    pub fn mark_abandoned(&self, id: &SandboxId) -> bool {
        let now = Instant::now();
        {
            let Some(mut entry) = self.inner.sessions.get_mut(id) else {
                return false;
            };
            if entry.session.state != SandboxState::Active {
                return false;
            }
            entry.session.state = SandboxState::PendingCleanup;
            entry.session.cleanup_deadline = Some(now);
        }
        self.inner.deadlines.lock().push(Reverse((now, *id)));
        warn!(sandbox_id = %id, "Sandbox abandoned, handed to sweeper");
        true
    }

    /// Remove a sandbox's directory, provider artifact and lease
    ///
    /// Unknown and already-cleaned sessions are a no-op.
    pub async fn cleanup(&self, id: &SandboxId) -> Result<CleanupOutcome, SandboxError> {
        let (path, provider_session) = {
            let Some(mut entry) = self.inner.sessions.get_mut(id) else {
                return Ok(CleanupOutcome::AlreadyClean);
            };
            if entry.session.state == SandboxState::Cleaned {
                return Ok(CleanupOutcome::AlreadyClean);
            }
            if entry.cleaning {
                return Ok(CleanupOutcome::InProgress);
            }
            entry.cleaning = true;
            (
                entry.session.path.clone(),
                entry.session.provider_session_id.clone(),
            )
        };

        let result = self
            .remove_sandbox_files(&path, provider_session.as_deref())
            .await;

        let now = Instant::now();
        let retry_at = {
            let Some(mut entry) = self.inner.sessions.get_mut(id) else {
                return result.map(|()| CleanupOutcome::Cleaned);
            };
            entry.cleaning = false;
            match &result {
                Ok(()) => {
                    entry.session.state = SandboxState::Cleaned;
                    entry.session.cleanup_deadline = None;
                    entry.cleaned_at = Some(now);
                    None
                }
                Err(_) => {
                    let retry_at = now + CLEANUP_RETRY_DELAY;
                    entry.session.state = SandboxState::PendingCleanup;
                    entry.session.cleanup_deadline = Some(retry_at);
                    Some(retry_at)
                }
            }
        };

        match result {
            Ok(()) => {
                info!(sandbox_id = %id, "Sandbox cleaned");
                Ok(CleanupOutcome::Cleaned)
            }
            Err(e) => {
                if let Some(retry_at) = retry_at {
                    self.inner.deadlines.lock().push(Reverse((retry_at, *id)));
                }
                warn!(sandbox_id = %id, error = %e, "Sandbox cleanup failed, will retry");
                Err(e)
            }
        }
    }

    /// Sessions whose deadline is at or before `now` and still pending
    #[must_use]
    pub fn sweep(&self, now: Instant) -> Vec<SandboxSession> {
        let mut due = Vec::new();
        let mut heap = self.inner.deadlines.lock();
        while let Some(Reverse((deadline, id))) = heap.peek().copied() {
            if deadline > now {
                break;
            }
            heap.pop();
            if let Some(entry) = self.inner.sessions.get(&id) {
                if entry.session.state == SandboxState::PendingCleanup
                    && !entry.cleaning
                    && entry.session.cleanup_deadline == Some(deadline)
                {
                    due.push(entry.session.clone());
                }
            }
        }
        due
    }

    /// Earliest queued deadline
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.inner.deadlines.lock().peek().map(|Reverse((d, _))| *d)
    }

    /// Forget cleaned sessions older than `retention`
    pub fn prune_cleaned(&self, retention: Duration) -> usize {
        let now = Instant::now();
        let before = self.inner.sessions.len();
        self.inner.sessions.retain(|_, entry| {
            !(entry.session.state == SandboxState::Cleaned
                && entry.cleaned_at.is_some_and(|t| t + retention <= now))
        });
        before - self.inner.sessions.len()
    }

    /// Remove sandbox files that may not belong to any registered session
    ///
    /// Used for sandboxes left behind by a previous process.
    pub async fn remove_sandbox_files(
        &self,
        path: &Path,
        provider_session: Option<&str>,
    ) -> Result<(), SandboxError> {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Sandbox directory already gone");
            }
            Err(source) => {
                return Err(SandboxError::Remove {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }

        if let Some(session_id) = provider_session {
            if let Err(e) = self.inner.artifacts.remove(path, session_id).await {
                warn!(
                    provider_session = %session_id,
                    error = %e,
                    "Failed to remove provider session artifact"
                );
            }
        }

        Lease::discard(path).await?;
        Ok(())
    }
}
