//! Provider session artifacts
//!
//! Some CLIs persist every session under a per-project directory in the
//! user's home. Sessions run by the relay would otherwise accumulate there and
//! show up in the tool's own session history.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

/// Removes the artifact a provider keeps for one session
#[async_trait]
pub trait SessionArtifacts: Send + Sync + std::fmt::Debug {
    /// Remove the artifact for `session_id`, recorded while running in
    /// `sandbox_path`. Returns whether anything was deleted. A missing
    /// artifact is not an error.
    async fn remove(&self, sandbox_path: &Path, session_id: &str) -> io::Result<bool>;
}

/// Provider keeps no artifacts
#[derive(Clone, Copy, Debug, Default)]
pub struct NoArtifacts;

#[async_trait]
impl SessionArtifacts for NoArtifacts {
    async fn remove(&self, _sandbox_path: &Path, _session_id: &str) -> io::Result<bool> {
        Ok(false)
    }
}

/// `<projects_root>/<encoded cwd>/<session_id>.jsonl` transcripts
#[derive(Clone, Debug)]
pub struct ClaudeProjectArtifacts {
    projects_root: PathBuf,
}

impl ClaudeProjectArtifacts {
    /// Use an explicit projects directory
    pub fn new(projects_root: impl Into<PathBuf>) -> Self {
        Self {
            projects_root: projects_root.into(),
        }
    }

    /// `$HOME/.claude/projects`, if a home directory is known
    #[must_use]
    pub fn from_home() -> Option<Self> {
        dirs::home_dir().map(|home| Self::new(home.join(".claude").join("projects")))
    }

    /// Directory the provider uses for sessions run in `cwd`
    #[must_use]
    pub fn project_dir(&self, cwd: &Path) -> PathBuf {
        let encoded: String = cwd
            .to_string_lossy()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        self.projects_root.join(encoded)
    }
}

/// Session ids are joined into a path, so only plain identifiers are accepted
fn is_safe_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[async_trait]
impl SessionArtifacts for ClaudeProjectArtifacts {
    async fn remove(&self, sandbox_path: &Path, session_id: &str) -> io::Result<bool> {
        if !is_safe_session_id(session_id) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("refusing suspicious session id {session_id:?}"),
            ));
        }

        let project_dir = self.project_dir(sandbox_path);
        let transcript = project_dir.join(format!("{session_id}.jsonl"));

        let removed = match tokio::fs::remove_file(&transcript).await {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(e),
        };

        // only succeeds once the project directory is empty
        if tokio::fs::remove_dir(&project_dir).await.is_ok() {
            debug!(dir = %project_dir.display(), "Removed empty provider project directory");
        }

        debug!(
            session_id = %session_id,
            removed,
            "Provider session artifact cleanup"
        );
        Ok(removed)
    }
}
