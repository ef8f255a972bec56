//! On-disk cleanup leases
//!
//! The in-memory registry does not survive a restart. A lease file written
//! next to each pending sandbox lets the next process finish the job:
//!
//! ```text
//! <root>/relay-sandbox-<uuid>/              sandbox directory
//! <root>/relay-sandbox-<uuid>.lease.json    { sandbox_path, provider_session_id, deadline }
//! ```

use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// File name suffix of lease files
pub const LEASE_SUFFIX: &str = ".lease.json";

/// Lease I/O failures
#[derive(Debug, Error)]
pub enum LeaseError {
    /// Reading or writing the lease file failed
    #[error("lease {path}: {source}")]
    Io {
        /// Lease file
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },

    /// The lease file is not valid JSON
    #[error("lease {path} is corrupt: {source}")]
    Corrupt {
        /// Lease file
        path: PathBuf,
        /// Parse error
        #[source]
        source: serde_json::Error,
    },
}

/// A promise to clean a sandbox after `deadline`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Sandbox directory to remove
    pub sandbox_path: PathBuf,
    /// Provider session whose artifact should go too
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_session_id: Option<String>,
    /// Wall-clock cleanup deadline
    pub deadline: DateTime<Utc>,
}

impl Lease {
    /// Lease file path for a sandbox directory
    #[must_use]
    pub fn path_for(sandbox_path: &Path) -> PathBuf {
        let mut name = sandbox_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(LEASE_SUFFIX);
        sandbox_path.with_file_name(name)
    }

    /// Whether the deadline has passed at `now`
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.deadline <= now
    }

    /// Persist atomically (write to a temp file, then rename)
    pub async fn store(&self) -> Result<PathBuf, LeaseError> {
        let path = Self::path_for(&self.sandbox_path);
        let tmp = path.with_extension("tmp");
        let json = serde_json::to_vec_pretty(self).map_err(|source| LeaseError::Corrupt {
            path: path.clone(),
            source,
        })?;

        tokio::fs::write(&tmp, json)
            .await
            .map_err(|source| LeaseError::Io {
                path: tmp.clone(),
                source,
            })?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|source| LeaseError::Io {
                path: path.clone(),
                source,
            })?;
        Ok(path)
    }

    /// Load a lease file
    pub async fn load(path: &Path) -> Result<Self, LeaseError> {
        let bytes = tokio::fs::read(path).await.map_err(|source| LeaseError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|source| LeaseError::Corrupt {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Remove the lease for `sandbox_path`; missing is fine
    pub async fn discard(sandbox_path: &Path) -> Result<(), LeaseError> {
        let path = Self::path_for(sandbox_path);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(LeaseError::Io { path, source }),
        }
    }
}
