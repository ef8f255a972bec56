//! Sandboxes
//!
//! An isolated, short-lived working directory plus the sanitized environment
//! the external tool runs with.

mod artifacts;
mod env;
mod lease;
mod registry;

pub use artifacts::{ClaudeProjectArtifacts, NoArtifacts, SessionArtifacts};
pub use env::{EnvPolicy, SanitizedEnv};
pub use lease::{Lease, LeaseError, LEASE_SUFFIX};
pub use registry::{
    CleanupOutcome, RegistryConfig, SandboxError, SandboxId, SandboxRegistry, SandboxSession,
    SandboxState, SANDBOX_PREFIX,
};
