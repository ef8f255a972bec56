//! Sandbox ownership guard

use std::time::Duration;

use tracing::warn;

use crate::sandbox::{SandboxId, SandboxRegistry};

/// Ties an `Active` sandbox to the request that owns it
///
/// Call [`release`](Self::release) once the subprocess is gone. If the guard
/// is dropped first (task aborted, runtime shutting down) the sandbox is
/// handed to the sweeper with an immediate deadline.
#[derive(Debug)]
pub struct SandboxLease {
    registry: SandboxRegistry,
    id: SandboxId,
    released: bool,
}

impl SandboxLease {
    /// Guard `id` in `registry`
    #[must_use]
    pub fn new(registry: SandboxRegistry, id: SandboxId) -> Self {
        Self {
            registry,
            id,
            released: false,
        }
    }

    /// Guarded sandbox
    #[must_use]
    pub fn id(&self) -> SandboxId {
        self.id
    }

    /// Schedule cleanup `delay` from now; zero cleans before returning
    pub async fn release(mut self, delay: Duration) {
        if let Err(e) = self.registry.mark_pending_cleanup(&self.id, delay).await {
            warn!(sandbox_id = %self.id, error = %e, "Sandbox release failed");
        }
        self.released = true;
    }
}

impl Drop for SandboxLease {
    fn drop(&mut self) {
        if !self.released {
            self.registry.mark_abandoned(&self.id);
        }
    }
}
