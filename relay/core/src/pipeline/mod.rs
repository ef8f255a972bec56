//! Request Pipeline
//!
//! [`Relay::execute`] is the single entry point: one prepared invocation in,
//! one lazy stream of client chunks out.
//!
//! ```text
//!  execute() ──► task ─┬─ SandboxRegistry::allocate
//!                      ├─ ProcessOrchestrator::run ──► ProviderEvents (EventParser)
//!                      ├─ drive: StreamTranslator + PathRedactor ──► mpsc ──► ExecutionStream
//!                      ├─ reap the subprocess
//!                      └─ SandboxLease::release (now, or after cleanup_delay)
//! ```
//!
//! Dropping the [`ExecutionStream`] cancels the request: the subprocess group
//! is terminated and the sandbox follows the cancellation cleanup policy.

mod driver;
mod guard;

use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{error, info, warn};

use crate::config::{CancelCleanup, ExecuteConfig};
use crate::keepalive::KeepaliveMultiplexer;
use crate::parser::{EventParser, ProviderEvents};
use crate::process::{PreparedInvocation, ProcessOrchestrator};
use crate::sandbox::{SandboxId, SandboxRegistry};
use crate::translate::{PathRedactor, StreamChunk, StreamTranslator};

pub(crate) use driver::Outcome;
pub use guard::SandboxLease;

/// Chunks buffered ahead of a slow consumer
const CHUNK_BUFFER: usize = 32;

/// Runs prepared invocations in sandboxes
#[derive(Clone, Debug)]
pub struct Relay {
    registry: SandboxRegistry,
}

impl Relay {
    /// Relay over a shared registry
    #[must_use]
    pub fn new(registry: SandboxRegistry) -> Self {
        Self { registry }
    }

    /// Shared registry
    #[must_use]
    pub fn registry(&self) -> &SandboxRegistry {
        &self.registry
    }

    /// Execute `invocation`, streaming translated chunks
    ///
    /// The stream ends after `Done` or one error chunk. A cancelled request
    /// ends without either. Must be called within a tokio runtime.
    pub fn execute(&self, invocation: PreparedInvocation, config: ExecuteConfig) -> ExecutionStream {
        let (tx, rx) = mpsc::channel(CHUNK_BUFFER);
        let cancel = CancellationToken::new();
        let handle = Arc::new(ExecutionHandle::default());

        let task = tokio::spawn(run_request(
            self.registry.clone(),
            invocation,
            config,
            tx,
            cancel.clone(),
            Arc::clone(&handle),
        ));

        ExecutionStream {
            chunks: ReceiverStream::new(rx),
            _guard: cancel.clone().drop_guard(),
            cancel,
            handle,
            task: Some(task),
        }
    }

    /// Execute with keepalives interleaved per `config.keepalive_interval`
    pub fn execute_multiplexed(
        &self,
        invocation: PreparedInvocation,
        config: ExecuteConfig,
    ) -> KeepaliveMultiplexer<ExecutionStream> {
        let interval = config.keepalive_interval;
        KeepaliveMultiplexer::new(self.execute(invocation, config), interval)
    }
}

#[derive(Debug, Default)]
struct ExecutionHandle {
    sandbox_id: OnceLock<SandboxId>,
    pid: OnceLock<Arc<AtomicU32>>,
}

/// Client side of one request
pub struct ExecutionStream {
    chunks: ReceiverStream<StreamChunk>,
    cancel: CancellationToken,
    _guard: DropGuard,
    handle: Arc<ExecutionHandle>,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for ExecutionStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionStream")
            .field("sandbox_id", &self.sandbox_id())
            .field("pid", &self.pid())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl ExecutionStream {
    /// Stop the request; the stream then ends without further chunks
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this request, for wiring to a transport
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Sandbox allocated for this request, once known
    #[must_use]
    pub fn sandbox_id(&self) -> Option<SandboxId> {
        self.handle.sandbox_id.get().copied()
    }

    /// Subprocess pid, once spawned
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        match self.handle.pid.get()?.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Interleave keepalives after `interval` of silence
    #[must_use]
    pub fn with_keepalive(self, interval: Duration) -> KeepaliveMultiplexer<Self> {
        KeepaliveMultiplexer::new(self, interval)
    }

    /// Stop listening and wait until the sandbox has been released
    ///
    /// After a terminal chunk this only waits for bookkeeping. Earlier, it
    /// cancels the request first.
    pub async fn finish(mut self) -> Option<SandboxId> {
        self.chunks.close();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Request task did not complete");
            }
        }
        self.sandbox_id()
    }
}

impl Stream for ExecutionStream {
    type Item = StreamChunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.chunks).poll_next(cx)
    }
}

fn cleanup_delay(outcome: Outcome, config: &ExecuteConfig) -> Duration {
    match outcome {
        Outcome::Failed(kind) if kind.forces_immediate_cleanup() => Duration::ZERO,
        o if o.is_cancellation() && config.cancel_cleanup == CancelCleanup::Immediate => {
            Duration::ZERO
        }
        _ => config.cleanup_delay,
    }
}

async fn run_request(
    registry: SandboxRegistry,
    invocation: PreparedInvocation,
    config: ExecuteConfig,
    tx: mpsc::Sender<StreamChunk>,
    cancel: CancellationToken,
    handle: Arc<ExecutionHandle>,
) {
    let started = Instant::now();
    let session = match registry.allocate().await {
        Ok(session) => session,
        Err(e) => {
            error!(error = %e, program = %invocation.program, "Sandbox allocation failed");
            let _ = tx.send(StreamChunk::from_error(&e)).await;
            return;
        }
    };
    let _ = handle.sandbox_id.set(session.id);
    let lease = SandboxLease::new(registry.clone(), session.id);

    let redactor = if config.redact_sandbox_paths {
        PathRedactor::for_sandbox(&session.path)
    } else {
        PathRedactor::disabled()
    };

    let run_cancel = cancel.child_token();
    let output = ProcessOrchestrator::new(config.process_config()).run(
        &invocation,
        &session.path,
        &session.env,
        run_cancel.clone(),
    );
    let _ = handle.pid.set(output.pid_cell());

    let parser = EventParser::new(config.output_format).with_max_record_bytes(config.max_record_bytes);
    let mut events = ProviderEvents::new(output, parser);
    let mut translator = StreamTranslator::new(config.mode, config.markers, started);

    let outcome = driver::drive(
        &mut events,
        &mut translator,
        &redactor,
        &tx,
        &cancel,
        |provider_session| {
            registry.set_provider_session(&session.id, provider_session);
        },
    )
    .await;
    drop(tx);

    // the sandbox may only be released once the tool is gone
    if outcome.leaves_tool_running() {
        run_cancel.cancel();
    }
    while events.next().await.is_some() {}

    let stats = events.parser().stats();
    info!(
        sandbox_id = %session.id,
        outcome = %outcome,
        elapsed_ms = started.elapsed().as_millis() as u64,
        valid_records = stats.valid_records,
        malformed_records = stats.malformed_records,
        "Request finished"
    );

    lease.release(cleanup_delay(outcome, &config)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_cleanup_delay_policy() {
        let config = ExecuteConfig::default().with_cleanup_delay(Duration::from_secs(60));

        assert_eq!(
            cleanup_delay(Outcome::Completed, &config),
            Duration::from_secs(60)
        );
        assert_eq!(
            cleanup_delay(Outcome::Failed(ErrorKind::NonZeroExit), &config),
            Duration::from_secs(60)
        );
        assert_eq!(
            cleanup_delay(Outcome::Failed(ErrorKind::Timeout), &config),
            Duration::ZERO
        );
        assert_eq!(
            cleanup_delay(Outcome::Failed(ErrorKind::SpawnError), &config),
            Duration::ZERO
        );
        assert_eq!(
            cleanup_delay(Outcome::Cancelled, &config),
            Duration::from_secs(60)
        );

        let immediate = config.with_cancel_cleanup(CancelCleanup::Immediate);
        assert_eq!(cleanup_delay(Outcome::ClientGone, &immediate), Duration::ZERO);
        assert_eq!(
            cleanup_delay(Outcome::Completed, &immediate),
            Duration::from_secs(60)
        );
    }

    #[tokio::test]
    async fn test_allocation_failure_is_single_error_chunk() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let registry = SandboxRegistry::new(
            crate::sandbox::RegistryConfig::default().with_root(file.path().join("nested")),
        );
        let relay = Relay::new(registry);

        let chunks: Vec<StreamChunk> = relay
            .execute(PreparedInvocation::new("true"), ExecuteConfig::default())
            .collect()
            .await;
        assert_eq!(chunks.len(), 1);
        assert!(matches!(
            chunks[0],
            StreamChunk::Error {
                error_kind: ErrorKind::ResourceExhausted,
                ..
            }
        ));
    }
}
