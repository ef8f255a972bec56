//! Process Orchestrator
//!
//! Runs one external tool invocation and exposes its stdout as a lazy stream
//! of raw fragments.
//!
//! # Lifecycle
//!
//! ```text
//! spawn (own process group, cwd = sandbox, env = sanitized)
//!   │
//!   ├── stdin writer task   (prompt, then EOF)
//!   ├── stderr tail task    (last few KiB kept for error messages)
//!   └── supervisor task     stdout ──► channel ──► ProcessOutput
//!          races: timeout │ cancellation │ consumer dropped
//!                 └──► SIGTERM group ──(grace)──► SIGKILL group ──► reap
//! ```
//!
//! Every path ends with the child reaped and any members left in its process
//! group killed, so
//! nothing the tool started outlives the request.

use std::path::Path;
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::invocation::PreparedInvocation;
use crate::error::RelayError;
use crate::sandbox::SanitizedEnv;

/// A raw stdout fragment, or the failure that ended the run
pub type Fragment = Result<Vec<u8>, RelayError>;

/// Subprocess supervision parameters
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessConfig {
    /// Wall-clock budget for the whole run
    pub timeout: Duration,
    /// Time between SIGTERM and SIGKILL
    pub kill_grace: Duration,
    /// Maximum bytes per stdout read
    pub read_chunk_bytes: usize,
    /// Bytes of stderr kept for error reporting
    pub stderr_tail_bytes: usize,
    /// Fragments buffered ahead of the consumer
    pub channel_capacity: usize,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(600_000),
            kill_grace: Duration::from_secs(2),
            read_chunk_bytes: 8 * 1024,
            stderr_tail_bytes: 8 * 1024,
            channel_capacity: 32,
        }
    }
}

impl ProcessConfig {
    /// Set the run timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the SIGTERM to SIGKILL grace period
    #[must_use]
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }
}

/// Live stdout of a running tool
///
/// Ends after the child has been reaped. Dropping it terminates the child.
pub struct ProcessOutput {
    fragments: ReceiverStream<Fragment>,
    pid: Arc<AtomicU32>,
}

impl ProcessOutput {
    /// Child pid, once spawned
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Shared pid slot, filled in once the child is spawned
    pub(crate) fn pid_cell(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.pid)
    }
}

impl Stream for ProcessOutput {
    type Item = Fragment;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.fragments).poll_next(cx)
    }
}

/// Spawns and supervises external tools
#[derive(Clone, Debug, Default)]
pub struct ProcessOrchestrator {
    config: ProcessConfig,
}

enum Outcome {
    Eof,
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
    WaitFailed(std::io::Error),
}

impl ProcessOrchestrator {
    /// Create an orchestrator
    #[must_use]
    pub fn new(config: ProcessConfig) -> Self {
        Self { config }
    }

    /// Supervision parameters
    #[must_use]
    pub fn config(&self) -> &ProcessConfig {
        &self.config
    }

    /// Start `invocation` in `cwd` with exactly `env`
    ///
    /// Failures (spawn, timeout, cancellation, non-zero exit) arrive as the
    /// last element of the returned stream.
    pub fn run(
        &self,
        invocation: &PreparedInvocation,
        cwd: &Path,
        env: &SanitizedEnv,
        cancel: CancellationToken,
    ) -> ProcessOutput {
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let pid = Arc::new(AtomicU32::new(0));

        let mut command = build_command(invocation, cwd, env);
        let config = self.config.clone();
        let program = invocation.program.clone();
        let stdin_payload = invocation.stdin.clone();
        let pid_slot = Arc::clone(&pid);

        tokio::spawn(async move {
            let child = match command.spawn() {
                Ok(child) => child,
                Err(source) => {
                    error!(program = %program, error = %source, "Failed to spawn tool");
                    let _ = tx.send(Err(RelayError::Spawn { program, source })).await;
                    return;
                }
            };
            supervise(child, config, cancel, tx, program, stdin_payload, pid_slot).await;
        });

        ProcessOutput {
            fragments: ReceiverStream::new(rx),
            pid,
        }
    }
}

fn build_command(invocation: &PreparedInvocation, cwd: &Path, env: &SanitizedEnv) -> Command {
    let mut command = Command::new(&invocation.program);
    command
        .args(&invocation.args)
        .current_dir(cwd)
        .env_clear()
        .envs(env)
        .envs(&invocation.env)
        .stdin(if invocation.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);
    command
}

async fn supervise(
    mut child: Child,
    config: ProcessConfig,
    cancel: CancellationToken,
    tx: mpsc::Sender<Fragment>,
    program: String,
    stdin_payload: Option<String>,
    pid_slot: Arc<AtomicU32>,
) {
    let started = Instant::now();
    let deadline = started + config.timeout;
    let pid = child.id();
    if let Some(pid) = pid {
        pid_slot.store(pid, Ordering::SeqCst);
    }
    info!(program = %program, pid = ?pid, "Subprocess spawned");

    if let (Some(mut stdin), Some(payload)) = (child.stdin.take(), stdin_payload) {
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(payload.as_bytes()).await {
                debug!(error = %e, "Tool closed stdin early");
            }
            // dropping stdin delivers EOF
        });
    }

    let stderr_task = child
        .stderr
        .take()
        .map(|stderr| tokio::spawn(read_tail(stderr, config.stderr_tail_bytes)));

    let outcome = match child.stdout.take() {
        Some(mut stdout) => {
            pump_stdout(&mut stdout, &config, &cancel, &tx, deadline).await
        }
        None => Outcome::Eof,
    };

    let outcome = match outcome {
        Outcome::Eof => tokio::select! {
            biased;
            _ = cancel.cancelled() => Outcome::Cancelled,
            _ = tx.closed() => Outcome::Cancelled,
            _ = sleep_until(deadline) => Outcome::TimedOut,
            status = child.wait() => match status {
                Ok(status) => Outcome::Exited(status),
                Err(e) => Outcome::WaitFailed(e),
            },
        },
        other => other,
    };

    let elapsed_ms = started.elapsed().as_millis() as u64;
    match outcome {
        Outcome::Exited(status) => {
            kill_stragglers(pid);
            let stderr = collect_tail(stderr_task, config.kill_grace).await;
            if status.success() {
                info!(pid = ?pid, elapsed_ms, "Subprocess exited");
            } else {
                warn!(pid = ?pid, code = ?status.code(), elapsed_ms, "Subprocess failed");
                let _ = tx
                    .send(Err(RelayError::non_zero_exit(status.code(), &stderr)))
                    .await;
            }
        }
        Outcome::TimedOut => {
            warn!(
                pid = ?pid,
                timeout_ms = config.timeout.as_millis() as u64,
                "Subprocess timed out, terminating"
            );
            terminate(&mut child, pid, config.kill_grace).await;
            let _ = tx.send(Err(RelayError::Timeout(config.timeout))).await;
        }
        Outcome::Cancelled => {
            info!(pid = ?pid, elapsed_ms, "Request cancelled, terminating subprocess");
            terminate(&mut child, pid, config.kill_grace).await;
            let _ = tx.try_send(Err(RelayError::KilledByCancellation));
        }
        Outcome::WaitFailed(e) => {
            error!(pid = ?pid, error = %e, "Failed to wait for subprocess");
            terminate(&mut child, pid, config.kill_grace).await;
            let _ = tx
                .send(Err(RelayError::NonZeroExit {
                    code: None,
                    message: e.to_string(),
                }))
                .await;
        }
        Outcome::Eof => {}
    }
}

async fn pump_stdout<R: AsyncRead + Unpin>(
    stdout: &mut R,
    config: &ProcessConfig,
    cancel: &CancellationToken,
    tx: &mpsc::Sender<Fragment>,
    deadline: Instant,
) -> Outcome {
    let mut buf = vec![0u8; config.read_chunk_bytes.max(1)];
    loop {
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Outcome::Cancelled,
            _ = tx.closed() => return Outcome::Cancelled,
            _ = sleep_until(deadline) => return Outcome::TimedOut,
            read = stdout.read(&mut buf) => match read {
                Ok(0) => return Outcome::Eof,
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "Error reading tool stdout");
                    return Outcome::Eof;
                }
            },
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Outcome::Cancelled,
            _ = sleep_until(deadline) => return Outcome::TimedOut,
            sent = tx.send(Ok(buf[..n].to_vec())) => {
                if sent.is_err() {
                    return Outcome::Cancelled;
                }
            }
        }
    }
}

async fn read_tail<R: AsyncRead + Unpin>(mut reader: R, cap: usize) -> String {
    let mut tail = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > cap {
                    let excess = tail.len() - cap;
                    tail.drain(..excess);
                }
            }
        }
    }
    String::from_utf8_lossy(&tail).into_owned()
}

async fn collect_tail(task: Option<tokio::task::JoinHandle<String>>, wait: Duration) -> String {
    let Some(task) = task else {
        return String::new();
    };
    match tokio::time::timeout(wait, task).await {
        Ok(Ok(tail)) => tail,
        Ok(Err(e)) => {
            debug!(error = %e, "stderr reader failed");
            String::new()
        }
        Err(_) => {
            debug!("stderr still open after exit");
            String::new()
        }
    }
}

// ============================================================================
// Termination
// ============================================================================

#[derive(Clone, Copy, Debug)]
enum GroupSignal {
    Term,
    Kill,
}

/// SIGTERM the group, wait `grace`, then SIGKILL and reap
async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) {
    signal_group(pid, GroupSignal::Term);
    #[cfg(not(unix))]
    let _ = child.start_kill();

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(pid = ?pid, ?status, "Subprocess terminated");
            kill_stragglers(pid);
        }
        Ok(Err(e)) => {
            warn!(pid = ?pid, error = %e, "Failed to reap subprocess");
            signal_group(pid, GroupSignal::Kill);
        }
        Err(_) => {
            warn!(pid = ?pid, grace_ms = grace.as_millis() as u64, "Subprocess ignored SIGTERM, killing");
            // leader not yet reaped, so the group id is still ours
            signal_group(pid, GroupSignal::Kill);
            if let Err(e) = child.kill().await {
                warn!(pid = ?pid, error = %e, "Failed to kill subprocess");
            }
        }
    }
}

/// SIGKILL whatever is left in the group of an already reaped leader
///
/// The leader's pid can be reused once reaped, unless a group member still
/// holds it as a process group id. An empty group is left alone.
fn kill_stragglers(pid: Option<u32>) {
    if group_has_members(pid) {
        debug!(pid = ?pid, "Descendants outlived the subprocess");
        signal_group(pid, GroupSignal::Kill);
    }
}

#[cfg(unix)]
fn group_has_members(pid: Option<u32>) -> bool {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    pid.and_then(|p| i32::try_from(p).ok())
        .is_some_and(|raw| killpg(Pid::from_raw(raw), None).is_ok())
}

#[cfg(not(unix))]
fn group_has_members(_pid: Option<u32>) -> bool {
    false
}

#[cfg(unix)]
fn signal_group(pid: Option<u32>, signal: GroupSignal) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(raw) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    let sig = match signal {
        GroupSignal::Term => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    match killpg(Pid::from_raw(raw), sig) {
        Ok(()) => debug!(pgid = raw, signal = ?sig, "Signalled process group"),
        Err(Errno::ESRCH) => {}
        Err(e) => warn!(pgid = raw, error = %e, "Failed to signal process group"),
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: Option<u32>, _signal: GroupSignal) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn sh(script: &str) -> PreparedInvocation {
        PreparedInvocation::new("/bin/sh").arg("-c").arg(script)
    }

    fn env() -> SanitizedEnv {
        let mut env = SanitizedEnv::new();
        env.insert("PATH".to_string(), "/usr/bin:/bin".to_string());
        env
    }

    async fn collect(output: ProcessOutput) -> (Vec<u8>, Option<RelayError>) {
        let mut bytes = Vec::new();
        let mut failure = None;
        let mut output = output;
        while let Some(item) = output.next().await {
            match item {
                Ok(fragment) => bytes.extend(fragment),
                Err(e) => failure = Some(e),
            }
        }
        (bytes, failure)
    }

    #[tokio::test]
    async fn test_stdout_and_clean_exit() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = ProcessOrchestrator::default();
        let output = orchestrator.run(&sh("printf 'hello\\n'; pwd"), dir.path(), &env(), CancellationToken::new());

        let (bytes, failure) = collect(output).await;
        assert!(failure.is_none());
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("hello\n"));
        assert!(text.contains(dir.path().file_name().unwrap().to_str().unwrap()));
    }

    #[tokio::test]
    async fn test_env_is_exactly_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = ProcessOrchestrator::default();
        let inv = sh("echo \"[$LOGNAME][$EXTRA]\"").env("EXTRA", "layered");
        let (bytes, _) = collect(orchestrator.run(&inv, dir.path(), &env(), CancellationToken::new())).await;
        assert_eq!(String::from_utf8(bytes).unwrap(), "[][layered]\n");
    }

    #[tokio::test]
    async fn test_stdin_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = ProcessOrchestrator::default();
        let inv = sh("cat").with_stdin("from stdin");
        let (bytes, failure) = collect(orchestrator.run(&inv, dir.path(), &env(), CancellationToken::new())).await;
        assert!(failure.is_none());
        assert_eq!(bytes, b"from stdin");
    }

    #[tokio::test]
    async fn test_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = ProcessOrchestrator::default();
        let inv = PreparedInvocation::new("/definitely/not/a/tool");
        let (_, failure) = collect(orchestrator.run(&inv, dir.path(), &env(), CancellationToken::new())).await;
        assert!(matches!(failure, Some(RelayError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_non_zero_exit_carries_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = ProcessOrchestrator::default();
        let inv = sh("echo partial; echo 'not logged in' >&2; exit 3");
        let (bytes, failure) = collect(orchestrator.run(&inv, dir.path(), &env(), CancellationToken::new())).await;
        assert_eq!(bytes, b"partial\n");
        match failure {
            Some(RelayError::NonZeroExit { code, message }) => {
                assert_eq!(code, Some(3));
                assert_eq!(message, "not logged in");
            }
            other => panic!("expected NonZeroExit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_kills_tool() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = ProcessOrchestrator::new(
            ProcessConfig::default()
                .with_timeout(Duration::from_millis(100))
                .with_kill_grace(Duration::from_millis(200)),
        );
        let started = std::time::Instant::now();
        let (_, failure) = collect(orchestrator.run(&sh("sleep 30"), dir.path(), &env(), CancellationToken::new())).await;
        assert!(matches!(failure, Some(RelayError::Timeout(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancellation_terminates_tool() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = ProcessOrchestrator::new(
            ProcessConfig::default().with_kill_grace(Duration::from_millis(200)),
        );
        let cancel = CancellationToken::new();
        let mut output = orchestrator.run(
            &sh("echo started; exec sleep 30"),
            dir.path(),
            &env(),
            cancel.clone(),
        );

        let first = output.next().await;
        assert!(matches!(first, Some(Ok(_))));
        let pid = output.pid().unwrap();

        let started = std::time::Instant::now();
        cancel.cancel();
        let (_, failure) = collect(output).await;
        assert!(matches!(failure, Some(RelayError::KilledByCancellation)));
        assert!(started.elapsed() < Duration::from_secs(5));

        // reaped, so the pid no longer exists
        let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None);
        assert_eq!(alive, Err(nix::errno::Errno::ESRCH));
    }

    #[tokio::test]
    async fn test_dropping_output_terminates_tool() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = ProcessOrchestrator::new(
            ProcessConfig::default().with_kill_grace(Duration::from_millis(200)),
        );
        let mut output = orchestrator.run(
            &sh("echo started; exec sleep 30"),
            dir.path(),
            &env(),
            CancellationToken::new(),
        );
        assert!(matches!(output.next().await, Some(Ok(_))));
        let pid = output.pid().unwrap();
        drop(output);

        let mut gone = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid as i32), None).is_err() {
                gone = true;
                break;
            }
        }
        assert!(gone, "tool still running after its output was dropped");
    }

    // zombies awaiting their reaper count as gone
    fn is_running(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => !stat
                .rsplit_once(") ")
                .is_some_and(|(_, rest)| rest.starts_with('Z')),
            Err(_) if std::path::Path::new("/proc/self").exists() => false,
            Err(_) => nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok(),
        }
    }

    async fn wait_gone(pid: i32) -> bool {
        for _ in 0..50 {
            if !is_running(pid) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_background_descendant_killed_after_exit() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = ProcessOrchestrator::new(
            ProcessConfig::default().with_kill_grace(Duration::from_millis(200)),
        );
        let inv = sh("sleep 30 >/dev/null 2>&1 & echo $!");
        let (bytes, failure) = collect(orchestrator.run(&inv, dir.path(), &env(), CancellationToken::new())).await;
        assert!(failure.is_none());

        let straggler: i32 = String::from_utf8(bytes).unwrap().trim().parse().unwrap();
        assert!(wait_gone(straggler).await, "background descendant survived");
    }

    #[tokio::test]
    async fn test_descendant_ignoring_sigterm_killed_after_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let orchestrator = ProcessOrchestrator::new(
            ProcessConfig::default().with_kill_grace(Duration::from_secs(3)),
        );
        let cancel = CancellationToken::new();
        let script = "trap 'exit 0' TERM; \
                      (trap '' TERM; exec sleep 30) >/dev/null 2>&1 & \
                      echo $!; \
                      while :; do sleep 0.1; done";
        let mut output = orchestrator.run(&sh(script), dir.path(), &env(), cancel.clone());

        let first = output.next().await.unwrap().unwrap();
        let straggler: i32 = String::from_utf8(first).unwrap().trim().parse().unwrap();

        cancel.cancel();
        let (_, failure) = collect(output).await;
        assert!(matches!(failure, Some(RelayError::KilledByCancellation)));
        assert!(wait_gone(straggler).await, "descendant ignoring SIGTERM survived");
    }

    #[test]
    fn test_empty_group_left_alone() {
        let mut child = std::process::Command::new("/bin/true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        assert!(!group_has_members(Some(pid)));
        assert!(!group_has_members(None));
        kill_stragglers(Some(pid));
    }
}
