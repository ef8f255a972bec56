//! Relay Daemon - Run a CLI Model Tool Through the Relay Pipeline
//!
//! Front end for `relay-core`: runs one prepared invocation in a fresh
//! sandbox and writes the translated stream to stdout, either as plain text,
//! as OpenAI-style SSE frames, or as one buffered chat completion.
//!
//! # Usage
//!
//! ```bash
//! # Stream a Claude answer with progress markers
//! relay-daemon run --mode progress -- claude -p --output-format stream-json --verbose
//!
//! # Prompt on stdin, SSE frames on stdout
//! echo "Say hi" | relay-daemon run --stdin --sse -- claude -p --output-format stream-json --verbose
//!
//! # Reclaim sandboxes left behind by a crashed run
//! relay-daemon sweep
//!
//! # Verbose logging
//! RUST_LOG=debug relay-daemon run -- ...
//! ```
//!
//! # Signals
//!
//! - `SIGINT`: cancel the running request; the sandbox follows the
//!   cancellation cleanup policy before exit

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use futures::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use relay_core::wire::{collect_completion, SseEncoder};
use relay_core::{
    default_config_path, load_config_from_path, ClaudeProjectArtifacts, CleanupScheduler,
    ConfigOverrides, EmissionMode, ExecutionStream, Multiplexed, OutputFormat,
    PreparedInvocation, Relay, RelayConfigFile, SandboxRegistry, StreamChunk,
};

/// How long to wait for deferred sandbox cleanup before exiting
const EXIT_DRAIN_LIMIT: Duration = Duration::from_secs(120);

/// Relay Daemon - sandboxed CLI model execution
#[derive(Parser, Debug)]
#[command(name = "relay-daemon")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "RELAY_CONFIG", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        short = 'l',
        long,
        env = "RELAY_LOG_LEVEL",
        default_value = "info",
        global = true
    )]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one invocation and stream its answer
    Run(RunArgs),
    /// Reclaim leftover sandboxes from earlier processes, then exit
    Sweep,
}

#[derive(ClapArgs, Debug)]
struct RunArgs {
    /// Emission mode (final-only, progress)
    #[arg(short = 'm', long, value_name = "MODE")]
    mode: Option<EmissionMode>,

    /// Tool output format (stream-json, plain-text)
    #[arg(short = 'f', long, value_name = "FORMAT")]
    format: Option<OutputFormat>,

    /// Forward our stdin to the tool as the prompt
    #[arg(long)]
    stdin: bool,

    /// Subprocess timeout in milliseconds
    #[arg(long, value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Keepalive interval in milliseconds (SSE output only, 0 disables)
    #[arg(long, value_name = "MS")]
    keepalive_ms: Option<u64>,

    /// Delay before the sandbox is removed, in milliseconds
    #[arg(long, value_name = "MS")]
    cleanup_delay_ms: Option<u64>,

    /// Sandbox root directory
    #[arg(long, env = "RELAY_SANDBOX_ROOT", value_name = "DIR")]
    sandbox_root: Option<PathBuf>,

    /// Model name reported in SSE and buffered output
    #[arg(long, default_value = "cli-relay")]
    model: String,

    /// Also remove the Claude session transcript with the sandbox
    #[arg(long)]
    claude_sessions: bool,

    /// Write OpenAI-style SSE frames
    #[arg(long, conflicts_with = "buffered")]
    sse: bool,

    /// Write one chat completion JSON object at the end
    #[arg(long)]
    buffered: bool,

    /// Program and arguments to run
    #[arg(last = true, required = true, value_name = "PROGRAM")]
    command: Vec<String>,
}

impl RunArgs {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(ms) = self.timeout_ms {
            overrides = overrides.with_timeout_ms(ms);
        }
        if let Some(ms) = self.keepalive_ms {
            overrides = overrides.with_keepalive_interval_ms(ms);
        }
        if let Some(mode) = self.mode {
            overrides = overrides.with_emission_mode(mode);
        }
        if let Some(format) = self.format {
            overrides = overrides.with_output_format(format);
        }
        if let Some(ref root) = self.sandbox_root {
            overrides = overrides.with_sandbox_root(root.clone());
        }
        if let Some(ms) = self.cleanup_delay_ms {
            overrides = overrides.with_cleanup_delay_ms(ms);
        }
        overrides
    }
}

/// Initialize logging with the specified level
///
/// Logs go to stderr; stdout carries the answer.
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("relay_daemon={level},relay_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

fn build_registry(config: &RelayConfigFile, claude_sessions: bool) -> SandboxRegistry {
    if claude_sessions {
        if let Some(artifacts) = ClaudeProjectArtifacts::from_home() {
            return SandboxRegistry::with_artifacts(
                config.registry_config(),
                std::sync::Arc::new(artifacts),
            );
        }
        warn!("No home directory, Claude session transcripts will be kept");
    }
    SandboxRegistry::new(config.registry_config())
}

async fn read_prompt() -> Result<String> {
    let mut prompt = String::new();
    tokio::io::stdin()
        .read_to_string(&mut prompt)
        .await
        .context("Failed to read prompt from stdin")?;
    Ok(prompt)
}

/// Cancel `token` on the first Ctrl-C
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        tokio::select! {
            () = token.cancelled() => {}
            result = tokio::signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Interrupt received, cancelling request"),
                    Err(e) => warn!(error = %e, "Cannot listen for Ctrl-C"),
                }
                token.cancel();
            }
        }
    });
}

// ============================================================================
// Output
// ============================================================================

/// Plain output: answer text on stdout, progress markers on stderr
async fn write_plain(stream: &mut ExecutionStream) -> Result<Option<String>> {
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    let mut failure = None;

    while let Some(chunk) = stream.next().await {
        match chunk {
            StreamChunk::Content { content, .. } => {
                stdout.write_all(content.as_bytes()).await?;
                stdout.flush().await?;
            }
            StreamChunk::Progress { content } => {
                stderr.write_all(format!("{content} ").as_bytes()).await?;
                stderr.flush().await?;
            }
            StreamChunk::Error {
                error_kind,
                message,
            } => failure = Some(format!("{error_kind}: {message}")),
            StreamChunk::Done => {}
        }
    }
    Ok(failure)
}

async fn write_sse(
    stream: ExecutionStream,
    keepalive: Duration,
    model: &str,
) -> Result<(ExecutionStream, Option<String>)> {
    let mut encoder = SseEncoder::new(model);
    let mut stdout = tokio::io::stdout();
    let mut failure = None;

    let mut items = stream.with_keepalive(keepalive);
    while let Some(item) = items.next().await {
        if let Multiplexed::Item(StreamChunk::Error {
            error_kind,
            message,
        }) = &item
        {
            failure = Some(format!("{error_kind}: {message}"));
        }
        for frame in encoder.encode(&item) {
            stdout.write_all(frame.as_bytes()).await?;
        }
        stdout.flush().await?;
    }
    Ok((items.into_inner(), failure))
}

async fn write_buffered(stream: &mut ExecutionStream, model: &str) -> Result<Option<String>> {
    match collect_completion(stream, model).await {
        Ok(completion) => {
            let json = serde_json::to_string_pretty(&completion)
                .context("Failed to serialize completion")?;
            let mut stdout = tokio::io::stdout();
            stdout.write_all(json.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
            Ok(None)
        }
        Err(e) => Ok(Some(e.to_string())),
    }
}

// ============================================================================
// Commands
// ============================================================================

async fn run(config: RelayConfigFile, args: RunArgs) -> Result<()> {
    let [program, rest @ ..] = args.command.as_slice() else {
        bail!("No program given");
    };
    let mut invocation = PreparedInvocation::new(program.clone()).args(rest.iter().cloned());
    if args.stdin {
        invocation = invocation.with_stdin(read_prompt().await?);
    }

    let registry = build_registry(&config, args.claude_sessions);
    let shutdown = CancellationToken::new();
    let scheduler = CleanupScheduler::new(registry.clone(), config.scheduler_config());
    let background = CleanupScheduler::new(registry.clone(), config.scheduler_config())
        .spawn(shutdown.clone());

    let execute = config.execute_config();
    let keepalive = execute.keepalive_interval;
    let relay = Relay::new(registry);

    info!(
        program = %program,
        mode = ?execute.mode,
        format = ?execute.output_format,
        "Running invocation"
    );
    let mut stream = relay.execute(invocation, execute);
    cancel_on_interrupt(stream.cancellation_token());

    let failure = if args.sse {
        let (returned, failure) = write_sse(stream, keepalive, &args.model).await?;
        stream = returned;
        failure
    } else if args.buffered {
        write_buffered(&mut stream, &args.model).await?
    } else {
        write_plain(&mut stream).await?
    };

    let cancelled = stream.cancellation_token().is_cancelled();
    if let Some(id) = stream.finish().await {
        info!(sandbox_id = %id, "Request released its sandbox");
    }

    let left = scheduler.drain(EXIT_DRAIN_LIMIT).await;
    if left > 0 {
        warn!(pending = left, "Sandboxes still pending at exit, next sweep reclaims them");
    }
    shutdown.cancel();
    if let Err(e) = background.await {
        warn!(error = %e, "Cleanup scheduler task failed");
    }

    if let Some(failure) = failure {
        bail!("Request failed: {failure}");
    }
    if cancelled {
        bail!("Request cancelled");
    }
    Ok(())
}

async fn sweep(config: &RelayConfigFile) -> Result<()> {
    let registry = SandboxRegistry::new(config.registry_config());
    let report = CleanupScheduler::new(registry, config.scheduler_config())
        .reclaim_on_startup()
        .await;
    println!(
        "reclaimed {} leased, removed {} orphaned, {} pending, {} failed",
        report.leases_reclaimed, report.orphans_removed, report.leases_pending, report.failed
    );
    if report.failed > 0 {
        bail!("{} sandboxes could not be reclaimed", report.failed);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging first
    init_logging(&args.log_level);

    info!("Relay Daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config_path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(config_path.clone())
        .with_context(|| format!("Failed to load configuration: {config_path:?}"))?;

    match args.command {
        Command::Run(run_args) => {
            run_args.overrides().apply(&mut config);
            config
                .validate()
                .context("Invalid configuration after command-line overrides")?;
            info!(source = %config.source(), "Configuration loaded");
            run(config, run_args).await
        }
        Command::Sweep => sweep(&config).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_args_parse() {
        let args = Args::try_parse_from([
            "relay-daemon",
            "run",
            "--mode",
            "progress",
            "--format",
            "plain-text",
            "--timeout-ms",
            "5000",
            "--sse",
            "--",
            "claude",
            "-p",
            "--verbose",
        ])
        .unwrap();

        let Command::Run(run) = args.command else {
            panic!("expected run");
        };
        assert_eq!(run.mode, Some(EmissionMode::Progress));
        assert_eq!(run.format, Some(OutputFormat::PlainText));
        assert!(run.sse);
        assert_eq!(run.command, vec!["claude", "-p", "--verbose"]);
        assert_eq!(args.log_level, "info");
    }

    #[test]
    fn test_sse_conflicts_with_buffered() {
        let result =
            Args::try_parse_from(["relay-daemon", "run", "--sse", "--buffered", "--", "true"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_overrides_applied() {
        let args = Args::try_parse_from([
            "relay-daemon",
            "run",
            "--timeout-ms",
            "1500",
            "--cleanup-delay-ms",
            "0",
            "--",
            "true",
        ])
        .unwrap();
        let Command::Run(run) = args.command else {
            panic!("expected run");
        };

        let mut config = RelayConfigFile::default();
        run.overrides().apply(&mut config);
        let execute = config.execute_config();
        assert_eq!(execute.timeout, Duration::from_millis(1500));
        assert_eq!(execute.cleanup_delay, Duration::ZERO);
    }

    #[test]
    fn test_program_required() {
        assert!(Args::try_parse_from(["relay-daemon", "run"]).is_err());
    }

    #[test]
    fn test_sweep_parses() {
        let args = Args::try_parse_from(["relay-daemon", "sweep", "-l", "debug"]).unwrap();
        assert!(matches!(args.command, Command::Sweep));
        assert_eq!(args.log_level, "debug");
    }

    fn sweep_config(root: &std::path::Path) -> RelayConfigFile {
        let mut config = RelayConfigFile::default();
        config.sandbox_root = root.to_path_buf();
        config.orphan_grace = Duration::ZERO;
        config
    }

    #[tokio::test]
    async fn test_sweep_removes_orphaned_sandboxes() {
        let root = tempfile::tempdir().unwrap();
        let orphan = root.path().join(relay_core::SandboxId::new().dir_name());
        tokio::fs::create_dir_all(orphan.join("work")).await.unwrap();
        tokio::fs::write(root.path().join("README"), b"keep me")
            .await
            .unwrap();

        sweep(&sweep_config(root.path())).await.unwrap();
        assert!(!orphan.exists());
        assert!(root.path().join("README").exists());
    }

    #[tokio::test]
    async fn test_sweep_missing_root_is_ok() {
        let root = tempfile::tempdir().unwrap();
        sweep(&sweep_config(&root.path().join("absent"))).await.unwrap();
    }

    #[tokio::test]
    async fn test_sweep_fails_when_root_unreadable() {
        let root = tempfile::tempdir().unwrap();
        let file = root.path().join("not-a-dir");
        tokio::fs::write(&file, b"").await.unwrap();

        let err = sweep(&sweep_config(&file)).await.unwrap_err();
        assert!(err.to_string().contains("could not be reclaimed"));
    }
}
