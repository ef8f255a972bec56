//! Relay Core - Sandboxed CLI-Model Execution for Chat-Completion Clients
//!
//! This crate runs agentic command-line model tools (Claude, Gemini, Qwen and
//! friends) as subprocesses inside throwaway sandboxes and translates their
//! output into a clean, client-facing chunk stream. The HTTP layer that frames
//! those chunks is someone else's job; [`wire`] offers OpenAI-compatible
//! framing for it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         Relay::execute                            │
//! │                                                                    │
//! │  SandboxRegistry ──► ProcessOrchestrator ──► EventParser           │
//! │   (allocate)          (spawn, timeout,        (bytes → events)     │
//! │       ▲                cancel, reap)               │               │
//! │       │                                            ▼               │
//! │       │                                     StreamTranslator       │
//! │       │                                 (FinalOnly / Progress)     │
//! │       │                                            │               │
//! │  SandboxLease ◄── release on termination           ▼               │
//! │       │                                   KeepaliveMultiplexer     │
//! │       ▼                                            │               │
//! │  CleanupScheduler (background sweep)               ▼               │
//! │                                              client chunks         │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Relay`]: the entry point; one [`ExecutionStream`] per request
//! - [`SandboxRegistry`]: shared table of sandbox directories and deadlines
//! - [`ProcessOrchestrator`]: subprocess supervision
//! - [`EventParser`]: incremental provider output parsing
//! - [`StreamTranslator`]: provider events to [`StreamChunk`]s
//! - [`KeepaliveMultiplexer`]: idle-gap keepalives
//! - [`CleanupScheduler`]: deferred and startup sandbox reclamation
//!
//! # Quick Start
//!
//! ```ignore
//! use futures::StreamExt;
//! use relay_core::{load_config, PreparedInvocation, Relay, SandboxRegistry};
//!
//! let config = load_config()?;
//! let relay = Relay::new(SandboxRegistry::new(config.registry_config()));
//!
//! let invocation = PreparedInvocation::new("claude")
//!     .args(["-p", "--output-format", "stream-json", "--verbose"])
//!     .with_stdin("Say hello");
//!
//! let mut chunks = relay.execute_multiplexed(invocation, config.execute_config());
//! while let Some(item) = chunks.next().await {
//!     // frame onto the transport
//! }
//! ```

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cleanup;
pub mod config;
pub mod error;
pub mod keepalive;
pub mod parser;
pub mod pipeline;
pub mod process;
pub mod sandbox;
pub mod translate;
pub mod wire;

// Re-exports for convenience
pub use cleanup::{CleanupScheduler, ReclaimReport, SchedulerConfig, SweepReport};
pub use config::{
    default_config_path, load_config, load_config_from_path, CancelCleanup, ConfigError,
    ConfigOverrides, ConfigSource, ExecuteConfig, RelayConfigFile,
};
pub use error::{ErrorKind, RelayError};
pub use keepalive::{KeepaliveMultiplexer, Multiplexed};
pub use parser::{EventParser, OutputFormat, ProviderEvent, ProviderEventKind};
pub use pipeline::{ExecutionStream, Relay, SandboxLease};
pub use process::{PreparedInvocation, ProcessConfig, ProcessOrchestrator};
pub use sandbox::{
    ClaudeProjectArtifacts, EnvPolicy, NoArtifacts, RegistryConfig, SandboxId, SandboxRegistry,
    SandboxSession, SandboxState, SessionArtifacts,
};
pub use translate::{EmissionMode, MarkerPolicy, StreamChunk, StreamTranslator};
