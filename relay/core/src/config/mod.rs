//! TOML Configuration File Support
//!
//! Centralized configuration loading for the relay, from a TOML file at
//! `~/.config/cli-relay/relay.toml`.
//!
//! # Configuration Priority
//!
//! Values are loaded with the following priority (highest first):
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables (`RELAY_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [execution]
//! timeout_ms = 600000
//! kill_grace_ms = 2000
//! emission_mode = "final_only"
//! output_format = "stream_json"
//! redact_sandbox_paths = true
//!
//! [keepalive]
//! interval_ms = 15000
//!
//! [progress]
//! min_interval_ms = 2000
//! max_interval_ms = 30000
//! backoff_factor = 2
//! repeat_limit = 3
//!
//! [sandbox]
//! root = "/tmp/cli-relay"
//! cleanup_delay_ms = 60000
//! cancel_cleanup = "deferred"
//! sweep_interval_ms = 10000
//! orphan_grace_ms = 3600000
//! ```

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cleanup::SchedulerConfig;
use crate::parser::{OutputFormat, DEFAULT_MAX_RECORD_BYTES};
use crate::process::ProcessConfig;
use crate::sandbox::RegistryConfig;
use crate::translate::{EmissionMode, MarkerPolicy};

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// Policy Enums
// =============================================================================

/// What happens to a sandbox when its client goes away
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelCleanup {
    /// Follow the normal cleanup delay
    #[default]
    Deferred,
    /// Clean as soon as the subprocess is gone
    Immediate,
}

impl FromStr for CancelCleanup {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "deferred" | "delayed" => Ok(Self::Deferred),
            "immediate" | "now" => Ok(Self::Immediate),
            other => Err(format!("unknown cancel cleanup policy: {other}")),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Execution section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionToml {
    /// Per-request subprocess timeout in milliseconds
    pub timeout_ms: Option<u64>,

    /// SIGTERM to SIGKILL grace in milliseconds
    pub kill_grace_ms: Option<u64>,

    /// Default emission mode
    pub emission_mode: Option<EmissionMode>,

    /// Default provider output format
    pub output_format: Option<OutputFormat>,

    /// Whether sandbox paths are scrubbed from client output
    pub redact_sandbox_paths: Option<bool>,

    /// Maximum size of a single provider record in bytes
    pub max_record_bytes: Option<usize>,
}

/// Keepalive section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeepaliveToml {
    /// Idle interval before a keepalive in milliseconds (0 disables)
    pub interval_ms: Option<u64>,
}

/// Progress marker section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressToml {
    /// Silence before the first marker in milliseconds
    pub min_interval_ms: Option<u64>,

    /// Upper bound between markers in milliseconds
    pub max_interval_ms: Option<u64>,

    /// Interval multiplier after each marker
    pub backoff_factor: Option<u32>,

    /// Markers per rotation phase
    pub repeat_limit: Option<u32>,
}

/// Sandbox section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxToml {
    /// Directory under which sandboxes are created
    pub root: Option<PathBuf>,

    /// Delay before a finished sandbox is removed, in milliseconds
    pub cleanup_delay_ms: Option<u64>,

    /// Cleanup policy on client cancellation
    pub cancel_cleanup: Option<CancelCleanup>,

    /// Cleanup sweep period in milliseconds
    pub sweep_interval_ms: Option<u64>,

    /// Age after which unleased sandbox directories are reclaimed, in milliseconds
    pub orphan_grace_ms: Option<u64>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayToml {
    /// Execution configuration section
    pub execution: ExecutionToml,

    /// Keepalive configuration section
    pub keepalive: KeepaliveToml,

    /// Progress marker configuration section
    pub progress: ProgressToml,

    /// Sandbox configuration section
    pub sandbox: SandboxToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Centralized configuration for the relay
///
/// Use [`load_config`] to load it with proper priority handling.
#[derive(Clone, Debug)]
pub struct RelayConfigFile {
    /// Subprocess timeout
    pub timeout: Duration,

    /// SIGTERM to SIGKILL grace
    pub kill_grace: Duration,

    /// Default emission mode
    pub emission_mode: EmissionMode,

    /// Default provider output format
    pub output_format: OutputFormat,

    /// Scrub sandbox paths from client output
    pub redact_sandbox_paths: bool,

    /// Per-record size cap for the event parser
    pub max_record_bytes: usize,

    /// Keepalive interval (zero disables)
    pub keepalive_interval: Duration,

    /// Progress marker schedule
    pub markers: MarkerPolicy,

    /// Sandbox root directory
    pub sandbox_root: PathBuf,

    /// Delay before a finished sandbox is removed
    pub cleanup_delay: Duration,

    /// Cleanup policy on cancellation
    pub cancel_cleanup: CancelCleanup,

    /// Cleanup sweep period
    pub sweep_interval: Duration,

    /// Age after which unleased sandbox directories are reclaimed
    pub orphan_grace: Duration,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for RelayConfigFile {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(600_000),
            kill_grace: Duration::from_millis(2000),
            emission_mode: EmissionMode::FinalOnly,
            output_format: OutputFormat::StreamJson,
            redact_sandbox_paths: true,
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
            keepalive_interval: Duration::from_millis(15_000),
            markers: MarkerPolicy::default(),
            sandbox_root: std::env::temp_dir().join("cli-relay"),
            cleanup_delay: Duration::from_millis(60_000),
            cancel_cleanup: CancelCleanup::Deferred,
            sweep_interval: Duration::from_millis(10_000),
            orphan_grace: Duration::from_millis(3_600_000),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl RelayConfigFile {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] describing the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "execution.timeout_ms must be positive".to_string(),
            ));
        }
        if self.markers.min_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "progress.min_interval_ms must be positive".to_string(),
            ));
        }
        if self.markers.min_interval > self.markers.max_interval {
            return Err(ConfigError::ValidationError(format!(
                "progress.min_interval_ms ({}) exceeds max_interval_ms ({})",
                self.markers.min_interval.as_millis(),
                self.markers.max_interval.as_millis()
            )));
        }
        if self.markers.backoff_factor == 0 || self.markers.repeat_limit == 0 {
            return Err(ConfigError::ValidationError(
                "progress.backoff_factor and repeat_limit must be at least 1".to_string(),
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "sandbox.sweep_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Per-request settings derived from this configuration
    #[must_use]
    pub fn execute_config(&self) -> ExecuteConfig {
        ExecuteConfig {
            timeout: self.timeout,
            kill_grace: self.kill_grace,
            keepalive_interval: self.keepalive_interval,
            cleanup_delay: self.cleanup_delay,
            cancel_cleanup: self.cancel_cleanup,
            mode: self.emission_mode,
            markers: self.markers,
            output_format: self.output_format,
            redact_sandbox_paths: self.redact_sandbox_paths,
            max_record_bytes: self.max_record_bytes,
        }
    }

    /// Sandbox registry settings
    #[must_use]
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig::default().with_root(self.sandbox_root.clone())
    }

    /// Cleanup scheduler settings
    #[must_use]
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            sweep_interval: self.sweep_interval,
            orphan_grace: self.orphan_grace,
            ..SchedulerConfig::default()
        }
    }
}

// =============================================================================
// Per-request configuration
// =============================================================================

/// Settings for one `execute` call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecuteConfig {
    /// Subprocess timeout
    pub timeout: Duration,
    /// SIGTERM to SIGKILL grace
    pub kill_grace: Duration,
    /// Keepalive interval (zero disables)
    pub keepalive_interval: Duration,
    /// Delay before the sandbox is removed after a normal finish
    pub cleanup_delay: Duration,
    /// Cleanup policy on cancellation
    pub cancel_cleanup: CancelCleanup,
    /// Emission mode
    pub mode: EmissionMode,
    /// Progress marker schedule
    pub markers: MarkerPolicy,
    /// Provider output format
    pub output_format: OutputFormat,
    /// Scrub sandbox paths from client output
    pub redact_sandbox_paths: bool,
    /// Per-record size cap for the event parser
    pub max_record_bytes: usize,
}

impl Default for ExecuteConfig {
    fn default() -> Self {
        RelayConfigFile::default().execute_config()
    }
}

impl ExecuteConfig {
    /// Set the subprocess timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the kill grace
    #[must_use]
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Set the keepalive interval
    #[must_use]
    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Set the cleanup delay
    #[must_use]
    pub fn with_cleanup_delay(mut self, delay: Duration) -> Self {
        self.cleanup_delay = delay;
        self
    }

    /// Set the cancellation cleanup policy
    #[must_use]
    pub fn with_cancel_cleanup(mut self, policy: CancelCleanup) -> Self {
        self.cancel_cleanup = policy;
        self
    }

    /// Set the emission mode
    #[must_use]
    pub fn with_mode(mut self, mode: EmissionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the progress marker schedule
    #[must_use]
    pub fn with_markers(mut self, markers: MarkerPolicy) -> Self {
        self.markers = markers;
        self
    }

    /// Set the provider output format
    #[must_use]
    pub fn with_output_format(mut self, format: OutputFormat) -> Self {
        self.output_format = format;
        self
    }

    /// Enable or disable sandbox path redaction
    #[must_use]
    pub fn with_redaction(mut self, enabled: bool) -> Self {
        self.redact_sandbox_paths = enabled;
        self
    }

    /// Subprocess supervision settings
    #[must_use]
    pub fn process_config(&self) -> ProcessConfig {
        ProcessConfig::default()
            .with_timeout(self.timeout)
            .with_kill_grace(self.kill_grace)
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/cli-relay/relay.toml` or
/// `~/.config/cli-relay/relay.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("cli-relay").join("relay.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if the
/// merged values are inconsistent. A missing config file is not an error.
pub fn load_config() -> Result<RelayConfigFile, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<RelayConfigFile, ConfigError> {
    let mut config = RelayConfigFile::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: RelayToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config);
    config.validate()?;

    Ok(config)
}

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut RelayConfigFile, toml: &RelayToml) {
    // Execution
    if let Some(timeout) = toml.execution.timeout_ms {
        config.timeout = ms(timeout);
    }
    if let Some(grace) = toml.execution.kill_grace_ms {
        config.kill_grace = ms(grace);
    }
    if let Some(mode) = toml.execution.emission_mode {
        config.emission_mode = mode;
    }
    if let Some(format) = toml.execution.output_format {
        config.output_format = format;
    }
    if let Some(redact) = toml.execution.redact_sandbox_paths {
        config.redact_sandbox_paths = redact;
    }
    if let Some(max) = toml.execution.max_record_bytes {
        config.max_record_bytes = max;
    }

    // Keepalive
    if let Some(interval) = toml.keepalive.interval_ms {
        config.keepalive_interval = ms(interval);
    }

    // Progress markers
    if let Some(min) = toml.progress.min_interval_ms {
        config.markers.min_interval = ms(min);
    }
    if let Some(max) = toml.progress.max_interval_ms {
        config.markers.max_interval = ms(max);
    }
    if let Some(factor) = toml.progress.backoff_factor {
        config.markers.backoff_factor = factor;
    }
    if let Some(limit) = toml.progress.repeat_limit {
        config.markers.repeat_limit = limit;
    }

    // Sandbox
    if let Some(ref root) = toml.sandbox.root {
        config.sandbox_root = root.clone();
    }
    if let Some(delay) = toml.sandbox.cleanup_delay_ms {
        config.cleanup_delay = ms(delay);
    }
    if let Some(policy) = toml.sandbox.cancel_cleanup {
        config.cancel_cleanup = policy;
    }
    if let Some(interval) = toml.sandbox.sweep_interval_ms {
        config.sweep_interval = ms(interval);
    }
    if let Some(grace) = toml.sandbox.orphan_grace_ms {
        config.orphan_grace = ms(grace);
    }
}

fn env_parsed<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}

/// Apply environment variable overrides to the config
fn apply_env_config(config: &mut RelayConfigFile) {
    if let Some(timeout) = env_parsed::<u64>("RELAY_TIMEOUT_MS") {
        config.timeout = ms(timeout);
        config.source = ConfigSource::Env;
    }
    if let Some(grace) = env_parsed::<u64>("RELAY_KILL_GRACE_MS") {
        config.kill_grace = ms(grace);
        config.source = ConfigSource::Env;
    }
    if let Some(mode) = env_parsed::<EmissionMode>("RELAY_EMISSION_MODE") {
        config.emission_mode = mode;
        config.source = ConfigSource::Env;
    }
    if let Some(interval) = env_parsed::<u64>("RELAY_KEEPALIVE_INTERVAL_MS") {
        config.keepalive_interval = ms(interval);
        config.source = ConfigSource::Env;
    }
    if let Ok(root) = std::env::var("RELAY_SANDBOX_ROOT") {
        if !root.is_empty() {
            config.sandbox_root = PathBuf::from(root);
            config.source = ConfigSource::Env;
        }
    }
    if let Some(delay) = env_parsed::<u64>("RELAY_CLEANUP_DELAY_MS") {
        config.cleanup_delay = ms(delay);
        config.source = ConfigSource::Env;
    }
    if let Some(policy) = env_parsed::<CancelCleanup>("RELAY_CANCEL_CLEANUP") {
        config.cancel_cleanup = policy;
        config.source = ConfigSource::Env;
    }
    if let Some(interval) = env_parsed::<u64>("RELAY_SWEEP_INTERVAL_MS") {
        config.sweep_interval = ms(interval);
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Timeout override (milliseconds)
    pub timeout_ms: Option<u64>,

    /// Keepalive interval override (milliseconds)
    pub keepalive_interval_ms: Option<u64>,

    /// Emission mode override
    pub emission_mode: Option<EmissionMode>,

    /// Output format override
    pub output_format: Option<OutputFormat>,

    /// Sandbox root override
    pub sandbox_root: Option<PathBuf>,

    /// Cleanup delay override (milliseconds)
    pub cleanup_delay_ms: Option<u64>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set timeout override
    #[must_use]
    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    /// Set keepalive interval override
    #[must_use]
    pub fn with_keepalive_interval_ms(mut self, ms: u64) -> Self {
        self.keepalive_interval_ms = Some(ms);
        self
    }

    /// Set emission mode override
    #[must_use]
    pub fn with_emission_mode(mut self, mode: EmissionMode) -> Self {
        self.emission_mode = Some(mode);
        self
    }

    /// Set output format override
    #[must_use]
    pub fn with_output_format(mut self, format: OutputFormat) -> Self {
        self.output_format = Some(format);
        self
    }

    /// Set sandbox root override
    #[must_use]
    pub fn with_sandbox_root(mut self, root: PathBuf) -> Self {
        self.sandbox_root = Some(root);
        self
    }

    /// Set cleanup delay override
    #[must_use]
    pub fn with_cleanup_delay_ms(mut self, ms: u64) -> Self {
        self.cleanup_delay_ms = Some(ms);
        self
    }

    fn is_empty(&self) -> bool {
        self.timeout_ms.is_none()
            && self.keepalive_interval_ms.is_none()
            && self.emission_mode.is_none()
            && self.output_format.is_none()
            && self.sandbox_root.is_none()
            && self.cleanup_delay_ms.is_none()
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut RelayConfigFile) {
        if !self.is_empty() {
            config.source = ConfigSource::Cli;
        }
        if let Some(timeout) = self.timeout_ms {
            config.timeout = ms(timeout);
        }
        if let Some(interval) = self.keepalive_interval_ms {
            config.keepalive_interval = ms(interval);
        }
        if let Some(mode) = self.emission_mode {
            config.emission_mode = mode;
        }
        if let Some(format) = self.output_format {
            config.output_format = format;
        }
        if let Some(ref root) = self.sandbox_root {
            config.sandbox_root = root.clone();
        }
        if let Some(delay) = self.cleanup_delay_ms {
            config.cleanup_delay = ms(delay);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
