//! Coordinator Configuration
//!
//! A coordinator is configured with the model to host, its category, where
//! it should run, and an optional device hint. Values can come from code,
//! from environment variables, or from a TOML file at
//! `$XDG_CONFIG_HOME/modelhost/modelhost.toml`.
//!
//! # Configuration Priority
//!
//! 1. Environment variables
//! 2. TOML configuration file
//! 3. Default values
//!
//! # Environment Variables
//!
//! - `MODELHOST_MODEL`: model identifier
//! - `MODELHOST_CATEGORY`: category name (e.g. `image-classification`)
//! - `MODELHOST_ISOLATION`: `direct`, `thread` or `process`
//! - `MODELHOST_DEVICE`: `gpu`, or per submodule `encoder=gpu,decoder=cpu`
//! - `MODELHOST_WORKER`: worker program for process isolation
//! - `MODELHOST_WORKER_ARGS`: whitespace-separated worker arguments
//! - `MODELHOST_EXIT_GRACE_MS`: how long to wait for a dead context's exit reason
//!
//! # Example Configuration
//!
//! ```toml
//! [coordinator]
//! model = "Xenova/detr-resnet-50"
//! category = "object-detection"
//! isolation = "process"
//! device = { encoder_model = "webgpu", decoder_model_merged = "wasm" }
//! worker = "/usr/local/bin/modelhost-worker"
//! worker_args = ["--latency-ms", "0"]
//! exit_grace_ms = 500
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::category::Category;
use crate::device::DeviceHint;
use crate::protocol::LoadPayload;

/// Default wait for an isolated context's exit reason after its stream ends
pub const DEFAULT_EXIT_GRACE: Duration = Duration::from_millis(500);

/// Name of the worker binary used for process isolation
pub const WORKER_BINARY: &str = "modelhost-worker";

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

/// Where the effective configuration came from
///
/// Reports the highest-priority source that contributed a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Environment variables
    Env,
    /// TOML configuration file
    File,
    /// Built-in defaults only
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// Runtime Configuration
// =============================================================================

/// Where a coordinator runs its model
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum IsolationMode {
    /// In the caller's own task
    Direct,
    /// On a dedicated thread with its own runtime
    #[default]
    Thread,
    /// In a worker child process
    Process {
        /// Worker program
        program: PathBuf,
        /// Worker arguments
        args: Vec<String>,
    },
}

impl IsolationMode {
    /// Process isolation with the default worker program
    #[must_use]
    pub fn process() -> Self {
        Self::Process {
            program: default_worker_path(),
            args: Vec::new(),
        }
    }

    /// Whether the model runs outside the caller's context
    #[must_use]
    pub fn is_isolated(&self) -> bool {
        !matches!(self, Self::Direct)
    }

    /// Parse an isolation name
    ///
    /// `worker` and `args` only matter for `process`.
    fn parse(value: &str, worker: Option<PathBuf>, args: Vec<String>) -> Result<Self, ConfigError> {
        match value.trim().to_lowercase().as_str() {
            "direct" | "inprocess" | "in-process" | "false" | "0" => Ok(Self::Direct),
            "thread" | "isolated" | "true" | "1" => Ok(Self::Thread),
            "process" => Ok(Self::Process {
                program: worker.unwrap_or_else(default_worker_path),
                args,
            }),
            other => Err(ConfigError::ValidationError(format!(
                "unknown isolation mode '{other}' (expected direct, thread or process)"
            ))),
        }
    }
}

/// Configuration of one coordinator
#[derive(Clone, Debug, PartialEq)]
pub struct CoordinatorConfig {
    /// Model identifier handed to the runtime
    pub model: String,
    /// Category the model is hosted for
    pub category: Category,
    /// Where the model runs
    pub isolation: IsolationMode,
    /// Device placement
    pub device: Option<DeviceHint>,
    /// Wait for an isolated context's exit reason after its stream ends
    pub context_exit_grace: Duration,
}

impl CoordinatorConfig {
    /// Configuration with an isolated (thread) context and no device hint
    pub fn new(model: impl Into<String>, category: Category) -> Self {
        Self {
            model: model.into(),
            category,
            isolation: IsolationMode::default(),
            device: None,
            context_exit_grace: DEFAULT_EXIT_GRACE,
        }
    }

    /// Run in an isolated thread context (`true`) or directly (`false`)
    #[must_use]
    pub fn with_isolation(mut self, use_isolated_context: bool) -> Self {
        self.isolation = if use_isolated_context {
            IsolationMode::Thread
        } else {
            IsolationMode::Direct
        };
        self
    }

    /// Choose the isolation mode explicitly
    #[must_use]
    pub fn with_isolation_mode(mut self, isolation: IsolationMode) -> Self {
        self.isolation = isolation;
        self
    }

    /// Set the device hint
    #[must_use]
    pub fn with_device(mut self, device: impl Into<DeviceHint>) -> Self {
        self.device = Some(device.into());
        self
    }

    /// Set how long to wait for a dead context's exit reason
    #[must_use]
    pub fn with_exit_grace(mut self, grace: Duration) -> Self {
        self.context_exit_grace = grace;
        self
    }

    /// Whether the model runs outside the caller's context
    #[must_use]
    pub fn is_isolated(&self) -> bool {
        self.isolation.is_isolated()
    }

    /// Payload of the load request for this configuration
    #[must_use]
    pub fn load_payload(&self) -> LoadPayload {
        LoadPayload::new(&self.model, self.category).with_device(self.device.clone())
    }

    /// Create configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` if the model or category is missing or a
    /// value does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        load_config_with_env(None, |key| std::env::var(key).ok()).map(|r| r.coordinator)
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// `[coordinator]` section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorToml {
    /// Model identifier
    pub model: Option<String>,

    /// Category name
    pub category: Option<String>,

    /// `direct`, `thread` or `process`
    pub isolation: Option<String>,

    /// Device hint, a device name or a table of submodule devices
    pub device: Option<DeviceHint>,

    /// Worker program for process isolation
    pub worker: Option<PathBuf>,

    /// Worker arguments
    pub worker_args: Option<Vec<String>>,

    /// Exit-reason grace period in milliseconds
    pub exit_grace_ms: Option<u64>,
}

/// Root of the TOML configuration file
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelhostToml {
    /// Coordinator settings
    pub coordinator: CoordinatorToml,
}

/// Configuration resolved from every source
#[derive(Clone, Debug)]
pub struct ResolvedConfig {
    /// The effective coordinator configuration
    pub coordinator: CoordinatorConfig,
    /// Highest-priority source that contributed
    pub source: ConfigSource,
    /// Config file that was read, if any
    pub config_file_path: Option<PathBuf>,
}

// =============================================================================
// Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/modelhost/modelhost.toml` or the platform
/// equivalent.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("modelhost").join("modelhost.toml"))
}

/// Worker program next to the current executable, or `modelhost-worker` on `PATH`
#[must_use]
pub fn default_worker_path() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(WORKER_BINARY)))
        .filter(|candidate| candidate.is_file())
        .unwrap_or_else(|| PathBuf::from(WORKER_BINARY))
}

/// Load configuration from the default file and the environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be read or parsed,
/// or if the merged configuration is incomplete.
pub fn load_config() -> Result<ResolvedConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific file and the environment
///
/// A missing file is not an error.
///
/// # Errors
///
/// See [`load_config`].
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<ResolvedConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration from a file and an arbitrary variable lookup
///
/// # Errors
///
/// See [`load_config`].
pub fn load_config_with_env<F>(path: Option<PathBuf>, env: F) -> Result<ResolvedConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut raw = CoordinatorToml::default();
    let mut source = ConfigSource::Default;
    let mut config_file_path = None;

    if let Some(config_path) = path {
        if config_path.exists() {
            raw = read_toml(&config_path)?.coordinator;
            source = ConfigSource::File;
            tracing::info!(path = %config_path.display(), "Loaded configuration from file");
            config_file_path = Some(config_path);
        } else {
            tracing::debug!(path = %config_path.display(), "Config file not found, using defaults");
        }
    }

    if apply_env_config(&mut raw, &env)? {
        source = ConfigSource::Env;
    }

    Ok(ResolvedConfig {
        coordinator: build(raw)?,
        source,
        config_file_path,
    })
}

fn read_toml(path: &Path) -> Result<ModelhostToml, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.to_path_buf(),
        source: e,
    })?;
    Ok(toml::from_str(&content)?)
}

/// Overlay environment variables; returns whether any were set
fn apply_env_config<F>(raw: &mut CoordinatorToml, env: &F) -> Result<bool, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut touched = false;

    if let Some(model) = env("MODELHOST_MODEL") {
        raw.model = Some(model);
        touched = true;
    }
    if let Some(category) = env("MODELHOST_CATEGORY") {
        raw.category = Some(category);
        touched = true;
    }
    if let Some(isolation) = env("MODELHOST_ISOLATION") {
        raw.isolation = Some(isolation);
        touched = true;
    }
    if let Some(device) = env("MODELHOST_DEVICE") {
        let hint = device
            .parse::<DeviceHint>()
            .map_err(|e| ConfigError::ValidationError(format!("MODELHOST_DEVICE: {e}")))?;
        raw.device = Some(hint);
        touched = true;
    }
    if let Some(worker) = env("MODELHOST_WORKER") {
        raw.worker = Some(PathBuf::from(worker));
        touched = true;
    }
    if let Some(args) = env("MODELHOST_WORKER_ARGS") {
        raw.worker_args = Some(args.split_whitespace().map(str::to_string).collect());
        touched = true;
    }
    if let Some(grace) = env("MODELHOST_EXIT_GRACE_MS") {
        if let Ok(ms) = grace.trim().parse() {
            raw.exit_grace_ms = Some(ms);
            touched = true;
        } else {
            tracing::warn!(value = %grace, "ignoring unparseable MODELHOST_EXIT_GRACE_MS");
        }
    }

    Ok(touched)
}

fn build(raw: CoordinatorToml) -> Result<CoordinatorConfig, ConfigError> {
    let model = raw
        .model
        .filter(|m| !m.trim().is_empty())
        .ok_or_else(|| {
            ConfigError::ValidationError(
                "no model configured (set MODELHOST_MODEL or [coordinator].model)".to_string(),
            )
        })?;

    let category = raw
        .category
        .ok_or_else(|| {
            ConfigError::ValidationError(
                "no category configured (set MODELHOST_CATEGORY or [coordinator].category)"
                    .to_string(),
            )
        })?
        .parse::<Category>()
        .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

    let isolation = match raw.isolation {
        Some(value) => {
            IsolationMode::parse(&value, raw.worker, raw.worker_args.unwrap_or_default())?
        }
        None => IsolationMode::default(),
    };

    Ok(CoordinatorConfig {
        model,
        category,
        isolation,
        device: raw.device,
        context_exit_grace: raw
            .exit_grace_ms
            .map_or(DEFAULT_EXIT_GRACE, Duration::from_millis),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn write_toml(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_builder_defaults() {
        let config = CoordinatorConfig::new("m", Category::Chat);
        assert_eq!(config.isolation, IsolationMode::Thread);
        assert!(config.is_isolated());
        assert_eq!(config.context_exit_grace, DEFAULT_EXIT_GRACE);

        let direct = config.with_isolation(false).with_device(Device::Cpu);
        assert_eq!(direct.isolation, IsolationMode::Direct);
        assert_eq!(direct.load_payload().device, Some(DeviceHint::Single(Device::Cpu)));
    }

    #[test]
    fn test_env_only() {
        let resolved = load_config_with_env(
            None,
            env_of(&[
                ("MODELHOST_MODEL", "Xenova/whisper-tiny"),
                ("MODELHOST_CATEGORY", "audio-text-to-text"),
                ("MODELHOST_ISOLATION", "direct"),
                ("MODELHOST_DEVICE", "encoder_model=webgpu,decoder_model_merged=wasm"),
            ]),
        )
        .unwrap();

        assert_eq!(resolved.source, ConfigSource::Env);
        let config = resolved.coordinator;
        assert_eq!(config.model, "Xenova/whisper-tiny");
        assert_eq!(config.category, Category::AudioTextToText);
        assert_eq!(config.isolation, IsolationMode::Direct);
        let device = config.device.unwrap();
        assert_eq!(device.for_module("encoder_model"), Some(Device::Webgpu));
    }

    #[test]
    fn test_file_then_env_override() {
        let file = write_toml(
            r#"
            [coordinator]
            model = "from-file"
            category = "object-detection"
            isolation = "process"
            worker = "/opt/modelhost/worker"
            worker_args = ["--latency-ms", "5"]
            device = { encoder_model = "gpu" }
            exit_grace_ms = 50
            "#,
        );

        let resolved =
            load_config_with_env(Some(file.path().to_path_buf()), env_of(&[])).unwrap();
        assert_eq!(resolved.source, ConfigSource::File);
        assert_eq!(resolved.config_file_path.as_deref(), Some(file.path()));
        let config = resolved.coordinator;
        assert_eq!(config.model, "from-file");
        assert_eq!(
            config.isolation,
            IsolationMode::Process {
                program: PathBuf::from("/opt/modelhost/worker"),
                args: vec!["--latency-ms".to_string(), "5".to_string()],
            }
        );
        assert_eq!(config.context_exit_grace, Duration::from_millis(50));

        let resolved = load_config_with_env(
            Some(file.path().to_path_buf()),
            env_of(&[("MODELHOST_MODEL", "from-env"), ("MODELHOST_ISOLATION", "thread")]),
        )
        .unwrap();
        assert_eq!(resolved.source, ConfigSource::Env);
        assert_eq!(resolved.coordinator.model, "from-env");
        assert_eq!(resolved.coordinator.category, Category::ObjectDetection);
        assert_eq!(resolved.coordinator.isolation, IsolationMode::Thread);
    }

    #[test]
    fn test_missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = load_config_with_env(
            Some(dir.path().join("absent.toml")),
            env_of(&[("MODELHOST_MODEL", "m"), ("MODELHOST_CATEGORY", "chat")]),
        )
        .unwrap();
        assert!(resolved.config_file_path.is_none());
    }

    #[test]
    fn test_validation_errors() {
        let missing_model = load_config_with_env(None, env_of(&[("MODELHOST_CATEGORY", "chat")]));
        assert!(matches!(missing_model, Err(ConfigError::ValidationError(_))));

        let bad_category = load_config_with_env(
            None,
            env_of(&[("MODELHOST_MODEL", "m"), ("MODELHOST_CATEGORY", "text-to-video")]),
        );
        assert!(matches!(bad_category, Err(ConfigError::ValidationError(ref m)) if m.contains("text-to-video")));

        let bad_isolation = load_config_with_env(
            None,
            env_of(&[
                ("MODELHOST_MODEL", "m"),
                ("MODELHOST_CATEGORY", "chat"),
                ("MODELHOST_ISOLATION", "container"),
            ]),
        );
        assert!(matches!(bad_isolation, Err(ConfigError::ValidationError(_))));

        let bad_device = load_config_with_env(None, env_of(&[("MODELHOST_DEVICE", "tpu")]));
        assert!(matches!(bad_device, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_parse_error() {
        let file = write_toml("[coordinator\nmodel = ");
        let result = load_config_with_env(Some(file.path().to_path_buf()), env_of(&[]));
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_isolation_aliases() {
        for (value, isolated) in [("inprocess", false), ("0", false), ("isolated", true), ("TRUE", true)] {
            let mode = IsolationMode::parse(value, None, Vec::new()).unwrap();
            assert_eq!(mode.is_isolated(), isolated, "{value}");
        }
    }
}
