//! Configuration System
//!
//! Layered host configuration: built-in defaults, the global config file,
//! workspace config files and `PSIC__*` environment variables, in increasing
//! order of precedence.

use crate::error::HostError;
use crate::logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

mod merge;
mod sources;

pub use sources::global_file::global_config_path;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Execution host settings
    #[serde(default)]
    pub host: HostSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Execution host settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostSettings {
    /// Run the interactive read-eval-print loop; poll the queue otherwise
    #[serde(default = "default_true")]
    pub repl_enabled: bool,

    /// Bounded wait per loop step when the REPL is off (milliseconds)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Prompt used when the engine's prompt function fails
    #[serde(default = "default_prompt")]
    pub default_prompt: String,

    /// Maximum execution frame depth
    #[serde(default = "default_max_nesting_depth")]
    pub max_nesting_depth: usize,

    /// Command modules imported at startup, in order
    #[serde(default)]
    pub module_paths: Vec<PathBuf>,

    /// Working directory set before anything else runs
    #[serde(default)]
    pub initial_working_directory: Option<PathBuf>,

    /// Profile scripts run at startup, in order
    #[serde(default)]
    pub profile_paths: Vec<PathBuf>,

    /// Engine event synthesized while the reader is idle
    #[serde(default = "default_idle_event_name")]
    pub idle_event_name: String,
}

fn default_true() -> bool {
    true
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_prompt() -> String {
    "PSIC> ".to_string()
}

fn default_max_nesting_depth() -> usize {
    64
}

fn default_idle_event_name() -> String {
    "engine.idle".to_string()
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            repl_enabled: default_true(),
            poll_interval_ms: default_poll_interval_ms(),
            default_prompt: default_prompt(),
            max_nesting_depth: default_max_nesting_depth(),
            module_paths: Vec::new(),
            initial_working_directory: None,
            profile_paths: Vec::new(),
            idle_event_name: default_idle_event_name(),
        }
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    Host(String),
    Logging(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Host(msg) => write!(f, "Host: {}", msg),
            ValidationError::Logging(msg) => write!(f, "Logging: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl HostSettings {
    fn validate(&self, errors: &mut Vec<ValidationError>) {
        if self.poll_interval_ms == 0 {
            errors.push(ValidationError::Host(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_nesting_depth == 0 {
            errors.push(ValidationError::Host(
                "max_nesting_depth must be at least 1".to_string(),
            ));
        }
        if self.default_prompt.is_empty() {
            errors.push(ValidationError::Host(
                "default_prompt cannot be empty".to_string(),
            ));
        }
    }
}

impl HostConfig {
    /// Validate the entire configuration, collecting every problem
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        self.host.validate(&mut errors);

        if !matches!(self.logging.format.as_str(), "json" | "text") {
            errors.push(ValidationError::Logging(format!(
                "unknown format '{}'",
                self.logging.format
            )));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Loads [`HostConfig`] from its layered sources
pub struct ConfigLoader;

impl ConfigLoader {
    /// Defaults only
    #[allow(clippy::should_implement_trait)]
    pub fn default() -> HostConfig {
        HostConfig::default()
    }

    /// Path of the global config file, if a config home can be resolved
    pub fn xdg_config_path() -> Option<PathBuf> {
        global_config_path()
    }

    /// Load every layer for the given workspace
    pub fn load(workspace_root: &Path) -> Result<HostConfig, HostError> {
        let builder = merge::merge_policy::builder_with_defaults()?;
        let builder = sources::global_file::add_to_builder(builder)?;
        let builder = sources::workspace_file::add_to_builder(builder, workspace_root)?;
        let builder = builder.add_source(Self::environment());

        let config: HostConfig = builder.build()?.try_deserialize()?;
        debug!(workspace = %workspace_root.display(), "Loaded configuration");
        Self::validated(config)
    }

    /// Load one explicit file over the defaults, environment still on top
    pub fn load_from_file(path: &Path) -> Result<HostConfig, HostError> {
        let config: HostConfig = merge::merge_policy::builder_with_defaults()?
            .add_source(config::File::from(path.to_path_buf()).required(true))
            .add_source(Self::environment())
            .build()?
            .try_deserialize()?;
        debug!(config_path = %path.display(), "Loaded configuration file");
        Self::validated(config)
    }

    fn environment() -> config::Environment {
        config::Environment::with_prefix("PSIC")
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
    }

    fn validated(config: HostConfig) -> Result<HostConfig, HostError> {
        config.validate().map_err(|errors| {
            let messages = errors.iter().map(ToString::to_string).collect::<Vec<_>>();
            HostError::Config(messages.join("; "))
        })?;
        Ok(config)
    }
}
