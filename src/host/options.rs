//! Execution options carried by every work item and command submission.

use crate::config::HostSettings;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Insertion priority for queued work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Appended to the back of the queue
    #[default]
    Normal,
    /// Ahead of every Normal item, behind earlier Next items
    Next,
}

/// Scheduling options for a work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecutionOptions {
    pub priority: Priority,
    /// Must not be picked up by idle processing while the reader waits for input
    pub must_run_in_foreground: bool,
    /// Cancels whatever is currently running and runs before the next prompt
    pub interrupt_current_foreground: bool,
    /// Needs the engine to itself, outside of any reader callback
    pub exclusive: bool,
}

impl ExecutionOptions {
    pub fn next() -> Self {
        Self {
            priority: Priority::Next,
            ..Self::default()
        }
    }

    pub fn foreground() -> Self {
        Self {
            must_run_in_foreground: true,
            ..Self::default()
        }
    }

    pub fn interrupting() -> Self {
        Self {
            priority: Priority::Next,
            must_run_in_foreground: true,
            interrupt_current_foreground: true,
            exclusive: false,
        }
    }

    /// Whether idle processing has to hand this item back to the main loop
    pub fn requires_foreground(&self) -> bool {
        self.must_run_in_foreground || self.exclusive
    }
}

/// Options for submitting an engine command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOptions {
    #[serde(flatten)]
    pub execution: ExecutionOptions,
    pub add_to_history: bool,
    pub write_output_to_host: bool,
    /// When false an engine fault is reported and the command completes with no output
    pub throw_on_error: bool,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            execution: ExecutionOptions::default(),
            add_to_history: false,
            write_output_to_host: false,
            throw_on_error: true,
        }
    }
}

impl CommandOptions {
    /// Options used for input typed at the interactive prompt
    pub fn interactive() -> Self {
        Self {
            execution: ExecutionOptions::foreground(),
            add_to_history: true,
            write_output_to_host: true,
            throw_on_error: true,
        }
    }

    pub fn with_execution(mut self, execution: ExecutionOptions) -> Self {
        self.execution = execution;
        self
    }
}

/// Options handed to the pipeline thread when the host starts
#[derive(Debug, Clone)]
pub struct HostStartOptions {
    pub repl_enabled: bool,
    pub poll_interval: Duration,
    pub default_prompt: String,
    pub max_nesting_depth: usize,
    pub idle_event_name: String,
    pub module_paths: Vec<PathBuf>,
    pub profile_paths: Vec<PathBuf>,
    pub initial_working_directory: Option<PathBuf>,
}

impl Default for HostStartOptions {
    fn default() -> Self {
        Self::from(&HostSettings::default())
    }
}

impl From<&HostSettings> for HostStartOptions {
    fn from(settings: &HostSettings) -> Self {
        Self {
            repl_enabled: settings.repl_enabled,
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            default_prompt: settings.default_prompt.clone(),
            max_nesting_depth: settings.max_nesting_depth,
            idle_event_name: settings.idle_event_name.clone(),
            module_paths: settings.module_paths.clone(),
            profile_paths: settings.profile_paths.clone(),
            initial_working_directory: settings.initial_working_directory.clone(),
        }
    }
}
