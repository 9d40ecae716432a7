//! Script engine collaborator interfaces
//!
//! The host never evaluates scripts itself. It drives a [`ScriptEngine`] bound
//! to a [`Session`], and reacts to debugger and session lifecycle events the
//! session reports through a [`SessionEventSink`].

use crate::error::EngineError;
use crate::host::cancellation::LinkedToken;
use crate::host::events::SessionEventSink;
use crate::reader::InteractiveSurface;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Identity of an engine session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(u64);

impl SessionId {
    pub fn next() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        SessionId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOrigin {
    Local,
    Remote,
}

/// Descriptive session metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub origin: SessionOrigin,
    pub display_name: String,
    pub host_name: String,
    pub version: String,
}

impl SessionInfo {
    pub fn local(display_name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: SessionId::next(),
            origin: SessionOrigin::Local,
            display_name: display_name.into(),
            host_name: "localhost".to_string(),
            version: version.into(),
        }
    }

    pub fn remote(host_name: impl Into<String>, version: impl Into<String>) -> Self {
        let host_name = host_name.into();
        Self {
            id: SessionId::next(),
            origin: SessionOrigin::Remote,
            display_name: host_name.clone(),
            host_name,
            version: version.into(),
        }
    }

    pub fn is_remote(&self) -> bool {
        self.origin == SessionOrigin::Remote
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Opening,
    Opened,
    Broken,
    Closed,
}

impl SessionState {
    pub fn is_usable(self) -> bool {
        matches!(self, SessionState::Opening | SessionState::Opened)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStateChange {
    pub session: SessionId,
    pub state: SessionState,
    pub reason: Option<String>,
}

/// An isolated engine execution state
pub trait Session: Send + Sync {
    fn info(&self) -> SessionInfo;

    fn id(&self) -> SessionId {
        self.info().id
    }

    fn state(&self) -> SessionState;

    fn debugger(&self) -> Arc<dyn Debugger>;

    /// Install or clear the sink that receives this session's events.
    /// At most one sink is installed across all sessions at any time.
    fn set_event_sink(&self, sink: Option<SessionEventSink>);
}

/// Breakpoint request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakpointSpec {
    pub script_path: PathBuf,
    pub line: u32,
    pub column: Option<u32>,
    pub condition: Option<String>,
    pub hit_condition: Option<String>,
}

impl BreakpointSpec {
    pub fn line(script_path: impl Into<PathBuf>, line: u32) -> Self {
        Self {
            script_path: script_path.into(),
            line,
            column: None,
            condition: None,
            hit_condition: None,
        }
    }
}

/// Breakpoint known to a session's debugger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub id: u32,
    pub script_path: PathBuf,
    pub line: u32,
    pub condition: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebuggerStopEvent {
    pub session: SessionId,
    pub script_path: Option<PathBuf>,
    pub line: Option<u32>,
    pub hit_breakpoints: Vec<u32>,
}

/// What the engine does after a debugger break returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebuggerResumeAction {
    #[default]
    Continue,
    StepInto,
    StepOver,
    StepOut,
    Stop,
}

/// Debugger of one session
pub trait Debugger: Send + Sync {
    fn in_breakpoint(&self) -> bool;

    fn breakpoints(&self) -> Vec<Breakpoint>;

    fn set_breakpoint(&self, spec: &BreakpointSpec) -> Result<Breakpoint, EngineError>;

    fn remove_breakpoint(&self, id: u32) -> Result<(), EngineError>;

    /// Called when a debug frame is pushed
    fn on_debug_loop_enter(&self) {}

    /// Called when a debug frame is popped
    fn on_debug_loop_exit(&self) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandKind {
    Script(String),
    File(PathBuf),
    /// Ask the engine for its prompt text
    Prompt,
    /// Trivial command that only forces event processing
    Inert,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub kind: CommandKind,
    pub use_local_scope: bool,
    pub arguments: Vec<String>,
}

impl Command {
    pub fn script(text: impl Into<String>) -> Self {
        Self::from_kind(CommandKind::Script(text.into()))
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::from_kind(CommandKind::File(path.into()))
    }

    pub fn prompt() -> Self {
        Self::from_kind(CommandKind::Prompt)
    }

    pub fn inert() -> Self {
        Self::from_kind(CommandKind::Inert)
    }

    pub fn with_arguments(mut self, arguments: Vec<String>) -> Self {
        self.arguments = arguments;
        self
    }

    fn from_kind(kind: CommandKind) -> Self {
        Self {
            kind,
            use_local_scope: false,
            arguments: Vec::new(),
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            CommandKind::Script(text) => write!(f, "{}", text),
            CommandKind::File(path) => write!(f, ". '{}'", path.display()),
            CommandKind::Prompt => write!(f, "prompt"),
            CommandKind::Inert => write!(f, "<inert>"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InvocationSettings {
    pub add_to_history: bool,
    pub write_output: bool,
}

/// Reentrant calls the engine makes into the host while a command runs.
/// Always invoked on the pipeline thread.
pub trait EngineCallbacks {
    /// The session stopped at a breakpoint. Returns once the user resumes.
    fn on_debugger_stop(&mut self, event: DebuggerStopEvent) -> DebuggerResumeAction;

    /// Run a nested prompt until it is exited
    fn enter_nested_prompt(&mut self) -> Result<(), EngineError>;

    /// Leave the innermost nested prompt
    fn exit_nested_prompt(&mut self);

    fn surface(&self) -> Arc<dyn InteractiveSurface>;
}

/// An engine instance bound to one session
pub trait ScriptEngine: Send + Sync {
    fn session(&self) -> Arc<dyn Session>;

    fn invoke(
        &self,
        callbacks: &mut dyn EngineCallbacks,
        command: &Command,
        settings: &InvocationSettings,
        token: &LinkedToken,
    ) -> Result<Vec<Value>, EngineError>;

    /// Engine instance for a nested prompt on the same session
    fn create_nested(&self) -> Result<Arc<dyn ScriptEngine>, EngineError>;

    /// Engine instance bound to a different session
    fn bind(&self, session: Arc<dyn Session>) -> Result<Arc<dyn ScriptEngine>, EngineError>;

    fn import_module(&self, path: &Path) -> Result<(), EngineError>;

    fn set_location(&self, path: &Path) -> Result<(), EngineError>;

    /// Names of the engine events that currently have subscribers
    fn event_subscribers(&self) -> Vec<String>;

    /// Queue an engine event; it is delivered the next time a pipeline runs
    fn generate_event(&self, name: &str) -> Result<(), EngineError>;

    /// Release resources tied to this instance
    fn dispose(&self) {}
}

/// Creates the process-lifetime bottom engine, also used to rebuild it after
/// session corruption
pub trait EngineFactory: Send + Sync {
    fn create_initial(&self) -> Result<Arc<dyn ScriptEngine>, EngineError>;
}

impl<F> EngineFactory for F
where
    F: Fn() -> Result<Arc<dyn ScriptEngine>, EngineError> + Send + Sync,
{
    fn create_initial(&self) -> Result<Arc<dyn ScriptEngine>, EngineError> {
        self()
    }
}
