//! POSIX shell engine.
//!
//! A minimal [`ScriptEngine`] that runs each script through `sh -c` in the
//! session's working directory. It backs the `psic` binary; editor hosts
//! plug in their own engine.

use crate::engine::{
    Breakpoint, BreakpointSpec, Command, CommandKind, Debugger, EngineCallbacks, EngineFactory,
    InvocationSettings, ScriptEngine, Session, SessionInfo, SessionState, SessionStateChange,
};
use crate::error::EngineError;
use crate::host::cancellation::LinkedToken;
use crate::host::events::SessionEventSink;
use crate::notify::BreakpointUpdateKind;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Session state shared by every engine bound to it
pub struct ShellSession {
    info: SessionInfo,
    state: RwLock<SessionState>,
    debugger: Arc<ShellDebugger>,
    location: Mutex<PathBuf>,
    sink: Arc<Mutex<Option<SessionEventSink>>>,
}

impl ShellSession {
    pub fn new(info: SessionInfo, location: PathBuf) -> Arc<Self> {
        let sink = Arc::new(Mutex::new(None));
        Arc::new(Self {
            info,
            state: RwLock::new(SessionState::Opened),
            debugger: Arc::new(ShellDebugger::new(Arc::clone(&sink))),
            location: Mutex::new(location),
            sink,
        })
    }

    pub fn location(&self) -> PathBuf {
        self.location.lock().clone()
    }

    /// Mark the session closed and report it to the hook owner
    pub fn close(&self, reason: impl Into<String>) {
        *self.state.write() = SessionState::Closed;
        let sink = self.sink.lock().clone();
        if let Some(sink) = sink {
            sink.state_changed(SessionStateChange {
                session: self.info.id,
                state: SessionState::Closed,
                reason: Some(reason.into()),
            });
        }
    }
}

impl Session for ShellSession {
    fn info(&self) -> SessionInfo {
        self.info.clone()
    }

    fn state(&self) -> SessionState {
        *self.state.read()
    }

    fn debugger(&self) -> Arc<dyn Debugger> {
        Arc::clone(&self.debugger) as Arc<dyn Debugger>
    }

    fn set_event_sink(&self, sink: Option<SessionEventSink>) {
        *self.sink.lock() = sink;
    }
}

/// Breakpoint bookkeeping; shell scripts never actually stop
pub struct ShellDebugger {
    breakpoints: Mutex<Vec<Breakpoint>>,
    next_id: AtomicU32,
    sink: Arc<Mutex<Option<SessionEventSink>>>,
}

impl ShellDebugger {
    fn new(sink: Arc<Mutex<Option<SessionEventSink>>>) -> Self {
        Self {
            breakpoints: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(1),
            sink,
        }
    }

    fn report(&self, kind: BreakpointUpdateKind, breakpoint: Breakpoint) {
        let sink = self.sink.lock().clone();
        if let Some(sink) = sink {
            sink.breakpoint_updated(kind, breakpoint);
        }
    }
}

impl Debugger for ShellDebugger {
    fn in_breakpoint(&self) -> bool {
        false
    }

    fn breakpoints(&self) -> Vec<Breakpoint> {
        self.breakpoints.lock().clone()
    }

    fn set_breakpoint(&self, spec: &BreakpointSpec) -> Result<Breakpoint, EngineError> {
        if !spec.script_path.exists() {
            return Err(EngineError::Other(format!(
                "script not found: {}",
                spec.script_path.display()
            )));
        }
        let breakpoint = Breakpoint {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            script_path: spec.script_path.clone(),
            line: spec.line,
            condition: spec.condition.clone(),
        };
        self.breakpoints.lock().push(breakpoint.clone());
        self.report(BreakpointUpdateKind::Added, breakpoint.clone());
        Ok(breakpoint)
    }

    fn remove_breakpoint(&self, id: u32) -> Result<(), EngineError> {
        let removed = {
            let mut breakpoints = self.breakpoints.lock();
            let pos = breakpoints
                .iter()
                .position(|bp| bp.id == id)
                .ok_or_else(|| EngineError::Other(format!("no breakpoint with id {}", id)))?;
            breakpoints.remove(pos)
        };
        self.report(BreakpointUpdateKind::Removed, removed);
        Ok(())
    }
}

/// Engine instance bound to a [`Session`]
pub struct ShellEngine {
    session: Arc<dyn Session>,
    shell: Arc<ShellSession>,
    modules: Arc<Mutex<Vec<PathBuf>>>,
}

impl ShellEngine {
    pub fn new(shell: Arc<ShellSession>) -> Self {
        Self {
            session: Arc::clone(&shell) as Arc<dyn Session>,
            shell,
            modules: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Modules imported so far, in order
    pub fn modules(&self) -> Vec<PathBuf> {
        self.modules.lock().clone()
    }

    fn run_script(
        &self,
        program: std::process::Command,
        token: &LinkedToken,
    ) -> Result<Vec<Value>, EngineError> {
        let mut program = program;
        let mut child = program
            .current_dir(self.shell.location())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EngineError::Runtime(format!("failed to start shell: {}", e)))?;

        let stdout = capture(child.stdout.take());
        let stderr = capture(child.stderr.take());
        let status = wait_cancellable(&mut child, token)?;
        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();

        if !status.success() {
            let message = stderr.trim();
            return Err(EngineError::Runtime(if message.is_empty() {
                format!("shell exited with {}", status)
            } else {
                message.to_string()
            }));
        }
        Ok(stdout
            .lines()
            .map(|line| Value::String(line.to_string()))
            .collect())
    }

    fn change_directory(&self, target: &str) -> Result<Vec<Value>, EngineError> {
        let target = if target.is_empty() {
            std::env::var_os("HOME")
                .map(PathBuf::from)
                .ok_or_else(|| EngineError::Runtime("HOME is not set".to_string()))?
        } else {
            self.shell.location().join(target)
        };
        self.set_location(&target)?;
        Ok(Vec::new())
    }
}

fn capture<R: Read + Send + 'static>(pipe: Option<R>) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut text = String::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_string(&mut text);
        }
        text
    })
}

fn wait_cancellable(
    child: &mut Child,
    token: &LinkedToken,
) -> Result<std::process::ExitStatus, EngineError> {
    loop {
        if let Some(status) = child
            .try_wait()
            .map_err(|e| EngineError::Runtime(e.to_string()))?
        {
            return Ok(status);
        }
        if token.is_cancelled() {
            debug!(pid = child.id(), "Killing canceled shell command");
            let _ = child.kill();
            let _ = child.wait();
            return Err(EngineError::Canceled);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

impl ScriptEngine for ShellEngine {
    fn session(&self) -> Arc<dyn Session> {
        Arc::clone(&self.session)
    }

    fn invoke(
        &self,
        callbacks: &mut dyn EngineCallbacks,
        command: &Command,
        _settings: &InvocationSettings,
        token: &LinkedToken,
    ) -> Result<Vec<Value>, EngineError> {
        if !self.session.state().is_usable() {
            return Err(EngineError::SessionUnavailable(format!(
                "{} is closed",
                self.session.info().display_name
            )));
        }
        match &command.kind {
            CommandKind::Prompt => Ok(vec![Value::String(format!(
                "PSIC {}> ",
                self.shell.location().display()
            ))]),
            CommandKind::Inert => Ok(Vec::new()),
            CommandKind::Script(text) => match text.trim() {
                "exit" => {
                    callbacks.exit_nested_prompt();
                    Ok(Vec::new())
                }
                "nested" => {
                    callbacks.enter_nested_prompt()?;
                    Ok(Vec::new())
                }
                "cd" => self.change_directory(""),
                other if other.starts_with("cd ") => self.change_directory(other[3..].trim()),
                script => {
                    let mut program = std::process::Command::new("sh");
                    program.arg("-c").arg(script).arg("sh").args(&command.arguments);
                    self.run_script(program, token)
                }
            },
            CommandKind::File(path) => {
                let mut program = std::process::Command::new("sh");
                program.arg(path).args(&command.arguments);
                self.run_script(program, token)
            }
        }
    }

    fn create_nested(&self) -> Result<Arc<dyn ScriptEngine>, EngineError> {
        Ok(Arc::new(Self {
            session: Arc::clone(&self.session),
            shell: Arc::clone(&self.shell),
            modules: Arc::clone(&self.modules),
        }))
    }

    fn bind(&self, session: Arc<dyn Session>) -> Result<Arc<dyn ScriptEngine>, EngineError> {
        Ok(Arc::new(Self {
            session,
            shell: Arc::clone(&self.shell),
            modules: Arc::clone(&self.modules),
        }))
    }

    fn import_module(&self, path: &Path) -> Result<(), EngineError> {
        let path = self.shell.location().join(path);
        if !path.is_file() {
            return Err(EngineError::Other(format!(
                "module not found: {}",
                path.display()
            )));
        }
        info!(module = %path.display(), "Imported module");
        self.modules.lock().push(path);
        Ok(())
    }

    fn set_location(&self, path: &Path) -> Result<(), EngineError> {
        let resolved = self.shell.location().join(path);
        if !resolved.is_dir() {
            return Err(EngineError::Runtime(format!(
                "cannot find path '{}'",
                resolved.display()
            )));
        }
        *self.shell.location.lock() = resolved;
        Ok(())
    }

    fn event_subscribers(&self) -> Vec<String> {
        Vec::new()
    }

    fn generate_event(&self, _name: &str) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Creates a fresh local shell session for every bottom frame
#[derive(Debug, Clone)]
pub struct ShellEngineFactory {
    location: PathBuf,
}

impl ShellEngineFactory {
    pub fn new(location: PathBuf) -> Self {
        Self { location }
    }
}

impl EngineFactory for ShellEngineFactory {
    fn create_initial(&self) -> Result<Arc<dyn ScriptEngine>, EngineError> {
        let info = SessionInfo::local("psic", env!("CARGO_PKG_VERSION"));
        let session = ShellSession::new(info, self.location.clone());
        Ok(Arc::new(ShellEngine::new(session)))
    }
}
