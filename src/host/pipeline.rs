//! Pipeline Thread Loop
//!
//! [`PipelineContext`] is owned by the single thread that calls into the
//! engine. It holds the frame and runspace stacks outright; producers only
//! reach it through work items that receive `&mut PipelineContext`.
//!
//! Frames pushed by engine callbacks (nested prompt, debugger break) run a
//! nested loop on the same thread and are always popped before the callback
//! returns. Frames pushed by [`PipelineContext::push_session`] are driven by
//! whichever loop is already running, since every loop iterates on the top
//! frame.

use crate::engine::{
    Breakpoint, BreakpointSpec, Command, DebuggerResumeAction, DebuggerStopEvent,
    EngineCallbacks, EngineFactory, InvocationSettings, ScriptEngine, Session, SessionInfo,
};
use crate::error::{EngineError, HostError, ReadError};
use crate::host::breakpoints::{self, BreakpointDetails};
use crate::host::cancellation::LinkedToken;
use crate::host::events::SessionEventSink;
use crate::host::frame::{ExecutionFrame, FrameKind, FrameStack, SessionChange};
use crate::host::options::{CommandOptions, HostStartOptions};
use crate::host::shared::HostShared;
use crate::host::task::{panic_message, OutcomeKind, WorkItem};
use crate::notify::{HostNotification, SessionChangeReason};
use crate::reader::{IdleHandler, InteractiveSurface, ReadOutcome};
use secrecy::SecretString;
use serde_json::Value;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, debug_span, error, info, info_span, warn};

const REPL_FAULT_MESSAGE: &str = "An error occurred while running the REPL loop";

/// Everything the pipeline thread owns
pub struct PipelineContext {
    shared: Arc<HostShared>,
    options: HostStartOptions,
    factory: Arc<dyn EngineFactory>,
    frames: FrameStack,
    /// Generation of the reader that reported its input closed
    closed_reader: Option<u64>,
    idle_depth: usize,
}

impl PipelineContext {
    pub(crate) fn new(
        shared: Arc<HostShared>,
        options: HostStartOptions,
        factory: Arc<dyn EngineFactory>,
    ) -> Self {
        let frames = FrameStack::new(shared.hooks.clone(), SessionEventSink::new(&shared));
        Self {
            shared,
            options,
            factory,
            frames,
            closed_reader: None,
            idle_depth: 0,
        }
    }

    /// Thread entry point. Resolves the stopped signal exactly once.
    pub(crate) fn run(mut self) {
        self.shared.state.set_pipeline_thread(std::thread::current().id());

        let result = match catch_unwind(AssertUnwindSafe(|| self.run_top_level())) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err.to_string()),
            Err(panic) => Err(panic_message(panic.as_ref())),
        };
        if let Err(fault) = &result {
            error!(error = %fault, "Pipeline thread faulted");
        }

        self.teardown();
        // Stopped first, so a failed start can read the fault
        self.shared.state.stopped.resolve(result);
        self.shared.state.started.resolve(false);
        info!("Pipeline thread stopped");
    }

    fn run_top_level(&mut self) -> Result<(), HostError> {
        let span = info_span!("pipeline_loop", depth = 1);
        let _enter = span.enter();

        let engine = self.factory.create_initial()?;
        self.push_frame(ExecutionFrame::new(engine, FrameKind::REPL))?;

        let startup_token = LinkedToken::none();
        while let Some(item) = self.shared.queue.take_now() {
            self.execute_item(item, &startup_token);
        }
        self.shared.state.started.resolve(true);
        info!(repl = self.options.repl_enabled, "Execution host started");

        self.run_frames_until(1);

        if self.frames.is_empty() && !self.shared.state.is_shutting_down() {
            return Err(HostError::Faulted(
                "frame stack emptied while the host was running".to_string(),
            ));
        }
        Ok(())
    }

    fn teardown(&mut self) {
        self.shared.state.begin_shutdown();
        self.shared.cancellation.cancel_current_task_stack();
        while self.pop_frame(SessionChangeReason::Shutdown) {}
        for item in self.shared.queue.dispose() {
            debug!(task_id = item.id().as_u64(), "Discarding queued work item");
            item.cancel();
            self.shared.stats.record(OutcomeKind::Canceled);
        }
        self.shared.debug.deactivate();
    }

    /// Drive the top frame until the stack drops below `min_depth`
    fn run_frames_until(&mut self, min_depth: usize) {
        while self.frames.depth() >= min_depth && !self.shared.state.is_shutting_down() {
            if self.shared.state.exit_requested() {
                self.shared.state.set_exit_requested(false);
                if self.frames.depth() > 1 {
                    self.pop_frame(SessionChangeReason::Exit);
                }
                continue;
            }
            self.run_iteration();
        }
    }

    /// One loop body: a REPL step, then every item queued so far
    fn run_iteration(&mut self) {
        let scope = self.shared.cancellation.enter_scope(false, None);
        let token = scope.token().clone();
        // A stop that cancelled the stack before this scope existed
        if self.shared.state.is_shutting_down() {
            return;
        }

        self.do_one_repl(&token);

        while !self.shared.state.exit_requested()
            && !self.shared.state.is_shutting_down()
            && !token.is_cancelled()
        {
            match self.shared.queue.take_now() {
                Some(item) => self.execute_item(item, &token),
                None => break,
            }
        }
    }

    fn execute_item(&mut self, item: WorkItem, token: &LinkedToken) {
        let shared = Arc::clone(&self.shared);
        let task_id = item.id().as_u64();
        shared.stats.begin();
        let kind = item.execute(self, token);
        shared.stats.finish(kind);
        debug!(task_id, outcome = ?kind, depth = self.frames.depth(), "Work item finished");
    }

    fn do_one_repl(&mut self, token: &LinkedToken) {
        self.sync_debug_context();

        if let Some(closed) = self.closed_reader {
            if closed != self.shared.reader.generation() {
                info!("Interactive reader replaced, resuming prompt");
                self.closed_reader = None;
            }
        }

        let interactive = self.options.repl_enabled
            && self.closed_reader.is_none()
            && self
                .frames
                .top_kind()
                .map(|kind| kind.contains(FrameKind::REPL))
                .unwrap_or(false);
        if !interactive {
            self.shared.state.take_skip_next_prompt();
            self.shared
                .queue
                .wait_for_item(self.options.poll_interval, token);
            return;
        }

        if self.shared.state.take_skip_next_prompt() {
            debug!("Skipping prompt for displacing work item");
            return;
        }

        let surface = self.surface();
        let prompt = self.render_prompt(token);
        surface.write(&prompt);

        let (reader, generation) = self.shared.reader.snapshot();
        self.shared.state.set_awaiting_input(true);
        let read = reader.read_line(self, token);
        self.shared.state.set_awaiting_input(false);

        match read {
            Ok(ReadOutcome::Line(line)) if line.is_empty() => {
                if token.is_cancelled() {
                    surface.write_line("");
                }
            }
            Ok(ReadOutcome::Line(line)) => self.run_interactive_line(line, token),
            Ok(ReadOutcome::Canceled) | Ok(ReadOutcome::Interrupted) | Err(ReadError::Canceled) => {
                surface.write_line("")
            }
            Err(ReadError::Closed) => {
                warn!(generation, "Interactive input closed, switching to poll mode");
                self.closed_reader = Some(generation);
            }
            Err(err) => {
                error!(error = %err, "Interactive read failed");
                surface.write_error_line(&format!("{}: {}", REPL_FAULT_MESSAGE, err));
            }
        }
    }

    fn run_interactive_line(&mut self, line: String, token: &LinkedToken) {
        let command = Command::script(line);
        match self.execute_command(&command, &CommandOptions::interactive(), token) {
            Ok(_) => {}
            Err(err) if err.is_cancellation() => {
                debug!("Interactive command canceled");
            }
            Err(err) => {
                error!(command = %command, error = %err, "Interactive command failed");
                self.surface()
                    .write_error_line(&format!("{}: {}", REPL_FAULT_MESSAGE, err));
            }
        }
    }

    fn render_prompt(&mut self, token: &LinkedToken) -> String {
        let rendered = match self.invoke_command(&Command::prompt(), &InvocationSettings::default(), token) {
            Ok(values) => values.into_iter().find_map(|value| match value {
                Value::Null => None,
                Value::String(text) => Some(text),
                other => Some(other.to_string()),
            }),
            Err(err) => {
                debug!(error = %err, "Prompt function failed, using default prompt");
                None
            }
        };
        let prompt = rendered.unwrap_or_else(|| self.options.default_prompt.clone());

        match self.frames.current_runspace() {
            Some(runspace) if runspace.info.is_remote() => {
                format!("[{}]: {}", runspace.info.host_name, prompt)
            }
            _ => prompt,
        }
    }

    fn sync_debug_context(&self) {
        if !self.shared.debug.is_active() {
            return;
        }
        let stopped = self
            .frames
            .top()
            .map(|frame| frame.session.debugger().in_breakpoint())
            .unwrap_or(false);
        if !stopped {
            debug!("Debugger resumed, deactivating debug context");
            if self.shared.debug.deactivate() {
                self.shared.notify(HostNotification::StopDebugger);
            }
        }
    }

    fn generate_idle_event(&self) -> bool {
        let Some(frame) = self.frames.top() else {
            return false;
        };
        let name = &self.options.idle_event_name;
        if !frame.engine.event_subscribers().iter().any(|s| s == name) {
            return false;
        }
        match frame.engine.generate_event(name) {
            Ok(()) => true,
            Err(err) => {
                debug!(event = %name, error = %err, "Could not generate idle event");
                false
            }
        }
    }

    /// Invoke a command on the top frame's engine
    pub fn invoke_command(
        &mut self,
        command: &Command,
        settings: &InvocationSettings,
        token: &LinkedToken,
    ) -> Result<Vec<Value>, EngineError> {
        let engine = self.current_engine().ok_or_else(|| {
            EngineError::SessionUnavailable("no execution frame is active".to_string())
        })?;
        engine.invoke(self, command, settings, token)
    }

    /// Run a command the way submitted commands run: output optionally
    /// written to the surface, faults optionally swallowed
    pub fn execute_command(
        &mut self,
        command: &Command,
        options: &CommandOptions,
        token: &LinkedToken,
    ) -> Result<Vec<Value>, HostError> {
        let settings = InvocationSettings {
            add_to_history: options.add_to_history,
            write_output: options.write_output_to_host,
        };
        match self.invoke_command(command, &settings, token) {
            Ok(values) => {
                if options.write_output_to_host {
                    self.write_values(&values);
                }
                Ok(values)
            }
            Err(EngineError::Canceled) => Err(HostError::Canceled),
            Err(err) if !options.throw_on_error => {
                warn!(command = %command, error = %err, "Command failed");
                self.surface().write_error_line(&err.to_string());
                Ok(Vec::new())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn write_values(&self, values: &[Value]) {
        let surface = self.surface();
        for value in values {
            match value {
                Value::String(text) => surface.write_line(text),
                other => match serde_json::to_string_pretty(other) {
                    Ok(text) => surface.write_line(&text),
                    Err(err) => debug!(error = %err, "Could not render output value"),
                },
            }
        }
    }

    pub fn surface(&self) -> Arc<dyn InteractiveSurface> {
        Arc::clone(&self.shared.surface)
    }

    pub fn current_engine(&self) -> Option<Arc<dyn ScriptEngine>> {
        self.frames.top().map(|frame| Arc::clone(&frame.engine))
    }

    pub fn current_session(&self) -> Option<SessionInfo> {
        self.frames.current_runspace().map(|r| r.info.clone())
    }

    pub fn frame_depth(&self) -> usize {
        self.frames.depth()
    }

    pub fn runspace_depth(&self) -> usize {
        self.frames.runspace_depth()
    }

    pub fn frame_kind(&self) -> Option<FrameKind> {
        self.frames.top_kind()
    }

    /// True while a work item runs from inside idle processing
    pub fn is_idle(&self) -> bool {
        self.idle_depth > 0
    }

    pub fn set_location(&mut self, path: &Path) -> Result<(), HostError> {
        let engine = self.require_engine()?;
        engine.set_location(path)?;
        Ok(())
    }

    pub fn import_module(&mut self, path: &Path) -> Result<(), HostError> {
        let engine = self.require_engine()?;
        engine.import_module(path)?;
        Ok(())
    }

    fn require_engine(&self) -> Result<Arc<dyn ScriptEngine>, HostError> {
        self.current_engine().ok_or_else(|| {
            EngineError::SessionUnavailable("no execution frame is active".to_string()).into()
        })
    }

    /// Ask the innermost nested loop to return. Refused at the bottom frame.
    pub fn request_exit(&mut self) -> Result<(), HostError> {
        if self.frames.depth() <= 1 {
            debug!("Exit refused at the top-level frame");
            return Err(HostError::ExitRefused(
                "the top-level frame cannot be exited".to_string(),
            ));
        }
        self.shared.state.set_exit_requested(true);
        self.interrupt_input();
        Ok(())
    }

    /// Make a pending interactive read return so the loop observes a
    /// change made from idle processing
    fn interrupt_input(&self) {
        if self.is_idle() {
            self.shared.cancellation.cancel_idle_parent_task();
        }
    }

    /// Redirect the interactive loop to `session`
    pub fn push_session(&mut self, session: Arc<dyn Session>) -> Result<(), HostError> {
        let engine = self.require_engine()?;
        let remote = session.info().is_remote();
        let bound = engine.bind(session)?;
        let kind = if remote {
            FrameKind::REMOTE | FrameKind::REPL
        } else {
            FrameKind::REPL
        };
        self.push_frame(ExecutionFrame::new(bound, kind))?;
        self.interrupt_input();
        Ok(())
    }

    /// Leave the innermost pushed remote session. Refused while the debugger
    /// is stopped in it; resume the debugger first.
    pub fn pop_session(&mut self) -> Result<(), HostError> {
        match self.frames.top_kind() {
            Some(kind) if kind.contains(FrameKind::DEBUG) => Err(HostError::ExitRefused(
                "the debugger is stopped; resume it before leaving the session".to_string(),
            )),
            Some(kind) if kind.contains(FrameKind::REMOTE) && self.frames.depth() > 1 => {
                self.request_exit()
            }
            _ => Err(HostError::ExitRefused(
                "no pushed remote session is active".to_string(),
            )),
        }
    }

    /// Choose how the engine resumes and leave the debug loop
    pub fn resume_debugger(&mut self, action: DebuggerResumeAction) -> Result<(), HostError> {
        let in_debug_frame = self
            .frames
            .top_kind()
            .map(|kind| kind.contains(FrameKind::DEBUG))
            .unwrap_or(false);
        if !in_debug_frame {
            return Err(HostError::ExitRefused(
                "the debugger is not stopped".to_string(),
            ));
        }
        self.shared.debug.set_resume_action(action);
        self.request_exit()
    }

    pub fn set_breakpoints(
        &mut self,
        specs: &[BreakpointSpec],
    ) -> Result<Vec<BreakpointDetails>, HostError> {
        let debugger = self.require_engine()?.session().debugger();
        Ok(breakpoints::apply_breakpoints(debugger.as_ref(), specs))
    }

    pub fn breakpoints(&self) -> Result<Vec<Breakpoint>, HostError> {
        Ok(self.require_engine()?.session().debugger().breakpoints())
    }

    /// Remove breakpoints by id, returning the ids that were not removed
    pub fn remove_breakpoints(&mut self, ids: &[u32]) -> Result<Vec<u32>, HostError> {
        let debugger = self.require_engine()?.session().debugger();
        Ok(breakpoints::remove_breakpoints(debugger.as_ref(), ids))
    }

    pub fn read_secure_line(&mut self, token: &LinkedToken) -> Result<SecretString, HostError> {
        let reader = self.shared.reader.current();
        Ok(reader.read_secure_line(token)?)
    }

    /// Pop frames bound to unusable sessions; rebuild the bottom frame if
    /// none is left
    pub fn recover_session(&mut self) -> Result<(), HostError> {
        let result = self.rebuild_frames();
        self.shared.state.end_reset();
        result
    }

    fn rebuild_frames(&mut self) -> Result<(), HostError> {
        if self.shared.debug.deactivate() {
            self.shared.notify(HostNotification::StopDebugger);
        }

        let mut popped = 0usize;
        while let Some(frame) = self.frames.top() {
            if frame.session.state().is_usable() {
                break;
            }
            self.pop_frame(SessionChangeReason::Exit);
            popped += 1;
        }

        let surface = self.surface();
        if self.frames.is_empty() {
            let engine = self.factory.create_initial()?;
            self.push_frame(ExecutionFrame::new(engine, FrameKind::REPL))?;
            self.import_startup_modules();
            warn!(popped, "Engine session was lost and has been reinitialized");
            surface.write_warning_line(
                "The engine session was disposed. The session has been reinitialized.",
            );
        } else {
            warn!(popped, depth = self.frames.depth(), "Engine session was lost, returning to previous session");
            surface.write_warning_line(
                "The engine session is no longer usable. Returning to the previous session.",
            );
        }
        Ok(())
    }

    fn import_startup_modules(&mut self) {
        for path in self.options.module_paths.clone() {
            if let Err(err) = self.import_module(&path) {
                warn!(path = %path.display(), error = %err, "Failed to re-import module");
            }
        }
    }

    fn push_frame(&mut self, frame: ExecutionFrame) -> Result<(), HostError> {
        if self.frames.depth() >= self.options.max_nesting_depth {
            return Err(EngineError::Other(format!(
                "maximum nesting depth of {} reached",
                self.options.max_nesting_depth
            ))
            .into());
        }
        if frame.kind.contains(FrameKind::DEBUG) {
            frame.session.debugger().on_debug_loop_enter();
        }
        let change = self.frames.push(frame);
        self.publish_frames();
        if let Some(change) = change {
            self.notify_session_change(change);
        }
        Ok(())
    }

    fn pop_frame(&mut self, reason: SessionChangeReason) -> bool {
        let Some((frame, change)) = self.frames.pop(reason) else {
            return false;
        };
        if frame.kind.contains(FrameKind::DEBUG) {
            frame.session.debugger().on_debug_loop_exit();
        }
        frame.engine.dispose();
        self.shared.state.set_exit_requested(false);
        self.publish_frames();
        if let Some(change) = change {
            self.notify_session_change(change);
        }
        true
    }

    fn publish_frames(&self) {
        self.shared
            .state
            .publish_frames(self.frames.depth(), self.frames.top_kind());
    }

    fn notify_session_change(&self, change: SessionChange) {
        info!(
            reason = ?change.reason,
            previous = ?change.previous.as_ref().map(|s| s.id),
            current = ?change.current.as_ref().map(|s| s.id),
            "Session changed"
        );
        self.shared.notify(HostNotification::SessionChanged {
            reason: change.reason,
            previous: change.previous,
            current: change.current,
        });
    }

    /// Push a frame and run its loop until it exits. The frame and anything
    /// pushed above it is popped before returning, panics included.
    fn run_nested_frame(
        &mut self,
        engine: Arc<dyn ScriptEngine>,
        kind: FrameKind,
    ) -> Result<(), HostError> {
        self.push_frame(ExecutionFrame::new(engine, kind))?;
        let depth = self.frames.depth();
        let span = debug_span!("pipeline_loop", depth, frame_kind = %kind);
        let _enter = span.enter();

        let result = catch_unwind(AssertUnwindSafe(|| self.run_frames_until(depth)));

        let reason = if self.shared.state.is_shutting_down() {
            SessionChangeReason::Shutdown
        } else {
            SessionChangeReason::Exit
        };
        while self.frames.depth() >= depth {
            self.pop_frame(reason);
        }
        if let Err(panic) = result {
            resume_unwind(panic);
        }
        Ok(())
    }

    fn nested_kind(&self, extra: FrameKind) -> FrameKind {
        let inherited = self
            .frames
            .top_kind()
            .unwrap_or_default()
            .intersect(FrameKind::REMOTE);
        inherited | extra | FrameKind::NESTED | FrameKind::REPL
    }
}

impl EngineCallbacks for PipelineContext {
    fn on_debugger_stop(&mut self, event: DebuggerStopEvent) -> DebuggerResumeAction {
        if !self.shared.hooks.is_registered(event.session) {
            debug!(session = %event.session, "Ignoring debugger stop from inactive session");
            return DebuggerResumeAction::Continue;
        }

        info!(session = %event.session, line = ?event.line, "Debugger stopped");
        if self.shared.debug.enter_stop(event.clone()) {
            self.shared.notify(HostNotification::StartDebugger);
        }
        self.shared.notify(HostNotification::DebuggerStopped(event));

        let nested = match self
            .require_engine()
            .and_then(|engine| engine.create_nested().map_err(HostError::from))
        {
            Ok(engine) => engine,
            Err(err) => {
                warn!(error = %err, "Could not create debug frame engine");
                return self.shared.debug.take_resume_action();
            }
        };
        let kind = self.nested_kind(FrameKind::DEBUG);
        if let Err(err) = self.run_nested_frame(nested, kind) {
            warn!(error = %err, "Debug loop could not run");
        }
        self.shared.debug.take_resume_action()
    }

    fn enter_nested_prompt(&mut self) -> Result<(), EngineError> {
        let engine = self
            .require_engine()
            .map_err(|e| EngineError::SessionUnavailable(e.to_string()))?;
        let nested = engine.create_nested()?;
        let kind = self.nested_kind(FrameKind::NORMAL);
        self.run_nested_frame(nested, kind).map_err(|err| match err {
            HostError::Engine(inner) => inner,
            other => EngineError::Other(other.to_string()),
        })
    }

    fn exit_nested_prompt(&mut self) {
        if let Err(err) = self.request_exit() {
            debug!(error = %err, "Nested prompt exit ignored");
        }
    }

    fn surface(&self) -> Arc<dyn InteractiveSurface> {
        Arc::clone(&self.shared.surface)
    }
}

impl IdleHandler for PipelineContext {
    fn on_idle(&mut self, token: &LinkedToken) {
        let needs_pipeline_run = self.generate_idle_event();
        if !needs_pipeline_run && self.shared.queue.is_empty() {
            return;
        }

        let scope = self.shared.cancellation.enter_scope(true, Some(token));
        let idle_token = scope.token().clone();
        self.idle_depth += 1;

        let mut executed = false;
        while !idle_token.is_cancelled() && !self.shared.state.exit_requested() {
            let Some(item) = self.shared.queue.take_now() else {
                break;
            };
            if item.options().requires_foreground() {
                debug!(task_id = item.id().as_u64(), "Foreground item found while idle, yielding");
                if let Err(item) = self.shared.queue.prepend(item) {
                    item.cancel();
                }
                self.shared.state.set_skip_next_prompt();
                self.shared.cancellation.cancel_idle_parent_task();
                break;
            }
            self.execute_item(item, &idle_token);
            executed = true;
        }

        if needs_pipeline_run && !executed && !idle_token.is_cancelled() {
            if let Err(err) =
                self.invoke_command(&Command::inert(), &InvocationSettings::default(), &idle_token)
            {
                debug!(error = %err, "Idle pipeline run failed");
            }
        }

        self.idle_depth -= 1;
        drop(scope);
    }
}
