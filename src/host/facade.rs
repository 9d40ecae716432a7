//! Public host facade.
//!
//! [`ExecutionHost`] is a cheap, cloneable handle. Every operation that
//! touches frames or the engine is submitted as a work item and runs on the
//! pipeline thread; the facade itself only flips flags and waits.

use crate::engine::{
    Breakpoint, BreakpointSpec, Command, DebuggerResumeAction, EngineFactory, Session,
};
use crate::error::HostError;
use crate::host::breakpoints::BreakpointDetails;
use crate::host::cancellation::LinkedToken;
use crate::host::frame::FrameKind;
use crate::host::options::{CommandOptions, ExecutionOptions, HostStartOptions};
use crate::host::pipeline::PipelineContext;
use crate::host::shared::{HostShared, HostStats};
use crate::host::task::{DelegateTask, OutcomeKind, TaskHandle, WorkItem};
use crate::notify::{NullNotifier, ProtocolNotifier};
use crate::reader::{InteractiveReader, InteractiveSurface, NullReader, NullSurface, ReaderSlot};
use parking_lot::Mutex;
use secrecy::SecretString;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Name of the dedicated engine thread
pub const PIPELINE_THREAD_NAME: &str = "psic-pipeline";

/// Builder for [`ExecutionHost`]
pub struct ExecutionHostBuilder {
    factory: Arc<dyn EngineFactory>,
    reader: Arc<dyn InteractiveReader>,
    surface: Arc<dyn InteractiveSurface>,
    notifier: Arc<dyn ProtocolNotifier>,
}

impl ExecutionHostBuilder {
    pub fn new(factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            factory,
            reader: Arc::new(NullReader),
            surface: Arc::new(NullSurface),
            notifier: Arc::new(NullNotifier),
        }
    }

    pub fn reader(mut self, reader: Arc<dyn InteractiveReader>) -> Self {
        self.reader = reader;
        self
    }

    pub fn surface(mut self, surface: Arc<dyn InteractiveSurface>) -> Self {
        self.surface = surface;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn ProtocolNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn build(self) -> ExecutionHost {
        let shared = HostShared::new(ReaderSlot::new(self.reader), self.surface, self.notifier);
        ExecutionHost {
            shared: Arc::new(shared),
            inner: Arc::new(HostInner {
                factory: self.factory,
                thread: Mutex::new(None),
            }),
        }
    }
}

struct HostInner {
    factory: Arc<dyn EngineFactory>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the execution host
#[derive(Clone)]
pub struct ExecutionHost {
    shared: Arc<HostShared>,
    inner: Arc<HostInner>,
}

impl ExecutionHost {
    pub fn builder(factory: Arc<dyn EngineFactory>) -> ExecutionHostBuilder {
        ExecutionHostBuilder::new(factory)
    }

    /// Start the pipeline thread. Returns `Ok(true)` only for the call that
    /// actually started it; concurrent and later callers wait for the same
    /// startup and get `Ok(false)`.
    pub async fn try_start(
        &self,
        options: HostStartOptions,
        cancel: &CancellationToken,
    ) -> Result<bool, HostError> {
        if !self.shared.state.claim_start() {
            debug!("Host start already claimed, waiting for startup");
            return match self.wait_started(cancel).await? {
                true => Ok(false),
                false => Err(self.start_failure()),
            };
        }

        info!(
            repl = options.repl_enabled,
            modules = options.module_paths.len(),
            profiles = options.profile_paths.len(),
            "Starting execution host"
        );
        self.queue_startup_items(&options);

        let ctx = PipelineContext::new(
            Arc::clone(&self.shared),
            options,
            Arc::clone(&self.inner.factory),
        );
        let handle = std::thread::Builder::new()
            .name(PIPELINE_THREAD_NAME.to_string())
            .spawn(move || ctx.run());
        let handle = match handle {
            Ok(handle) => handle,
            Err(err) => {
                self.shared.state.started.resolve(false);
                self.shared.state.stopped.resolve(Err(err.to_string()));
                return Err(err.into());
            }
        };
        *self.inner.thread.lock() = Some(handle);

        match self.wait_started(cancel).await? {
            true => Ok(true),
            false => Err(self.start_failure()),
        }
    }

    async fn wait_started(&self, cancel: &CancellationToken) -> Result<bool, HostError> {
        tokio::select! {
            started = self.shared.state.started.wait() => Ok(started),
            _ = cancel.cancelled() => Err(HostError::Canceled),
        }
    }

    fn start_failure(&self) -> HostError {
        match self.shared.state.stopped.get() {
            Some(Err(fault)) => HostError::Faulted(fault),
            _ => HostError::Stopped,
        }
    }

    /// Queue startup work at the head, in order: working directory, modules,
    /// profiles
    fn queue_startup_items(&self, options: &HostStartOptions) {
        let mut items: Vec<WorkItem> = Vec::new();

        if let Some(dir) = options.initial_working_directory.clone() {
            items.push(startup_item(
                format!("Set location to {}", dir.display()),
                move |ctx, _| ctx.set_location(&dir),
            ));
        }
        for path in options.module_paths.clone() {
            items.push(startup_item(
                format!("Import module {}", path.display()),
                move |ctx, _| ctx.import_module(&path),
            ));
        }
        for path in options.profile_paths.clone() {
            items.push(startup_item(
                format!("Run profile {}", path.display()),
                move |ctx, token| run_profile(ctx, path, token),
            ));
        }

        for item in items.into_iter().rev() {
            if let Err(item) = self.shared.queue.prepend(item) {
                item.cancel();
            }
        }
    }

    /// Stop the host and join the pipeline thread. Idempotent. Called from
    /// the pipeline thread itself it only initiates shutdown.
    pub async fn stop(&self) -> Result<(), HostError> {
        if !self.begin_stop() {
            return Ok(());
        }
        let stopped = self.shared.state.stopped.wait().await;
        self.join_thread();
        stopped.map_err(HostError::Faulted)
    }

    /// Blocking form of [`ExecutionHost::stop`]
    pub fn stop_blocking(&self) -> Result<(), HostError> {
        if !self.begin_stop() {
            return Ok(());
        }
        let stopped = self.shared.state.stopped.wait_blocking();
        self.join_thread();
        stopped.map_err(HostError::Faulted)
    }

    /// Returns true when the caller should wait for the thread to finish
    fn begin_stop(&self) -> bool {
        if self.shared.state.begin_shutdown() {
            info!("Stopping execution host");
        }

        if self.shared.state.claim_start() {
            // Never started; nothing to wait for
            self.shared.state.started.resolve(false);
            self.shared.state.stopped.resolve(Ok(()));
        }

        self.shared.cancellation.cancel_current_task_stack();
        for item in self.shared.queue.dispose() {
            item.cancel();
            self.shared.stats.record(OutcomeKind::Canceled);
        }
        !self.shared.state.is_pipeline_thread()
    }

    fn join_thread(&self) {
        let handle = self.inner.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("Pipeline thread panicked during shutdown");
            }
        }
    }

    /// Wait until the pipeline thread has ended
    pub async fn wait_for_stopped(&self) -> Result<(), HostError> {
        self.shared.state.stopped.wait().await.map_err(HostError::Faulted)
    }

    pub fn is_started(&self) -> bool {
        self.shared.state.started.get().unwrap_or(false)
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.state.stopped.is_resolved()
    }

    /// Top-level fault recorded when the pipeline thread ended, if any
    pub fn fault(&self) -> Option<String> {
        match self.shared.state.stopped.get() {
            Some(Err(fault)) => Some(fault),
            _ => None,
        }
    }

    /// Queue a work item and return its handle without waiting
    pub fn submit<T, F>(
        &self,
        description: impl Into<String>,
        options: ExecutionOptions,
        cancel: Option<CancellationToken>,
        body: F,
    ) -> Result<TaskHandle<T>, HostError>
    where
        T: Send + 'static,
        F: FnOnce(&mut PipelineContext, &LinkedToken) -> Result<T, HostError> + Send + 'static,
    {
        let requester = cancel.map(LinkedToken::new).unwrap_or_default();
        let (task, handle) = DelegateTask::new(description, options, requester, body);
        self.shared.enqueue(task.into_work_item())?;
        Ok(handle)
    }

    /// Run a closure on the pipeline thread and wait for its outcome
    pub async fn execute_delegate<T, F>(
        &self,
        description: impl Into<String>,
        options: ExecutionOptions,
        body: F,
    ) -> Result<T, HostError>
    where
        T: Send + 'static,
        F: FnOnce(&mut PipelineContext, &LinkedToken) -> Result<T, HostError> + Send + 'static,
    {
        self.submit(description, options, None, body)?
            .await
            .into_result()
    }

    /// Blocking form of [`ExecutionHost::execute_delegate`]. Refused on the
    /// pipeline thread, where waiting would deadlock.
    pub fn execute_delegate_blocking<T, F>(
        &self,
        description: impl Into<String>,
        options: ExecutionOptions,
        body: F,
    ) -> Result<T, HostError>
    where
        T: Send + 'static,
        F: FnOnce(&mut PipelineContext, &LinkedToken) -> Result<T, HostError> + Send + 'static,
    {
        let description = description.into();
        if self.shared.state.is_pipeline_thread() {
            return Err(HostError::Reentrant(description));
        }
        self.submit(description, options, None, body)?
            .blocking_wait()
            .into_result()
    }

    /// Queue an engine command and return its handle without waiting
    pub fn submit_command(
        &self,
        command: Command,
        options: CommandOptions,
        cancel: Option<CancellationToken>,
    ) -> Result<TaskHandle<Vec<Value>>, HostError> {
        self.submit(
            command.to_string(),
            options.execution,
            cancel,
            move |ctx, token| ctx.execute_command(&command, &options, token),
        )
    }

    pub async fn execute_command(
        &self,
        command: Command,
        options: CommandOptions,
    ) -> Result<Vec<Value>, HostError> {
        self.submit_command(command, options, None)?
            .await
            .into_result()
    }

    pub fn execute_command_blocking(
        &self,
        command: Command,
        options: CommandOptions,
    ) -> Result<Vec<Value>, HostError> {
        if self.shared.state.is_pipeline_thread() {
            return Err(HostError::Reentrant(command.to_string()));
        }
        self.submit_command(command, options, None)?
            .blocking_wait()
            .into_result()
    }

    /// Ask the innermost nested loop to exit. Refused at the top-level frame.
    pub async fn request_exit(&self) -> Result<(), HostError> {
        self.execute_delegate("Request exit", ExecutionOptions::default(), |ctx, _| {
            ctx.request_exit()
        })
        .await
    }

    /// Redirect the interactive loop to another session
    pub async fn push_session(&self, session: Arc<dyn Session>) -> Result<(), HostError> {
        self.execute_delegate("Push session", ExecutionOptions::default(), move |ctx, _| {
            ctx.push_session(session)
        })
        .await
    }

    pub async fn pop_session(&self) -> Result<(), HostError> {
        self.execute_delegate("Pop session", ExecutionOptions::default(), |ctx, _| {
            ctx.pop_session()
        })
        .await
    }

    /// Cancel whatever runs in the current scope, including a pending read
    pub fn cancel_current_task(&self) {
        self.shared.cancellation.cancel_current_task();
    }

    /// Replace the interactive reader; takes effect at the next read
    pub fn set_reader(&self, reader: Arc<dyn InteractiveReader>) {
        self.shared.reader.replace(reader);
    }

    pub fn stats(&self) -> HostStats {
        self.shared.stats()
    }

    /// Frame depth as last published by the pipeline thread
    pub fn frame_depth(&self) -> usize {
        self.shared.state.frame_depth()
    }

    pub fn frame_kind(&self) -> FrameKind {
        self.shared.state.top_kind()
    }

    /// True while the interactive reader waits for a line
    pub fn is_awaiting_input(&self) -> bool {
        self.shared.state.is_awaiting_input()
    }

    pub fn is_debugger_active(&self) -> bool {
        self.shared.debug.is_active()
    }

    /// The protocol layer reports whether a debug adapter session is attached
    pub fn set_debug_server_active(&self, active: bool) {
        self.shared.debug.set_server_active(active);
    }

    async fn resume_debugger(&self, action: DebuggerResumeAction) -> Result<(), HostError> {
        self.execute_delegate(
            format!("Debugger {:?}", action),
            ExecutionOptions::default(),
            move |ctx, _| ctx.resume_debugger(action),
        )
        .await
    }

    pub async fn debug_continue(&self) -> Result<(), HostError> {
        self.resume_debugger(DebuggerResumeAction::Continue).await
    }

    pub async fn debug_step_into(&self) -> Result<(), HostError> {
        self.resume_debugger(DebuggerResumeAction::StepInto).await
    }

    pub async fn debug_step_over(&self) -> Result<(), HostError> {
        self.resume_debugger(DebuggerResumeAction::StepOver).await
    }

    pub async fn debug_step_out(&self) -> Result<(), HostError> {
        self.resume_debugger(DebuggerResumeAction::StepOut).await
    }

    pub async fn debug_stop(&self) -> Result<(), HostError> {
        self.resume_debugger(DebuggerResumeAction::Stop).await
    }

    pub async fn set_breakpoints(
        &self,
        specs: Vec<BreakpointSpec>,
    ) -> Result<Vec<BreakpointDetails>, HostError> {
        self.execute_delegate("Set breakpoints", ExecutionOptions::default(), move |ctx, _| {
            ctx.set_breakpoints(&specs)
        })
        .await
    }

    pub async fn breakpoints(&self) -> Result<Vec<Breakpoint>, HostError> {
        self.execute_delegate("List breakpoints", ExecutionOptions::default(), |ctx, _| {
            ctx.breakpoints()
        })
        .await
    }

    /// Remove breakpoints by id, returning the ids that were not removed
    pub async fn remove_breakpoints(&self, ids: Vec<u32>) -> Result<Vec<u32>, HostError> {
        self.execute_delegate("Remove breakpoints", ExecutionOptions::default(), move |ctx, _| {
            ctx.remove_breakpoints(&ids)
        })
        .await
    }

    /// Read a line without echo. Runs in the foreground, so it waits for the
    /// interactive prompt to yield.
    pub async fn read_secure_line(&self) -> Result<SecretString, HostError> {
        self.execute_delegate("Read secure line", ExecutionOptions::foreground(), |ctx, token| {
            ctx.read_secure_line(token)
        })
        .await
    }
}

fn startup_item<F>(description: String, body: F) -> WorkItem
where
    F: FnOnce(&mut PipelineContext, &LinkedToken) -> Result<(), HostError> + Send + 'static,
{
    let label = description.clone();
    let (task, _handle) = DelegateTask::new(
        description,
        ExecutionOptions::default(),
        LinkedToken::none(),
        move |ctx, token| {
            if let Err(err) = body(ctx, token) {
                warn!(task = %label, error = %err, "Startup item failed");
                ctx.surface()
                    .write_warning_line(&format!("{} failed: {}", label, err));
            }
            Ok(())
        },
    );
    task.into_work_item()
}

fn run_profile(
    ctx: &mut PipelineContext,
    path: PathBuf,
    token: &LinkedToken,
) -> Result<(), HostError> {
    let options = CommandOptions {
        write_output_to_host: true,
        ..CommandOptions::default()
    };
    ctx.execute_command(&Command::file(path), &options, token)
        .map(|_| ())
}
