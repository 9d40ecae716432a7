//! Session event sink handed to the session that currently owns the hooks.

use crate::engine::{Breakpoint, SessionStateChange};
use crate::host::cancellation::LinkedToken;
use crate::host::options::ExecutionOptions;
use crate::host::shared::HostShared;
use crate::host::task::DelegateTask;
use crate::notify::{BreakpointUpdateKind, HostNotification};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Callbacks a session uses to report debugger and lifecycle events.
/// May be called from any thread.
#[derive(Clone, Default)]
pub struct SessionEventSink {
    host: Weak<HostShared>,
}

impl SessionEventSink {
    pub(crate) fn new(host: &Arc<HostShared>) -> Self {
        Self {
            host: Arc::downgrade(host),
        }
    }

    /// A sink not connected to any host
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn breakpoint_updated(&self, kind: BreakpointUpdateKind, breakpoint: Breakpoint) {
        if let Some(host) = self.host.upgrade() {
            host.notify(HostNotification::BreakpointUpdated { kind, breakpoint });
        }
    }

    /// A session that becomes unusable while it owns the hooks triggers
    /// recovery on the pipeline thread.
    pub fn state_changed(&self, change: SessionStateChange) {
        let Some(host) = self.host.upgrade() else {
            return;
        };
        if change.state.is_usable() || host.state.is_shutting_down() {
            return;
        }
        if !host.hooks.is_registered(change.session) {
            debug!(session = %change.session, "Ignoring state change from inactive session");
            return;
        }
        if !host.state.try_begin_reset() {
            debug!(session = %change.session, "Session recovery already in progress");
            return;
        }

        warn!(
            session = %change.session,
            state = ?change.state,
            reason = change.reason.as_deref().unwrap_or(""),
            "Session became unusable, recovering"
        );
        host.cancellation.cancel_current_task_stack();

        let (task, _handle) = DelegateTask::new(
            "Recover engine session",
            ExecutionOptions::interrupting(),
            LinkedToken::none(),
            |ctx, _token| ctx.recover_session(),
        );
        if let Err(err) = host.enqueue(task.into_work_item()) {
            warn!(error = %err, "Could not queue session recovery");
            host.state.end_reset();
        }
    }
}
