//! Debug context shared between the pipeline thread and the protocol layer.

use crate::engine::{DebuggerResumeAction, DebuggerStopEvent};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default)]
pub struct DebugContext {
    active: AtomicBool,
    server_active: AtomicBool,
    attach_requested: AtomicBool,
    resume_action: Mutex<Option<DebuggerResumeAction>>,
    last_stop: Mutex<Option<DebuggerStopEvent>>,
}

impl DebugContext {
    /// Record a debugger stop. Returns true when the protocol layer has to
    /// be asked to start a debugger for it.
    pub fn enter_stop(&self, event: DebuggerStopEvent) -> bool {
        self.active.store(true, Ordering::Release);
        *self.resume_action.lock() = None;
        *self.last_stop.lock() = Some(event);
        !self.server_active.load(Ordering::Acquire)
            && !self.attach_requested.swap(true, Ordering::AcqRel)
    }

    /// Mark debugging as finished. Returns true when a start request made
    /// by [`DebugContext::enter_stop`] has to be withdrawn.
    pub fn deactivate(&self) -> bool {
        self.active.store(false, Ordering::Release);
        *self.last_stop.lock() = None;
        self.attach_requested.swap(false, Ordering::AcqRel)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_server_active(&self, active: bool) {
        self.server_active.store(active, Ordering::Release);
    }

    pub fn is_server_active(&self) -> bool {
        self.server_active.load(Ordering::Acquire)
    }

    pub fn set_resume_action(&self, action: DebuggerResumeAction) {
        *self.resume_action.lock() = Some(action);
    }

    /// Action chosen while stopped, `Continue` if none was
    pub fn take_resume_action(&self) -> DebuggerResumeAction {
        self.resume_action.lock().take().unwrap_or_default()
    }

    pub fn last_stop(&self) -> Option<DebuggerStopEvent> {
        self.last_stop.lock().clone()
    }
}
