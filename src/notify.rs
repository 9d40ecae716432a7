//! Outbound notifications for the protocol layer.

use crate::engine::{Breakpoint, DebuggerStopEvent, SessionInfo};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;

pub const START_DEBUGGER_METHOD: &str = "psic/startDebugger";
pub const STOP_DEBUGGER_METHOD: &str = "psic/stopDebugger";
pub const DEBUGGER_STOPPED_METHOD: &str = "psic/debuggerStopped";
pub const BREAKPOINT_UPDATED_METHOD: &str = "psic/breakpointUpdated";
pub const SESSION_CHANGED_METHOD: &str = "psic/sessionChanged";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionChangeReason {
    Enter,
    Exit,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakpointUpdateKind {
    Added,
    Removed,
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostNotification {
    StartDebugger,
    StopDebugger,
    DebuggerStopped(DebuggerStopEvent),
    BreakpointUpdated {
        kind: BreakpointUpdateKind,
        breakpoint: Breakpoint,
    },
    SessionChanged {
        reason: SessionChangeReason,
        previous: Option<SessionInfo>,
        current: Option<SessionInfo>,
    },
}

impl HostNotification {
    pub fn method(&self) -> &'static str {
        match self {
            HostNotification::StartDebugger => START_DEBUGGER_METHOD,
            HostNotification::StopDebugger => STOP_DEBUGGER_METHOD,
            HostNotification::DebuggerStopped(_) => DEBUGGER_STOPPED_METHOD,
            HostNotification::BreakpointUpdated { .. } => BREAKPOINT_UPDATED_METHOD,
            HostNotification::SessionChanged { .. } => SESSION_CHANGED_METHOD,
        }
    }
}

/// Receives host notifications. Called from the pipeline thread, so
/// implementations must not block on host work.
pub trait ProtocolNotifier: Send + Sync {
    fn notify(&self, notification: HostNotification);
}

/// Notifier that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullNotifier;

impl ProtocolNotifier for NullNotifier {
    fn notify(&self, _notification: HostNotification) {}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEnvelope {
    pub ts: String,
    pub seq: u64,
    pub method: String,
    pub notification: HostNotification,
}

/// In-process notification bus
#[derive(Clone)]
pub struct NotificationBus {
    sender: Sender<NotificationEnvelope>,
    seq: Arc<AtomicU64>,
}

impl NotificationBus {
    pub fn new_pair() -> (Self, Receiver<NotificationEnvelope>) {
        let (sender, receiver) = channel();
        (
            Self {
                sender,
                seq: Arc::new(AtomicU64::new(0)),
            },
            receiver,
        )
    }
}

impl ProtocolNotifier for NotificationBus {
    fn notify(&self, notification: HostNotification) {
        let envelope = NotificationEnvelope {
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            method: notification.method().to_string(),
            notification,
        };
        // Nobody listening is fine
        let _ = self.sender.send(envelope);
    }
}
