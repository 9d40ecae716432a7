//! Execution frame stack and runspace stack.
//!
//! Only the pipeline thread touches a [`FrameStack`]. The [`HookRegistry`] is
//! the one piece other threads read, to tell whether an incoming session
//! event comes from the session that currently owns the hooks.

use crate::engine::{ScriptEngine, Session, SessionId, SessionInfo};
use crate::host::events::SessionEventSink;
use crate::notify::SessionChangeReason;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;
use tracing::debug;

/// Composable frame kind flags
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FrameKind(u8);

impl FrameKind {
    pub const NORMAL: FrameKind = FrameKind(0);
    pub const NESTED: FrameKind = FrameKind(1);
    pub const DEBUG: FrameKind = FrameKind(1 << 1);
    pub const REMOTE: FrameKind = FrameKind(1 << 2);
    pub const REPL: FrameKind = FrameKind(1 << 4);

    pub fn contains(self, other: FrameKind) -> bool {
        self.0 & other.0 == other.0
    }

    /// Flags present in both
    pub fn intersect(self, other: FrameKind) -> FrameKind {
        FrameKind(self.0 & other.0)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Self {
        FrameKind(bits)
    }
}

impl BitOr for FrameKind {
    type Output = FrameKind;

    fn bitor(self, rhs: FrameKind) -> FrameKind {
        FrameKind(self.0 | rhs.0)
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        for (flag, name) in [
            (FrameKind::NESTED, "nested"),
            (FrameKind::DEBUG, "debug"),
            (FrameKind::REMOTE, "remote"),
            (FrameKind::REPL, "repl"),
        ] {
            if self.contains(flag) {
                names.push(name);
            }
        }
        if names.is_empty() {
            write!(f, "normal")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

impl fmt::Debug for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameKind({})", self)
    }
}

/// One nesting level: an engine instance plus what kind of loop runs on it
#[derive(Clone)]
pub struct ExecutionFrame {
    pub engine: Arc<dyn ScriptEngine>,
    pub session: Arc<dyn Session>,
    pub kind: FrameKind,
}

impl ExecutionFrame {
    pub fn new(engine: Arc<dyn ScriptEngine>, kind: FrameKind) -> Self {
        let session = engine.session();
        Self {
            engine,
            session,
            kind,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session.id()
    }
}

impl fmt::Debug for ExecutionFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionFrame")
            .field("session", &self.session_id())
            .field("kind", &self.kind)
            .finish()
    }
}

/// A distinct engine session with its metadata
#[derive(Clone)]
pub struct RunspaceFrame {
    pub session: Arc<dyn Session>,
    pub info: SessionInfo,
}

/// Runspace stack transition reported to observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionChange {
    pub reason: SessionChangeReason,
    pub previous: Option<SessionInfo>,
    pub current: Option<SessionInfo>,
}

/// Registration table of session event hooks, keyed by session identity
#[derive(Clone, Default)]
pub struct HookRegistry {
    entries: Arc<RwLock<HashMap<SessionId, Arc<dyn Session>>>>,
}

impl HookRegistry {
    pub fn register(&self, session: &Arc<dyn Session>, sink: SessionEventSink) {
        let id = session.id();
        session.set_event_sink(Some(sink));
        self.entries.write().insert(id, Arc::clone(session));
        debug!(session = %id, "Registered session hooks");
    }

    pub fn unregister(&self, session: &Arc<dyn Session>) {
        let id = session.id();
        if self.entries.write().remove(&id).is_some() {
            session.set_event_sink(None);
            debug!(session = %id, "Unregistered session hooks");
        }
    }

    pub fn is_registered(&self, session: SessionId) -> bool {
        self.entries.read().contains_key(&session)
    }

    pub fn registered(&self) -> Vec<SessionId> {
        self.entries.read().keys().copied().collect()
    }
}

/// Execution frames paired with the runspaces they run against
pub struct FrameStack {
    frames: Vec<ExecutionFrame>,
    runspaces: Vec<RunspaceFrame>,
    hooks: HookRegistry,
    sink: SessionEventSink,
}

impl FrameStack {
    pub fn new(hooks: HookRegistry, sink: SessionEventSink) -> Self {
        Self {
            frames: Vec::new(),
            runspaces: Vec::new(),
            hooks,
            sink,
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn runspace_depth(&self) -> usize {
        self.runspaces.len()
    }

    pub fn top(&self) -> Option<&ExecutionFrame> {
        self.frames.last()
    }

    pub fn top_kind(&self) -> Option<FrameKind> {
        self.frames.last().map(|f| f.kind)
    }

    pub fn current_runspace(&self) -> Option<&RunspaceFrame> {
        self.runspaces.last()
    }

    pub fn hooks(&self) -> &HookRegistry {
        &self.hooks
    }

    /// Push a frame, moving the session hooks onto its session. Reports a
    /// change when the frame brings a session not already on top.
    pub fn push(&mut self, frame: ExecutionFrame) -> Option<SessionChange> {
        if let Some(previous) = self.frames.last() {
            self.hooks.unregister(&previous.session);
        }

        let new_session = frame.session_id();
        let shares_session = self.runspaces.last().map(|r| r.info.id) == Some(new_session);
        let change = if shares_session {
            None
        } else {
            let previous = self.runspaces.last().map(|r| r.info.clone());
            let info = frame.session.info();
            self.runspaces.push(RunspaceFrame {
                session: Arc::clone(&frame.session),
                info: info.clone(),
            });
            Some(SessionChange {
                reason: SessionChangeReason::Enter,
                previous,
                current: Some(info),
            })
        };

        self.hooks.register(&frame.session, self.sink.clone());
        debug!(
            depth = self.frames.len() + 1,
            frame_kind = %frame.kind,
            session = %new_session,
            "Pushed execution frame"
        );
        self.frames.push(frame);
        change
    }

    /// Pop the top frame and hand the hooks back to the frame below.
    /// `reason` labels the runspace change if the session differs.
    pub fn pop(
        &mut self,
        reason: SessionChangeReason,
    ) -> Option<(ExecutionFrame, Option<SessionChange>)> {
        let frame = self.frames.pop()?;
        self.hooks.unregister(&frame.session);

        let popped_session = frame.session_id();
        let next_session = self.frames.last().map(|f| f.session_id());
        let change = if next_session != Some(popped_session) {
            let previous = self.runspaces.pop().map(|r| r.info);
            Some(SessionChange {
                reason,
                previous,
                current: self.runspaces.last().map(|r| r.info.clone()),
            })
        } else {
            None
        };

        if let Some(top) = self.frames.last() {
            self.hooks.register(&top.session, self.sink.clone());
        }
        debug!(
            depth = self.frames.len(),
            frame_kind = %frame.kind,
            session = %popped_session,
            "Popped execution frame"
        );
        Some((frame, change))
    }
}
