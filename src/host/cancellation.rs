//! Cancellation Context
//!
//! A stack of cancellation scopes owned jointly by the pipeline thread (which
//! enters and leaves scopes) and producer threads (which cancel them). Every
//! scope owns an independent token source; cancelling one scope never flips a
//! token that a later scope will be created from.

use futures::future::{select_all, FutureExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A token that is cancelled when any of its sources is cancelled
#[derive(Debug, Clone, Default)]
pub struct LinkedToken {
    sources: Vec<CancellationToken>,
}

impl LinkedToken {
    /// A token that can never be cancelled
    pub fn none() -> Self {
        Self::default()
    }

    pub fn new(source: CancellationToken) -> Self {
        Self {
            sources: vec![source],
        }
    }

    /// Combine with another token; the result fires when either does
    pub fn linked_with(&self, other: &LinkedToken) -> Self {
        let mut sources = self.sources.clone();
        sources.extend(other.sources.iter().cloned());
        Self { sources }
    }

    pub fn is_cancelled(&self) -> bool {
        self.sources.iter().any(|s| s.is_cancelled())
    }

    /// Resolves once any source is cancelled. Never resolves for [`LinkedToken::none`].
    pub async fn cancelled(&self) {
        if self.sources.is_empty() {
            futures::future::pending::<()>().await;
            return;
        }
        let waits = self
            .sources
            .iter()
            .map(|s| s.cancelled().boxed())
            .collect::<Vec<_>>();
        let _ = select_all(waits).await;
    }

    /// Block the calling thread until cancelled or the timeout elapses.
    /// Returns true if the token was cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_cancelled() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(10)));
        }
    }
}

impl From<CancellationToken> for LinkedToken {
    fn from(token: CancellationToken) -> Self {
        Self::new(token)
    }
}

/// Identifier of a scope on the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(u64);

impl ScopeId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        ScopeId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug)]
struct ScopeEntry {
    id: ScopeId,
    parent: Option<ScopeId>,
    source: CancellationToken,
    is_idle: bool,
}

/// Stack of cancellation scopes
#[derive(Debug, Default)]
pub struct CancellationContext {
    scopes: Mutex<Vec<ScopeEntry>>,
}

impl CancellationContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Push a scope. The returned guard pops it when dropped.
    pub fn enter_scope(
        self: &Arc<Self>,
        is_idle: bool,
        linked: Option<&LinkedToken>,
    ) -> CancellationScope {
        let source = CancellationToken::new();
        let id = ScopeId::next();
        let mut scopes = self.scopes.lock();
        let parent = scopes.last().map(|s| s.id);
        scopes.push(ScopeEntry {
            id,
            parent,
            source: source.clone(),
            is_idle,
        });
        debug!(scope = id.0, is_idle, depth = scopes.len(), "Entered cancellation scope");
        drop(scopes);

        let own = LinkedToken::new(source);
        let token = match linked {
            Some(external) => own.linked_with(external),
            None => own,
        };
        CancellationScope {
            id,
            parent,
            is_idle,
            token,
            context: Arc::clone(self),
        }
    }

    /// Cancel the scope on top of the stack only
    pub fn cancel_current_task(&self) {
        let scopes = self.scopes.lock();
        if let Some(top) = scopes.last() {
            debug!(scope = top.id.0, "Cancelling current scope");
            top.source.cancel();
        }
    }

    /// Cancel from the top of the stack down through the nearest non-idle
    /// scope sitting below an idle scope. Does nothing when no idle scope is
    /// on the stack.
    pub fn cancel_idle_parent_task(&self) {
        let scopes = self.scopes.lock();
        if !scopes.iter().any(|s| s.is_idle) {
            return;
        }
        let mut seen_idle = false;
        for scope in scopes.iter().rev() {
            scope.source.cancel();
            if scope.is_idle {
                seen_idle = true;
            } else if seen_idle {
                debug!(scope = scope.id.0, "Cancelled idle parent scope");
                break;
            }
        }
    }

    /// Cancel every scope on the stack
    pub fn cancel_current_task_stack(&self) {
        let scopes = self.scopes.lock();
        debug!(depth = scopes.len(), "Cancelling entire scope stack");
        for scope in scopes.iter().rev() {
            scope.source.cancel();
        }
    }

    /// Cancel whatever currently runs in the foreground. While idle
    /// processing is on top, that is the scope the idle work was entered from.
    pub fn cancel_current_foreground(&self) {
        let top_is_idle = self.scopes.lock().last().map(|s| s.is_idle).unwrap_or(false);
        if top_is_idle {
            self.cancel_idle_parent_task();
        } else {
            self.cancel_current_task();
        }
    }

    /// Token of the scope on top of the stack
    pub fn current_token(&self) -> LinkedToken {
        self.scopes
            .lock()
            .last()
            .map(|s| LinkedToken::new(s.source.clone()))
            .unwrap_or_default()
    }

    pub fn depth(&self) -> usize {
        self.scopes.lock().len()
    }

    fn exit_scope(&self, id: ScopeId) {
        let mut scopes = self.scopes.lock();
        if let Some(pos) = scopes.iter().rposition(|s| s.id == id) {
            scopes.remove(pos);
        }
    }
}

/// RAII handle for an entered scope
#[derive(Debug)]
pub struct CancellationScope {
    id: ScopeId,
    parent: Option<ScopeId>,
    is_idle: bool,
    token: LinkedToken,
    context: Arc<CancellationContext>,
}

impl CancellationScope {
    pub fn id(&self) -> ScopeId {
        self.id
    }

    pub fn parent(&self) -> Option<ScopeId> {
        self.parent
    }

    pub fn is_idle(&self) -> bool {
        self.is_idle
    }

    /// Combined token: the scope's own source plus any linked external token
    pub fn token(&self) -> &LinkedToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for CancellationScope {
    fn drop(&mut self) {
        self.context.exit_scope(self.id);
    }
}
