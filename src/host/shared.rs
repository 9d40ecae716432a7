//! State reachable from every thread that talks to the host.

use crate::error::HostError;
use crate::host::cancellation::CancellationContext;
use crate::host::debug::DebugContext;
use crate::host::frame::HookRegistry;
use crate::host::options::Priority;
use crate::host::queue::TaskQueue;
use crate::host::state::HostState;
use crate::host::task::{OutcomeKind, WorkItem};
use crate::notify::{HostNotification, ProtocolNotifier};
use crate::reader::{InteractiveSurface, ReaderSlot};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Snapshot of work item counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HostStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: u64,
    pub faulted: u64,
    pub canceled: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    processing: AtomicUsize,
    completed: AtomicU64,
    faulted: AtomicU64,
    canceled: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn begin(&self) {
        self.processing.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn finish(&self, kind: OutcomeKind) {
        self.processing.fetch_sub(1, Ordering::Relaxed);
        self.record(kind);
    }

    pub(crate) fn record(&self, kind: OutcomeKind) {
        let counter = match kind {
            OutcomeKind::Completed => &self.completed,
            OutcomeKind::Faulted => &self.faulted,
            OutcomeKind::Canceled => &self.canceled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

pub(crate) struct HostShared {
    pub(crate) queue: Arc<TaskQueue<WorkItem>>,
    pub(crate) cancellation: Arc<CancellationContext>,
    pub(crate) state: HostState,
    pub(crate) debug: DebugContext,
    pub(crate) hooks: HookRegistry,
    pub(crate) reader: ReaderSlot,
    pub(crate) surface: Arc<dyn InteractiveSurface>,
    pub(crate) notifier: Arc<dyn ProtocolNotifier>,
    pub(crate) stats: StatsCounters,
}

impl HostShared {
    pub(crate) fn new(
        reader: ReaderSlot,
        surface: Arc<dyn InteractiveSurface>,
        notifier: Arc<dyn ProtocolNotifier>,
    ) -> Self {
        Self {
            queue: TaskQueue::new(),
            cancellation: CancellationContext::new(),
            state: HostState::default(),
            debug: DebugContext::default(),
            hooks: HookRegistry::default(),
            reader,
            surface,
            notifier,
            stats: StatsCounters::default(),
        }
    }

    /// Queue a work item. Displacing items cancel the current foreground
    /// work while consumers are held off, so the pipeline thread sees the
    /// new item at the head before it observes the cancellation.
    pub(crate) fn enqueue(&self, item: WorkItem) -> Result<(), HostError> {
        if self.state.is_shutting_down() {
            item.cancel();
            self.stats.record(OutcomeKind::Canceled);
            return Err(HostError::ShuttingDown);
        }

        let options = *item.options();
        let task_id = item.id().as_u64();
        let result = if options.interrupt_current_foreground {
            let _block = self.queue.block_consumers();
            self.cancellation.cancel_current_foreground();
            let pushed = self.queue.prepend(item);
            if pushed.is_ok() {
                self.state.set_skip_next_prompt();
            }
            debug!(task_id, "Queued displacing work item");
            pushed
        } else {
            debug!(task_id, priority = ?options.priority, "Queued work item");
            match options.priority {
                Priority::Next => self.queue.insert_next(item),
                Priority::Normal => self.queue.append(item),
            }
        };

        result.map_err(|item| {
            item.cancel();
            self.stats.record(OutcomeKind::Canceled);
            HostError::QueueClosed
        })
    }

    pub(crate) fn notify(&self, notification: HostNotification) {
        debug!(method = notification.method(), "Sending host notification");
        self.notifier.notify(notification);
    }

    pub(crate) fn stats(&self) -> HostStats {
        HostStats {
            pending: self.queue.len(),
            processing: self.stats.processing.load(Ordering::Relaxed),
            completed: self.stats.completed.load(Ordering::Relaxed),
            faulted: self.stats.faulted.load(Ordering::Relaxed),
            canceled: self.stats.canceled.load(Ordering::Relaxed),
        }
    }
}
