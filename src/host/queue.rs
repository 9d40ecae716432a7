//! Task Queue
//!
//! Double-ended blocking queue feeding the pipeline thread. Many producers,
//! one consumer. The head of the queue is a priority band: items inserted
//! with [`TaskQueue::insert_next`] keep FIFO order among themselves ahead of
//! every appended item. A consumer block taken by one thread holds every other
//! thread's take until the guard drops, so the holder can cancel and reorder
//! work atomically.

use crate::host::cancellation::LinkedToken;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::{Duration, Instant};
use tracing::debug;

const WAIT_SLICE: Duration = Duration::from_millis(25);

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    /// Items at the head that belong to the priority band
    head_band: usize,
    blocked_by: Option<ThreadId>,
    block_depth: usize,
    disposed: bool,
}

impl<T> QueueState<T> {
    fn pop_front(&mut self) -> Option<T> {
        let item = self.items.pop_front()?;
        self.head_band = self.head_band.saturating_sub(1);
        Some(item)
    }

    fn gate_closed_for(&self, thread: ThreadId) -> bool {
        matches!(self.blocked_by, Some(owner) if owner != thread)
    }
}

/// Blocking deque with a consumer gate
#[derive(Debug)]
pub struct TaskQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Condvar,
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                head_band: 0,
                blocked_by: None,
                block_depth: 0,
                disposed: false,
            }),
            available: Condvar::new(),
        }
    }
}

impl<T> TaskQueue<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Insert at the tail. Hands the item back if the queue is disposed.
    pub fn append(&self, item: T) -> Result<(), T> {
        let mut state = self.state.lock();
        if state.disposed {
            return Err(item);
        }
        state.items.push_back(item);
        debug!(len = state.items.len(), "Appended work item");
        drop(state);
        self.available.notify_all();
        Ok(())
    }

    /// Insert behind the items already in the priority band, ahead of every
    /// appended item. Hands the item back if the queue is disposed.
    pub fn insert_next(&self, item: T) -> Result<(), T> {
        let mut state = self.state.lock();
        if state.disposed {
            return Err(item);
        }
        let position = state.head_band;
        state.items.insert(position, item);
        state.head_band += 1;
        debug!(len = state.items.len(), position, "Inserted priority work item");
        drop(state);
        self.available.notify_all();
        Ok(())
    }

    /// Insert at the very head, ahead of the priority band. Hands the item
    /// back if the queue is disposed.
    pub fn prepend(&self, item: T) -> Result<(), T> {
        let mut state = self.state.lock();
        if state.disposed {
            return Err(item);
        }
        state.items.push_front(item);
        state.head_band += 1;
        debug!(len = state.items.len(), "Prepended work item");
        drop(state);
        self.available.notify_all();
        Ok(())
    }

    /// Block until an item can be taken. Returns `None` once disposed.
    pub fn try_take(&self) -> Option<T> {
        let me = std::thread::current().id();
        let mut state = self.state.lock();
        loop {
            if state.disposed {
                return None;
            }
            if !state.gate_closed_for(me) {
                if let Some(item) = state.pop_front() {
                    return Some(item);
                }
            }
            self.available.wait(&mut state);
        }
    }

    /// Take the head without waiting for new items. Still waits out a
    /// consumer block held by another thread.
    pub fn take_now(&self) -> Option<T> {
        let me = std::thread::current().id();
        let mut state = self.state.lock();
        while !state.disposed && state.gate_closed_for(me) {
            self.available.wait(&mut state);
        }
        if state.disposed {
            return None;
        }
        state.pop_front()
    }

    /// Wait until an item is available, the token fires or the timeout
    /// elapses. Returns true when an item is ready.
    pub fn wait_for_item(&self, timeout: Duration, token: &LinkedToken) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.disposed {
                return false;
            }
            if !state.items.is_empty() {
                return true;
            }
            if token.is_cancelled() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let slice = (deadline - now).min(WAIT_SLICE);
            self.available.wait_for(&mut state, slice);
        }
    }

    /// Hold every other thread's take until the returned guard drops.
    /// Reentrant for the thread that already holds the block.
    pub fn block_consumers(self: &Arc<Self>) -> ConsumerBlock<T> {
        let me = std::thread::current().id();
        let mut state = self.state.lock();
        while state.gate_closed_for(me) {
            self.available.wait(&mut state);
        }
        state.blocked_by = Some(me);
        state.block_depth += 1;
        ConsumerBlock {
            queue: Arc::clone(self),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    /// Close the queue, wake every waiter and return what was still pending
    pub fn dispose(&self) -> Vec<T> {
        let mut state = self.state.lock();
        state.disposed = true;
        state.head_band = 0;
        let remaining = state.items.drain(..).collect::<Vec<_>>();
        drop(state);
        self.available.notify_all();
        remaining
    }

    fn release_block(&self) {
        let mut state = self.state.lock();
        state.block_depth = state.block_depth.saturating_sub(1);
        if state.block_depth == 0 {
            state.blocked_by = None;
        }
        drop(state);
        self.available.notify_all();
    }
}

/// Guard returned by [`TaskQueue::block_consumers`]
pub struct ConsumerBlock<T> {
    queue: Arc<TaskQueue<T>>,
}

impl<T> Drop for ConsumerBlock<T> {
    fn drop(&mut self) {
        self.queue.release_block();
    }
}
