//! Host State: lifecycle signals and the flags shared with producer threads.

use crate::host::frame::FrameKind;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::thread::ThreadId;
use tokio::sync::watch;

/// Value resolved at most once and awaited by any number of observers
#[derive(Debug)]
pub struct Signal<T> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone> Default for Signal<T> {
    fn default() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }
}

impl<T: Clone> Signal<T> {
    /// Resolve the signal. Returns false if it was already resolved.
    pub fn resolve(&self, value: T) -> bool {
        let mut value = Some(value);
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = value.take();
            true
        })
    }

    pub fn get(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(value) = rx.borrow_and_update().clone() {
                return value;
            }
            // The sender lives as long as `self`
            if rx.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }

    /// Block the calling thread until resolved
    pub fn wait_blocking(&self) -> T {
        futures::executor::block_on(self.wait())
    }
}

/// Process-wide host flags
#[derive(Debug)]
pub struct HostState {
    /// Resolved with true once startup work drained, false if startup failed
    pub started: Signal<bool>,
    /// Resolved once the pipeline thread ends; Err carries a top-level fault
    pub stopped: Signal<Result<(), String>>,
    start_claimed: AtomicBool,
    shutting_down: AtomicBool,
    skip_next_prompt: AtomicBool,
    resetting_session: AtomicBool,
    exit_requested: AtomicBool,
    awaiting_input: AtomicBool,
    frame_depth: AtomicUsize,
    top_kind: AtomicU8,
    pipeline_thread: Mutex<Option<ThreadId>>,
}

impl Default for HostState {
    fn default() -> Self {
        Self {
            started: Signal::default(),
            stopped: Signal::default(),
            start_claimed: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            skip_next_prompt: AtomicBool::new(false),
            resetting_session: AtomicBool::new(false),
            exit_requested: AtomicBool::new(false),
            awaiting_input: AtomicBool::new(false),
            frame_depth: AtomicUsize::new(0),
            top_kind: AtomicU8::new(0),
            pipeline_thread: Mutex::new(None),
        }
    }
}

impl HostState {
    /// True for exactly one caller
    pub fn claim_start(&self) -> bool {
        self.start_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn begin_shutdown(&self) -> bool {
        !self.shutting_down.swap(true, Ordering::AcqRel)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub fn set_skip_next_prompt(&self) {
        self.skip_next_prompt.store(true, Ordering::Release);
    }

    /// Clear the flag, returning whether it was set
    pub fn take_skip_next_prompt(&self) -> bool {
        self.skip_next_prompt.swap(false, Ordering::AcqRel)
    }

    /// True for the caller that moves the flag from clear to set
    pub fn try_begin_reset(&self) -> bool {
        self.resetting_session
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn end_reset(&self) {
        self.resetting_session.store(false, Ordering::Release);
    }

    pub fn is_resetting(&self) -> bool {
        self.resetting_session.load(Ordering::Acquire)
    }

    pub fn set_exit_requested(&self, value: bool) {
        self.exit_requested.store(value, Ordering::Release);
    }

    pub fn exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::Acquire)
    }

    pub fn set_awaiting_input(&self, value: bool) {
        self.awaiting_input.store(value, Ordering::Release);
    }

    pub fn is_awaiting_input(&self) -> bool {
        self.awaiting_input.load(Ordering::Acquire)
    }

    /// Mirror of the frame stack shape for producer threads
    pub fn publish_frames(&self, depth: usize, top: Option<FrameKind>) {
        self.frame_depth.store(depth, Ordering::Release);
        self.top_kind
            .store(top.map(FrameKind::bits).unwrap_or(0), Ordering::Release);
    }

    pub fn frame_depth(&self) -> usize {
        self.frame_depth.load(Ordering::Acquire)
    }

    pub fn top_kind(&self) -> FrameKind {
        FrameKind::from_bits(self.top_kind.load(Ordering::Acquire))
    }

    pub fn set_pipeline_thread(&self, id: ThreadId) {
        *self.pipeline_thread.lock() = Some(id);
    }

    pub fn is_pipeline_thread(&self) -> bool {
        *self.pipeline_thread.lock() == Some(std::thread::current().id())
    }
}
